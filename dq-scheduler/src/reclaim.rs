//! Background rescheduling of dropped leases.

use std::time::Duration;

use tracing::{error, trace};

use crate::scheduler::Scheduler;

/// Runs [`Scheduler::reschedule_dropped_items`] on a fixed interval
/// until the process exits.
///
/// The scheduler analogue of `dq-queue`'s `run_reclaim_loop`: intended
/// to be spawned once per namespace alongside the workers that call
/// `pop_due`.
pub async fn run_reclaim_loop(scheduler: Scheduler, interval: Duration) -> ! {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        trace!(namespace = %scheduler.namespace(), "rescheduling dropped items");
        if let Err(error) = scheduler.reschedule_dropped_items().await {
            error!(namespace = %scheduler.namespace(), %error, "reschedule pass failed");
        }
    }
}
