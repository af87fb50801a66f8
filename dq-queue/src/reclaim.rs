//! Background reclamation of dead workers' leases.

use std::time::Duration;

use tracing::{error, trace};

use crate::queue::Queue;

/// Runs [`Queue::reclaim_tasks`] on a fixed interval until the process
/// exits.
///
/// Intended to be handed to `tokio::spawn` alongside a queue's
/// ordinary workers, running reclamation as an independent periodic
/// process rather than something folded into `pop`. A failed
/// reclamation pass is logged and retried on the next tick rather than
/// ending the loop, since a transient Redis error shouldn't silence
/// reclamation forever.
pub async fn run_reclaim_loop(queue: Queue, interval: Duration) -> ! {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        trace!(namespace = %queue.namespace(), "running reclaim pass");
        if let Err(error) = queue.reclaim_tasks().await {
            error!(namespace = %queue.namespace(), %error, "reclaim pass failed");
        }
    }
}
