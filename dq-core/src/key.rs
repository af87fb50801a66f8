//! Redis key construction shared by `dq-queue` and `dq-scheduler`.
//!
//! Key prefixes and suffixes are part of the wire contract: multiple
//! workers, potentially built from different binaries, must
//! interoperate through identical key construction. Centralizing the
//! format here means `dq-queue` and `dq-scheduler` cannot drift from
//! each other or from this document.

use crate::namespace::Namespace;

/// `queue.<ns>`, pending packed values, head = next-out end.
pub fn queue_pending_key(ns: &Namespace) -> String {
    format!("queue.{ns}")
}

/// `queue.<ns>.entries`, dedup set of packed values known to the queue.
pub fn queue_entries_key(ns: &Namespace) -> String {
    format!("queue.{ns}.entries")
}

/// `queue.<ns>.workers`, set of worker identifiers with state in this queue.
pub fn queue_workers_key(ns: &Namespace) -> String {
    format!("queue.{ns}.workers")
}

/// `queue.<ns>.working.<wid>`, packed values leased by worker `wid`.
pub fn queue_working_key(ns: &Namespace, worker_id: &str) -> String {
    format!("queue.{ns}.working.{worker_id}")
}

/// `queue.<ns>.active.<wid>`, worker-`wid` liveness beacon.
pub fn queue_active_key(ns: &Namespace, worker_id: &str) -> String {
    format!("queue.{ns}.active.{worker_id}")
}

/// `queue.<ns>.payload`, packed-value to packed-payload hash.
pub fn queue_payload_key(ns: &Namespace) -> String {
    format!("queue.{ns}.payload")
}

/// `schedule:<ns>:waiting`, packed value to fire-time sorted set.
pub fn schedule_waiting_key(ns: &Namespace) -> String {
    format!("schedule:{ns}:waiting")
}

/// `schedule:<ns>:inprogress`, leased packed value to original fire-time.
pub fn schedule_inprogress_key(ns: &Namespace) -> String {
    format!("schedule:{ns}:inprogress")
}

/// `schedule:<ns>:payload`, packed value to packed payload.
pub fn schedule_payload_key(ns: &Namespace) -> String {
    format!("schedule:{ns}:payload")
}

/// `schedule:<ns>:expiration`, packed value to absolute expiration time.
pub fn schedule_expiration_key(ns: &Namespace) -> String {
    format!("schedule:{ns}:expiration")
}

/// `schedule:<ns>:working`, packed value to lease expiry time.
pub fn schedule_working_key(ns: &Namespace) -> String {
    format!("schedule:{ns}:working")
}

/// `schedule:<ns>:events`, pub/sub channel for the subscribe
/// extension hook; nothing in this crate publishes to it.
pub fn schedule_events_key(ns: &Namespace) -> String {
    format!("schedule:{ns}:events")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_match_the_wire_contract() {
        let ns = Namespace::new("stuff").unwrap();
        assert_eq!(queue_pending_key(&ns), "queue.stuff");
        assert_eq!(queue_entries_key(&ns), "queue.stuff.entries");
        assert_eq!(queue_workers_key(&ns), "queue.stuff.workers");
        assert_eq!(queue_working_key(&ns, "w1"), "queue.stuff.working.w1");
        assert_eq!(queue_active_key(&ns, "w1"), "queue.stuff.active.w1");
        assert_eq!(queue_payload_key(&ns), "queue.stuff.payload");

        assert_eq!(schedule_waiting_key(&ns), "schedule:stuff:waiting");
        assert_eq!(schedule_inprogress_key(&ns), "schedule:stuff:inprogress");
        assert_eq!(schedule_payload_key(&ns), "schedule:stuff:payload");
        assert_eq!(schedule_expiration_key(&ns), "schedule:stuff:expiration");
        assert_eq!(schedule_working_key(&ns), "schedule:stuff:working");
    }
}
