//! Queue configuration types.

use dq_core::Value;

/// Which end of the pending list a push lands on.
///
/// Both strategies pop from the tail (`RPOP`/`RPOPLPUSH`); they differ
/// only in which end `push` writes to, which is enough to flip
/// delivery order. `Fifo` prepends so the oldest entry sinks to the
/// tail and is popped first; `Lifo` appends so the newest entry sits
/// at the tail and is popped first.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Strategy {
    /// Pops return values in push order (oldest first).
    #[default]
    Fifo,
    /// Pops return values in reverse push order (newest first).
    Lifo,
}

/// The result of a successful [`Queue::pop`](crate::Queue::pop) or
/// [`Queue::blocking_pop`](crate::Queue::blocking_pop).
///
/// `payload` already has the "no payload was set" fallback applied:
/// it equals `key` whenever the task carries no distinct payload.
/// Callers choose their own return shape from here rather than the
/// queue baking a `return_key` flag into the call, which keeps the
/// call site explicit about which value it actually wants.
#[derive(Clone, Debug, PartialEq)]
pub struct PopOutcome {
    /// The task's key.
    pub key: Value,
    /// The task's payload, or the key itself if none was set.
    pub payload: Value,
}

impl PopOutcome {
    /// Returns `(key, payload)`, matching `return_key = true`.
    pub fn into_key_and_payload(self) -> (Value, Value) {
        (self.key, self.payload)
    }

    /// Returns just the payload (or the key, if no payload was set),
    /// matching `return_key = false`.
    pub fn into_value(self) -> Value {
        self.payload
    }
}
