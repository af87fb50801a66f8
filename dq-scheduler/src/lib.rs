#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

//! Delayed scheduler backed by Redis, with contention-safe due-task
//! leasing.
//!
//! See the crate README for a quick example.

mod reclaim;
mod scheduler;

pub use dq_core::{Codec, CodecError, ContentKind, DqError, Namespace, Value};
pub use reclaim::run_reclaim_loop;
pub use scheduler::{Scheduler, SchedulerBuilder};
