#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

//! Durable, at-least-once work queue backed by Redis.
//!
//! See the crate README for a quick example.

mod config;
mod queue;
mod reclaim;

pub use config::{PopOutcome, Strategy};
pub use dq_core::{Codec, CodecError, ContentKind, DqError, Namespace, Value};
pub use queue::{Queue, QueueBuilder};
pub use reclaim::run_reclaim_loop;
