#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

//! Codec, error, and key-naming primitives shared by `dq-queue` and
//! `dq-scheduler`.

pub mod codec;
pub mod error;
pub mod key;
pub mod namespace;

pub use codec::{Codec, CodecError, ContentKind, StructuredHook, Value};
pub use error::DqError;
pub use namespace::Namespace;
