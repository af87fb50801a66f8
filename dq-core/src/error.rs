//! Crate-wide error type.

use thiserror::Error;

use crate::codec::CodecError;

/// Error type shared by `dq-queue` and `dq-scheduler`.
///
/// Splits three ways: configuration, transport, and format failures.
#[derive(Debug, Error)]
pub enum DqError {
    /// Invalid configuration, detected synchronously at construction or
    /// registration time (empty namespace, unknown strategy, a pipe
    /// target that isn't a compatible queue, ...).
    #[error("invalid dq configuration: {0}")]
    Config(String),

    /// The Redis connection or a Redis command failed.
    #[error("redis store error: {0}")]
    Store(#[from] redis::RedisError),

    /// Packing or unpacking a value failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl DqError {
    /// Builds a [`DqError::Config`] from any displayable message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
