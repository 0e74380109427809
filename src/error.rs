//! Error vocabulary for the stream log.
//!
//! Mirrors the local error kinds named in the design: validation failures
//! are surfaced directly, `Overflow` is expected to be retried by the
//! caller (the stream core retries it internally on the append hot path),
//! and `Corrupt` always comes from a recovery-time integrity check.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no space available")]
    NoSpace,

    #[error("stream is corrupt: {0}")]
    Corrupt(String),

    #[error("timestamp ring overflow")]
    Overflow,

    #[error("pmem io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, StreamError>;
