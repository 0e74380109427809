//! Append-only, durable stream log over byte-addressable persistent memory.
//!
//! This crate implements the hard core of a PMEM stream log: the on-media
//! span format, the region allocator, the lock-free MPMC timestamp ring
//! that arbitrates commit order, and the region runtime map that lazily
//! recovers per-region append offsets. The public user-facing ergonomic
//! API (iterator wrappers, convenience builders) is intentionally out of
//! scope — see [`Stream`] for the internal contract these pieces expose.

pub mod config;
pub mod error;
pub mod runtime;
pub mod stream;
pub mod thread_id;

pub use config::{PersistMode, StreamConfig};
pub use error::{Result, StreamError};
pub use runtime::{MmapRuntime, PmemRuntime};
pub use stream::{AppendResult, RegionRecoveryStatus, Stream};
