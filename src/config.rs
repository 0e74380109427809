//! Stream configuration.

use crate::error::{Result, StreamError};
use crate::thread_id::MAX_CONCURRENCY;

/// How `Stream::persist` is driven relative to `Stream::append`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistMode {
    /// `append` does not drive the persister; a caller must invoke
    /// `Stream::persist` (possibly from a dedicated background thread).
    Async,
    /// `append` drives `persist` for its own timestamp before returning.
    Sync,
}

#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    /// Power-of-two alignment unit, >= 64 bytes (>= one cache line).
    pub block_size: u64,
    /// Upper bound on concurrently active producers, <= 64.
    pub max_concurrency: u32,
    /// Capacity of the MPMC timestamp ring. Bounds how far
    /// `Stream::append` can outrun `Stream::persist`/consumption before
    /// producers start seeing `Overflow` and must back off.
    pub ring_capacity: u64,
    pub persist_mode: PersistMode,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            block_size: 4096,
            max_concurrency: MAX_CONCURRENCY as u32,
            ring_capacity: 1 << 20,
            persist_mode: PersistMode::Async,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_size < 64 || !self.block_size.is_power_of_two() {
            return Err(StreamError::InvalidArgument(format!(
                "block_size must be a power of two >= 64, got {}",
                self.block_size
            )));
        }
        if self.max_concurrency == 0 || self.max_concurrency as usize > MAX_CONCURRENCY {
            return Err(StreamError::InvalidArgument(format!(
                "max_concurrency must be in [1, {}], got {}",
                MAX_CONCURRENCY, self.max_concurrency
            )));
        }
        if self.ring_capacity == 0 {
            return Err(StreamError::InvalidArgument("ring_capacity must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        StreamConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_block_size() {
        let cfg = StreamConfig {
            block_size: 100,
            ..StreamConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_concurrency_above_cap() {
        let cfg = StreamConfig {
            max_concurrency: 65,
            ..StreamConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
