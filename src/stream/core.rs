//! The `Stream` handle — append, persist, and the three-cursor timestamp
//! model (persisted <= committed <= reserved) tying the ring, region map,
//! and allocator together.

use std::path::Path;
use std::sync::Arc;

use log::{debug, info, trace};
use parking_lot::Mutex;

use crate::config::{PersistMode, StreamConfig};
use crate::error::{Result, StreamError};
use crate::runtime::{MmapRuntime, PmemRuntime};
use crate::stream::allocator::RegionAllocator;
use crate::stream::layout;
use crate::stream::region_map::{RegionRecoveryStatus, RegionRuntimesMap};
use crate::stream::ring::TimestampRing;
use crate::stream::span::{self, AppendFlags};
use crate::thread_id::{self, ThreadIdPool};

/// Where in `Header` a given `u64` field lives, by field offset.
mod field {
    use crate::stream::layout::Header;
    pub const STREAM_SIZE: u64 = std::mem::offset_of!(Header, stream_size) as u64;
    pub const BLOCK_SIZE: u64 = std::mem::offset_of!(Header, block_size) as u64;
    pub const PERSISTED_TIMESTAMP: u64 = std::mem::offset_of!(Header, persisted_timestamp) as u64;
}

/// Result of a successful `Stream::append`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    /// Timestamp this entry committed at (1-based).
    pub timestamp: u64,
    pub region_offset: u64,
    pub entry_offset: u64,
}

pub struct Stream {
    runtime: Arc<dyn PmemRuntime>,
    allocator: RegionAllocator,
    region_runtimes: RegionRuntimesMap,
    ring: TimestampRing,
    thread_pool: Arc<ThreadIdPool>,
    config: StreamConfig,
    persist_lock: Mutex<()>,
}

impl Stream {
    /// Create a new stream backed by a fresh file at `path`, `stream_size`
    /// bytes (including the header).
    pub fn create<P: AsRef<Path>>(path: P, stream_size: u64, config: StreamConfig) -> Result<Self> {
        config.validate()?;
        if stream_size <= layout::usable_offset() {
            return Err(StreamError::InvalidArgument(format!(
                "stream_size {stream_size} must exceed the header size {}",
                layout::usable_offset()
            )));
        }
        let runtime: Arc<dyn PmemRuntime> = Arc::new(MmapRuntime::create(path, stream_size as usize)?);
        Self::init_on(runtime, stream_size, config)
    }

    /// Create a stream over an already-open runtime (used by callers who
    /// manage their own backing storage, and by tests).
    pub fn create_with_runtime(
        runtime: Arc<dyn PmemRuntime>,
        stream_size: u64,
        config: StreamConfig,
    ) -> Result<Self> {
        config.validate()?;
        if stream_size <= layout::usable_offset() {
            return Err(StreamError::InvalidArgument(format!(
                "stream_size {stream_size} must exceed the header size {}",
                layout::usable_offset()
            )));
        }
        Self::init_on(runtime, stream_size, config)
    }

    fn init_on(runtime: Arc<dyn PmemRuntime>, stream_size: u64, config: StreamConfig) -> Result<Self> {
        let signature = layout::padded_signature();
        layout::write_bytes_persist(&*runtime, 0, &signature);
        layout::write_u64_persist(&*runtime, field::STREAM_SIZE, stream_size);
        layout::write_u64_persist(&*runtime, field::BLOCK_SIZE, config.block_size);
        layout::write_u64_persist(&*runtime, field::PERSISTED_TIMESTAMP, layout::INVALID_TIMESTAMP);

        let usable_offset = layout::usable_offset();
        let usable_size = stream_size - usable_offset;
        let allocator = RegionAllocator::initialize(Arc::clone(&runtime), usable_offset, usable_size, config.block_size);

        Ok(Stream {
            runtime,
            allocator,
            region_runtimes: RegionRuntimesMap::new(),
            ring: TimestampRing::new(config.max_concurrency, config.ring_capacity),
            thread_pool: Arc::new(ThreadIdPool::new(config.max_concurrency)),
            config,
            persist_lock: Mutex::new(()),
        })
    }

    /// Open an existing stream file, recovering every region's append
    /// cursor from its span tiling before returning.
    pub fn open<P: AsRef<Path>>(path: P, config: StreamConfig) -> Result<Self> {
        config.validate()?;
        let runtime: Arc<dyn PmemRuntime> = Arc::new(MmapRuntime::open(path)?);
        Self::open_on(runtime, config)
    }

    pub fn open_with_runtime(runtime: Arc<dyn PmemRuntime>, config: StreamConfig) -> Result<Self> {
        config.validate()?;
        Self::open_on(runtime, config)
    }

    fn open_on(runtime: Arc<dyn PmemRuntime>, config: StreamConfig) -> Result<Self> {
        let expected = layout::padded_signature();
        let found = layout::read_bytes(&*runtime, 0, layout::SIGNATURE_SIZE);
        if found != expected {
            return Err(StreamError::Corrupt("signature mismatch: not a stream file".into()));
        }

        let stream_size = layout::read_u64(&*runtime, field::STREAM_SIZE);
        let block_size = layout::read_u64(&*runtime, field::BLOCK_SIZE);
        let persisted_timestamp = layout::read_u64(&*runtime, field::PERSISTED_TIMESTAMP);

        let usable_offset = layout::usable_offset();
        if stream_size <= usable_offset {
            return Err(StreamError::Corrupt(format!("implausible stream_size {stream_size} in header")));
        }
        let usable_size = stream_size - usable_offset;

        let allocator = RegionAllocator::recover(Arc::clone(&runtime), usable_offset, usable_size, block_size)?;

        let region_runtimes = RegionRuntimesMap::new();
        let mut region_offsets = Vec::new();
        allocator.foreach_region(|offset| region_offsets.push(offset));
        let region_count = region_offsets.len();
        for offset in region_offsets {
            let total = allocator
                .region_size(offset)
                .expect("region just enumerated by foreach_region must still be present");
            region_runtimes.get_or_recover(offset, total - span::SPAN_HEADER_SIZE, &*runtime)?;
        }

        let ring = TimestampRing::new(config.max_concurrency, config.ring_capacity);
        // Resume counting from the last durable point; anything granted
        // after that but lost in the crash is simply forgotten, matching
        // the "next-to-commit" convention documented in ring.rs.
        ring.reset(persisted_timestamp);

        info!(
            "stream opened: stream_size={stream_size}, block_size={block_size}, {region_count} regions recovered, persisted_timestamp={persisted_timestamp}"
        );

        Ok(Stream {
            runtime,
            allocator,
            region_runtimes,
            ring,
            thread_pool: Arc::new(ThreadIdPool::new(config.max_concurrency)),
            config,
            persist_lock: Mutex::new(()),
        })
    }

    /// Allocate a new region of at least `size` usable bytes. Returns its
    /// offset, to be passed to `append`/`region_entries`.
    pub fn create_region(&self, size: u64) -> Result<u64> {
        let offset = self.allocator.allocate(size)?;
        self.region_runtimes.insert_fresh(offset, offset + span::SPAN_HEADER_SIZE);
        Ok(offset)
    }

    /// Free a region. The caller must not hold onto offsets from
    /// `region_entries`/`append` for this region afterward.
    pub fn remove_region(&self, region_offset: u64) -> Result<()> {
        self.region_runtimes.remove(region_offset);
        self.allocator.free(region_offset)
    }

    /// Append `data` as a new entry in `region_offset`, returning the
    /// timestamp it committed at.
    ///
    /// The calling thread is assigned a stable producer id; if every
    /// producer slot is in use this returns `Overflow`, same as ring
    /// exhaustion, and the caller should back off and retry.
    ///
    /// The ring timestamp is acquired before region space is reserved, so
    /// that among entries landing in the same region, byte order matches
    /// acquisition order. A producer that acquires a timestamp and then
    /// finds the region full must still call `produce` on it — leaving
    /// whatever fraction of the region it reserved tiled as an empty span
    /// rather than a torn, half-written entry — or every later consumer
    /// stalls behind the unpublished slot forever.
    pub fn append(&self, region_offset: u64, data: &[u8]) -> Result<AppendResult> {
        let producer_id = thread_id::producer_id_for(&self.thread_pool).ok_or(StreamError::Overflow)?;

        let region_total = self
            .allocator
            .region_size(region_offset)
            .ok_or_else(|| StreamError::InvalidArgument(format!("no region at {region_offset}")))?;
        let region_rt = self.region_runtimes.get_or_recover(
            region_offset,
            region_total - span::SPAN_HEADER_SIZE,
            &*self.runtime,
        )?;

        let entry_total = span::entry_total_size(data.len() as u64);

        let reserved = loop {
            match self.ring.acquire(producer_id, 1) {
                Ok(offset) => break offset,
                Err(StreamError::Overflow) => {
                    trace!("ring full, producer {producer_id} retrying acquire");
                    std::thread::yield_now();
                    continue;
                }
                Err(e) => return Err(e),
            }
        };

        // From here on the ring slot must be released (`produce`) no
        // matter what, or every later `consume`/`persist` stalls forever
        // behind this producer's open reservation.
        let region_end = region_offset + region_total;
        let entry_offset = region_rt.reserve(entry_total);
        if entry_offset + entry_total > region_end {
            // The region didn't have room; tile whatever fraction of it we
            // just claimed as an empty span so the span tiling stays
            // gapless, then release the ring slot before reporting the
            // error — the reservation itself must not strand it.
            if entry_offset < region_end {
                let remaining = region_end - entry_offset;
                if remaining >= span::SPAN_HEADER_SIZE {
                    span::create_empty(&*self.runtime, entry_offset, remaining - span::SPAN_HEADER_SIZE);
                }
            }
            self.ring.produce(producer_id)?;
            debug!("append: region {region_offset} full at offset {entry_offset}, releasing reserved timestamp {}", reserved + 1);
            return Err(StreamError::NoSpace);
        }

        // The entry is flushed immediately (the immediate-flush default),
        // so once `produce` makes this slot idle the bytes are already
        // durable — `persist` only needs to advance the header watermark,
        // not re-flush per-region extents.
        span::create_entry(&*self.runtime, entry_offset, data, AppendFlags::IMMEDIATE);
        self.ring.produce(producer_id)?;

        let result = AppendResult {
            timestamp: reserved + 1,
            region_offset,
            entry_offset,
        };

        if self.config.persist_mode == PersistMode::Sync {
            self.persist(Some(result.timestamp))?;
        }

        Ok(result)
    }

    /// Advance the durable `persisted_timestamp` up to `up_to` (or as far
    /// as is currently committed, if `None`). Returns the new
    /// `persisted_timestamp`.
    ///
    /// Every entry's bytes are already flushed by the time it is produced
    /// (`append` writes with an immediate flush), so nothing short of the
    /// header watermark itself needs flushing here; a `drain` is still
    /// issued first so the watermark write is never observed durable ahead
    /// of any entry flush still in flight on another core.
    pub fn persist(&self, up_to: Option<u64>) -> Result<u64> {
        let _guard = self.persist_lock.lock();

        let committed = self.committed_timestamp();
        let target = up_to.map(|t| t.min(committed)).unwrap_or(committed);
        let current = self.persisted_timestamp();
        if target <= current {
            trace!("persist: nothing to do, persisted_timestamp already at {current}");
            return Ok(current);
        }

        self.runtime.drain();
        layout::write_u64_persist(&*self.runtime, field::PERSISTED_TIMESTAMP, target);
        debug!("persist: advanced persisted_timestamp {current} -> {target}");

        Ok(target)
    }

    /// Highest timestamp known to have been fully produced by every
    /// active producer: `consumed_offset + 1`. Pulls the ring's consumed
    /// cursor forward first.
    pub fn committed_timestamp(&self) -> u64 {
        let max_producer = self.config.max_concurrency.saturating_sub(1);
        let _ = self.ring.consume(max_producer);
        self.ring.get_consumed_offset() + 1
    }

    pub fn persisted_timestamp(&self) -> u64 {
        layout::read_u64(&*self.runtime, field::PERSISTED_TIMESTAMP)
    }

    /// Read back every entry currently appended to `region_offset`, in
    /// order. Reads whatever has been appended in this process, whether
    /// or not it has been persisted yet.
    pub fn region_entries(&self, region_offset: u64) -> Result<Vec<Vec<u8>>> {
        let region_total = self
            .allocator
            .region_size(region_offset)
            .ok_or_else(|| StreamError::InvalidArgument(format!("no region at {region_offset}")))?;
        let region_rt = self.region_runtimes.get_or_recover(
            region_offset,
            region_total - span::SPAN_HEADER_SIZE,
            &*self.runtime,
        )?;

        let end = region_rt.append_offset();
        let mut offset = region_offset + span::SPAN_HEADER_SIZE;
        let mut out = Vec::new();
        while offset < end {
            let rt = span::get_entry_runtime(&*self.runtime, offset)?;
            let payload = unsafe { span::entry_payload(&*self.runtime, &rt) };
            out.push(payload.to_vec());
            offset += rt.total_size();
        }
        Ok(out)
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Observable recovery outcome for `region_offset`: whether its scan
    /// found a clean boundary or had to truncate on an inconsistency.
    /// Triggers recovery (if not already done) the same as
    /// `append`/`region_entries` would.
    pub fn region_recovery_status(&self, region_offset: u64) -> Result<RegionRecoveryStatus> {
        let region_total = self
            .allocator
            .region_size(region_offset)
            .ok_or_else(|| StreamError::InvalidArgument(format!("no region at {region_offset}")))?;
        let region_rt = self.region_runtimes.get_or_recover(
            region_offset,
            region_total - span::SPAN_HEADER_SIZE,
            &*self.runtime,
        )?;
        Ok(region_rt.recovery_status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MmapRuntime;

    fn stream(stream_size: u64, config: StreamConfig) -> Stream {
        let runtime: Arc<dyn PmemRuntime> = Arc::new(MmapRuntime::anonymous(stream_size as usize).unwrap());
        Stream::create_with_runtime(runtime, stream_size, config).unwrap()
    }

    #[test]
    fn append_persist_reopen_and_iterate_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.data");
        let config = StreamConfig::default();

        let region_offset = {
            let s = Stream::create(&path, 1 << 20, config).unwrap();
            let region = s.create_region(4096).unwrap();
            s.append(region, b"alpha").unwrap();
            s.append(region, b"beta").unwrap();
            s.persist(None).unwrap();
            region
        };

        let reopened = Stream::open(&path, config).unwrap();
        let entries = reopened.region_entries(region_offset).unwrap();
        assert_eq!(entries, vec![b"alpha".to_vec(), b"beta".to_vec()]);
        assert!(reopened.persisted_timestamp() >= 2);
    }

    #[test]
    fn two_producers_commit_a_contiguous_range_with_no_gaps() {
        let s = Arc::new(stream(1 << 20, StreamConfig::default()));
        let region = s.create_region(1 << 16).unwrap();

        let handles: Vec<_> = (0..2)
            .map(|p| {
                let s = Arc::clone(&s);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        s.append(region, format!("p{p}-{i}").as_bytes()).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let committed = s.committed_timestamp();
        assert_eq!(committed, 1001, "committed_timestamp should cover all 1000 entries with no gap");
        assert_eq!(s.region_entries(region).unwrap().len(), 1000);
    }

    #[test]
    fn persist_is_idempotent_and_never_goes_backward() {
        let s = stream(1 << 16, StreamConfig::default());
        let region = s.create_region(4096).unwrap();
        s.append(region, b"one").unwrap();
        let first = s.persist(None).unwrap();
        let second = s.persist(None).unwrap();
        assert_eq!(first, second);
        assert_eq!(s.persisted_timestamp(), first);
    }

    #[test]
    fn sync_persist_mode_flushes_on_every_append() {
        let config = StreamConfig { persist_mode: PersistMode::Sync, ..StreamConfig::default() };
        let s = stream(1 << 16, config);
        let region = s.create_region(4096).unwrap();
        let result = s.append(region, b"payload").unwrap();
        assert_eq!(s.persisted_timestamp(), result.timestamp);
    }

    #[test]
    fn append_to_unknown_region_is_rejected() {
        let s = stream(1 << 16, StreamConfig::default());
        assert!(s.append(12345, b"x").is_err());
    }

    #[test]
    fn popcount_corruption_truncates_region_and_reports_status() {
        // Flip a bit in an entry's payload, reopen, and the region
        // recovers truncated at that entry while the allocator itself is
        // unaffected.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.data");
        let config = StreamConfig::default();

        let (region_offset, corrupt_offset) = {
            let s = Stream::create(&path, 1 << 20, config).unwrap();
            let region = s.create_region(4096).unwrap();
            s.append(region, b"one").unwrap();
            s.append(region, b"two").unwrap();
            let corrupted = s.append(region, b"three").unwrap();
            s.append(region, b"four").unwrap();
            s.persist(None).unwrap();
            (region, corrupted.entry_offset)
        };

        {
            let runtime = MmapRuntime::open(&path).unwrap();
            let payload_offset =
                corrupt_offset + span::SPAN_HEADER_SIZE + span::ENTRY_METADATA_SIZE;
            unsafe {
                let ptr = runtime.base_ptr().add(payload_offset as usize);
                *ptr ^= 0xff;
            }
            runtime.drain();
        }

        let reopened = Stream::open(&path, config).unwrap();
        let entries = reopened.region_entries(region_offset).unwrap();
        assert_eq!(entries, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(
            reopened.region_recovery_status(region_offset).unwrap(),
            RegionRecoveryStatus::Truncated
        );

        // Allocator state is untouched by the truncation: the region is
        // still a single region span of its original size.
        let second_region = reopened.create_region(4096).unwrap();
        assert_ne!(second_region, region_offset);
    }

    #[test]
    fn open_rejects_file_without_a_valid_signature() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-stream.data");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        let err = Stream::open(&path, StreamConfig::default()).unwrap_err();
        assert!(matches!(err, StreamError::Corrupt(_)));
    }
}
