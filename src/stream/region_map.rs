//! Region runtime map.
//!
//! One `RegionRuntime` per region currently known to this process: its
//! in-DRAM append cursor, plus a small state machine tracking whether that
//! cursor has been recovered from the on-media span tiling yet. Multiple
//! threads may race to be the one that recovers a given region (e.g. two
//! producers both appending to the same region right after `Stream::open`);
//! exactly one does the scan, the rest wait.
//!
//! `RegionRuntime` carries no per-region flush bookkeeping: `Stream::append`
//! writes each entry with an immediate flush (see `stream::core`'s Open
//! Question (a) note), so by the time a producer's ring slot goes idle the
//! entry's bytes are already durable. A flush-batching scheme keyed off
//! `append_offset` alone was tried and dropped — `append_offset` is bumped
//! by `reserve` before the entry is written, so a concurrent `persist` could
//! observe the bumped cursor and mark that extent flushed before the write
//! actually happened, permanently skipping it. See DESIGN.md.
//!
//! Keyed by region offset in a `parking_lot::RwLock<hashbrown::HashMap<..>>`,
//! the same pairing the teacher cache uses for its process-local lookup
//! table over the shared region.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use log::{debug, warn};
use parking_lot::RwLock;

use crate::error::{Result, StreamError};
use crate::runtime::PmemRuntime;
use crate::stream::span::{self, SpanRuntime};

const NOT_RECOVERED: u8 = 0;
const RECOVERY_IN_PROGRESS: u8 = 1;
const RECOVERED: u8 = 2;

/// Observable outcome of a region's recovery scan: corruption truncates the
/// region rather than failing it outright, and is reported via
/// `RegionRuntime::recovery_status` instead of staying silent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionRecoveryStatus {
    /// Recovery has not run for this region yet (or is in progress).
    Pending,
    /// Scan reached a never-written (`Empty`) span or the region's data
    /// end cleanly — no corruption observed.
    Clean,
    /// Scan stopped early because of an undecodable span tag or a
    /// popcount mismatch (torn write); entries before the stop offset are
    /// intact, everything from there on was discarded.
    Truncated,
}

/// Bound on the spin-wait a thread does for a concurrent recovery to
/// finish before giving up and reporting corruption. Recovery is a bounded
/// scan over a single region, so a well-behaved recoverer finishes in
/// microseconds; this is a deadlock backstop, not a real timeout.
const RECOVERY_WAIT_SPINS: u32 = 200_000;

/// Per-region append cursor and recovery state, shared across every
/// handle to the same open stream.
pub struct RegionRuntime {
    append_offset: AtomicU64,
    recovery_state: AtomicU8,
    /// Set once a recovery scan stops on an inconsistency rather than a
    /// clean boundary. Never reset — a region that was ever truncated
    /// stays reported as such for the life of this runtime.
    truncated: std::sync::atomic::AtomicBool,
}

impl RegionRuntime {
    fn new() -> Self {
        RegionRuntime {
            append_offset: AtomicU64::new(0),
            recovery_state: AtomicU8::new(NOT_RECOVERED),
            truncated: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Observable recovery outcome for this region.
    pub fn recovery_status(&self) -> RegionRecoveryStatus {
        if !self.is_recovered() {
            return RegionRecoveryStatus::Pending;
        }
        if self.truncated.load(Ordering::Acquire) {
            RegionRecoveryStatus::Truncated
        } else {
            RegionRecoveryStatus::Clean
        }
    }

    pub fn append_offset(&self) -> u64 {
        self.append_offset.load(Ordering::Acquire)
    }

    /// Reserve `size` bytes for a new entry, returning the offset it
    /// should be written at. The caller is responsible for writing the
    /// entry span there before any later reservation is read back.
    pub fn reserve(&self, size: u64) -> u64 {
        self.append_offset.fetch_add(size, Ordering::AcqRel)
    }

    fn is_recovered(&self) -> bool {
        self.recovery_state.load(Ordering::Acquire) == RECOVERED
    }

    fn try_begin_recovery(&self) -> bool {
        self.recovery_state
            .compare_exchange(
                NOT_RECOVERED,
                RECOVERY_IN_PROGRESS,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn finish_recovery(&self, append_offset: u64, truncated: bool) {
        self.append_offset.store(append_offset, Ordering::Release);
        self.truncated.store(truncated, Ordering::Release);
        self.recovery_state.store(RECOVERED, Ordering::Release);
    }

    fn wait_until_recovered(&self) -> Result<()> {
        for _ in 0..RECOVERY_WAIT_SPINS {
            if self.is_recovered() {
                return Ok(());
            }
            std::thread::yield_now();
        }
        Err(StreamError::Corrupt(
            "timed out waiting for concurrent region recovery to finish".into(),
        ))
    }

    /// Mark a just-allocated (never-written) region as recovered outright:
    /// there is nothing to scan, its append cursor starts right after the
    /// region span's own header.
    fn mark_fresh(&self, data_start: u64) {
        self.append_offset.store(data_start, Ordering::Release);
        self.recovery_state.store(RECOVERED, Ordering::Release);
    }
}

#[derive(Default)]
pub struct RegionRuntimesMap {
    map: RwLock<HashMap<u64, Arc<RegionRuntime>>>,
}

impl RegionRuntimesMap {
    pub fn new() -> Self {
        RegionRuntimesMap { map: RwLock::new(HashMap::new()) }
    }

    fn get_or_create(&self, region_offset: u64) -> Arc<RegionRuntime> {
        if let Some(rt) = self.map.read().get(&region_offset) {
            return Arc::clone(rt);
        }
        let mut map = self.map.write();
        Arc::clone(
            map.entry(region_offset)
                .or_insert_with(|| Arc::new(RegionRuntime::new())),
        )
    }

    /// Register a region this process just allocated — no recovery scan
    /// needed, its data area is known empty.
    pub fn insert_fresh(&self, region_offset: u64, data_start: u64) -> Arc<RegionRuntime> {
        let rt = self.get_or_create(region_offset);
        rt.mark_fresh(data_start);
        rt
    }

    pub fn remove(&self, region_offset: u64) {
        self.map.write().remove(&region_offset);
    }

    /// Get this region's runtime, recovering it from the on-media span
    /// tiling first if nobody has yet. Safe for multiple threads to call
    /// concurrently for the same region: exactly one performs the scan.
    pub fn get_or_recover(
        &self,
        region_offset: u64,
        region_data_size: u64,
        runtime: &dyn PmemRuntime,
    ) -> Result<Arc<RegionRuntime>> {
        let rt = self.get_or_create(region_offset);
        if rt.is_recovered() {
            return Ok(rt);
        }
        if rt.try_begin_recovery() {
            let data_start = region_offset + span::SPAN_HEADER_SIZE;
            let (append_offset, truncated) = scan_region(runtime, data_start, region_data_size)?;
            debug!(
                "region {region_offset} recovered: append_offset={append_offset}, truncated={truncated}"
            );
            rt.finish_recovery(append_offset, truncated);
        } else {
            rt.wait_until_recovered()?;
        }
        Ok(rt)
    }
}

/// Walk entry spans from `data_start` for up to `data_size` bytes,
/// verifying each one's popcount, and return the offset just past the
/// last intact entry, plus whether the scan stopped because of an
/// inconsistency rather than a clean boundary. A never-written `Empty`
/// span or running off the end of the region's data area is the clean
/// case; an undecodable tag, a `Region` span appearing where an entry was
/// expected, or a popcount mismatch (torn write) is a truncation.
fn scan_region(runtime: &dyn PmemRuntime, data_start: u64, data_size: u64) -> Result<(u64, bool)> {
    let end = data_start + data_size;
    let mut offset = data_start;

    while offset + span::SPAN_HEADER_SIZE <= end {
        let rt = match span::get_runtime(runtime, offset) {
            Ok(rt) => rt,
            Err(_) => {
                warn!("region scan: undecodable span tag at offset {offset}, truncating here");
                return Ok((offset, true));
            }
        };

        match rt {
            SpanRuntime::Empty { .. } => {
                debug!("region scan: stopped cleanly at never-written span, offset {offset}");
                return Ok((offset, false));
            }
            SpanRuntime::Region { .. } => {
                warn!("region scan: unexpected region span at offset {offset}, truncating here");
                return Ok((offset, true));
            }
            SpanRuntime::Entry { total_size, .. } => {
                if offset + total_size > end {
                    warn!("region scan: entry at offset {offset} overruns region data area, truncating here");
                    return Ok((offset, true));
                }
                let payload = unsafe { span::entry_payload(runtime, &rt) };
                let actual_popcount = crate::stream::layout::popcount_memory(payload);
                let SpanRuntime::Entry { popcount: stored_popcount, .. } = rt else {
                    unreachable!()
                };
                if actual_popcount != stored_popcount {
                    warn!("region scan: popcount mismatch at offset {offset} (torn write), truncating here");
                    return Ok((offset, true));
                }
                offset += total_size;
            }
        }
    }

    Ok((offset, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MmapRuntime;
    use crate::stream::span::AppendFlags;
    use std::sync::Arc as StdArc;

    #[test]
    fn fresh_region_recovers_to_its_data_start_without_scanning() {
        let map = RegionRuntimesMap::new();
        let rt = map.insert_fresh(0, 8);
        assert_eq!(rt.append_offset(), 8);
    }

    #[test]
    fn recover_walks_entries_and_stops_at_first_empty_span() {
        let runtime: StdArc<dyn PmemRuntime> = StdArc::new(MmapRuntime::anonymous(4096).unwrap());
        let data_start = span::SPAN_HEADER_SIZE;
        span::create_entry(&*runtime, data_start, b"one", AppendFlags::IMMEDIATE);
        let after_one = data_start + span::entry_total_size(3);
        span::create_entry(&*runtime, after_one, b"two", AppendFlags::IMMEDIATE);
        let after_two = after_one + span::entry_total_size(3);
        // Rest of the region is zeroed (TAG_EMPTY, extra 0) by the
        // anonymous mapping, i.e. "never written".

        let map = RegionRuntimesMap::new();
        let rt = map
            .get_or_recover(0, 4096 - span::SPAN_HEADER_SIZE, &*runtime)
            .unwrap();
        assert_eq!(rt.append_offset(), after_two);
    }

    #[test]
    fn recover_truncates_at_popcount_mismatch() {
        let runtime: StdArc<dyn PmemRuntime> = StdArc::new(MmapRuntime::anonymous(4096).unwrap());
        let data_start = span::SPAN_HEADER_SIZE;
        span::create_entry(&*runtime, data_start, b"good", AppendFlags::IMMEDIATE);
        let after_good = data_start + span::entry_total_size(4);
        span::create_entry(&*runtime, after_good, b"torn!!!!", AppendFlags::IMMEDIATE);

        // Simulate a torn write: corrupt one payload byte after the
        // popcount word was already persisted, without updating it.
        let payload_offset = after_good + span::SPAN_HEADER_SIZE + span::ENTRY_METADATA_SIZE;
        unsafe {
            let ptr = runtime.base_ptr().add(payload_offset as usize);
            *ptr ^= 0xff;
        }

        let map = RegionRuntimesMap::new();
        let rt = map
            .get_or_recover(0, 4096 - span::SPAN_HEADER_SIZE, &*runtime)
            .unwrap();
        assert_eq!(rt.append_offset(), after_good, "torn entry must not count toward the append cursor");
        assert_eq!(rt.recovery_status(), RegionRecoveryStatus::Truncated);
    }

    #[test]
    fn recover_reports_clean_status_when_scan_hits_an_empty_span() {
        let runtime: StdArc<dyn PmemRuntime> = StdArc::new(MmapRuntime::anonymous(4096).unwrap());
        let data_start = span::SPAN_HEADER_SIZE;
        span::create_entry(&*runtime, data_start, b"one", AppendFlags::IMMEDIATE);

        let map = RegionRuntimesMap::new();
        let rt = map
            .get_or_recover(0, 4096 - span::SPAN_HEADER_SIZE, &*runtime)
            .unwrap();
        assert_eq!(rt.recovery_status(), RegionRecoveryStatus::Clean);
    }

    #[test]
    fn second_caller_waits_for_in_progress_recovery_instead_of_rescanning() {
        let runtime: StdArc<dyn PmemRuntime> = StdArc::new(MmapRuntime::anonymous(4096).unwrap());
        let map = StdArc::new(RegionRuntimesMap::new());

        // Force the region into RECOVERY_IN_PROGRESS without finishing it,
        // from this thread, then finish it, then have a second "caller"
        // confirm it observes the already-recovered state rather than
        // racing a scan of its own.
        let rt = map.get_or_create(0);
        assert!(rt.try_begin_recovery());
        rt.finish_recovery(123, false);

        let map2 = StdArc::clone(&map);
        let got = std::thread::spawn(move || map2.get_or_recover(0, 4096, &*runtime).unwrap())
            .join()
            .unwrap();
        assert_eq!(got.append_offset(), 123);
    }
}
