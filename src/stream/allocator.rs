//! Region allocator.
//!
//! A first-fit allocator carving/freeing variable-size region spans out of
//! the usable area. The on-media footprint is just the span tiling itself
//! (`Region`/`Empty` spans laid end to end) — the header is self-describing,
//! so a recovery scan rebuilds free-list state from the tiling alone. This
//! struct's `free_spans`/`span_index` maps are a DRAM cache over that
//! tiling, built once at open/recovery and kept in sync with every
//! allocate/free so lookups don't need a rescan.
//!
//! All header (span) mutations follow a write-then-flush discipline via
//! the span codec's immediate-flush default — `create_region`/
//! `create_empty` never defer, since allocator bookkeeping must be durable
//! before `allocate`/`free` returns.

use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Result, StreamError};
use crate::runtime::PmemRuntime;
use crate::stream::layout::align_up;
use crate::stream::span::{self, SpanRuntime, SpanType};

struct AllocatorState {
    /// offset -> total span size, for every span in the usable area
    /// (region and empty alike). Used to find neighbors for coalescing.
    span_index: BTreeMap<u64, u64>,
    /// offset -> total size, subset of `span_index` restricted to `Empty`
    /// spans. The actual first-fit search space.
    free_spans: BTreeMap<u64, u64>,
}

pub struct RegionAllocator {
    runtime: Arc<dyn PmemRuntime>,
    usable_offset: u64,
    usable_size: u64,
    block_size: u64,
    state: Mutex<AllocatorState>,
}

impl RegionAllocator {
    /// Build a fresh allocator over an area that is a single free span.
    pub fn initialize(
        runtime: Arc<dyn PmemRuntime>,
        usable_offset: u64,
        usable_size: u64,
        block_size: u64,
    ) -> Self {
        span::create_empty(&*runtime, usable_offset, usable_size - span::SPAN_HEADER_SIZE);
        let mut span_index = BTreeMap::new();
        let mut free_spans = BTreeMap::new();
        span_index.insert(usable_offset, usable_size);
        free_spans.insert(usable_offset, usable_size);
        RegionAllocator {
            runtime,
            usable_offset,
            usable_size,
            block_size,
            state: Mutex::new(AllocatorState { span_index, free_spans }),
        }
    }

    /// Rebuild allocator state by walking the existing span tiling —
    /// the recovery path run at open.
    pub fn recover(
        runtime: Arc<dyn PmemRuntime>,
        usable_offset: u64,
        usable_size: u64,
        block_size: u64,
    ) -> Result<Self> {
        let mut span_index = BTreeMap::new();
        let mut free_spans = BTreeMap::new();

        let mut offset = usable_offset;
        let end = usable_offset + usable_size;
        while offset < end {
            let rt = span::get_runtime(&*runtime, offset)?;
            let total = rt.total_size();
            if total == 0 || offset + total > end {
                return Err(StreamError::Corrupt(format!(
                    "span at {offset} has implausible size {total}"
                )));
            }
            span_index.insert(offset, total);
            if rt.span_type() == SpanType::Empty {
                free_spans.insert(offset, total);
            }
            offset += total;
        }
        debug!(
            "region allocator recovered {} spans ({} free) over {usable_size} bytes",
            span_index.len(),
            free_spans.len()
        );

        Ok(RegionAllocator {
            runtime,
            usable_offset,
            usable_size,
            block_size,
            state: Mutex::new(AllocatorState { span_index, free_spans }),
        })
    }

    /// Allocate a region whose usable data area is at least
    /// `requested_size` bytes. Returns the region's starting offset.
    pub fn allocate(&self, requested_size: u64) -> Result<u64> {
        let wanted_total = align_up(requested_size + span::SPAN_HEADER_SIZE, self.block_size);

        let mut state = self.state.lock();
        let candidate = state
            .free_spans
            .iter()
            .find(|(_, &size)| size >= wanted_total)
            .map(|(&offset, &size)| (offset, size));

        let (free_offset, free_size) = match candidate {
            Some(v) => v,
            None => return Err(StreamError::NoSpace),
        };

        state.free_spans.remove(&free_offset);

        let remainder = free_size - wanted_total;
        if remainder >= span::SPAN_HEADER_SIZE {
            span::create_region(&*self.runtime, free_offset, wanted_total);
            state.span_index.insert(free_offset, wanted_total);

            let residual_offset = free_offset + wanted_total;
            let residual_data_size = remainder - span::SPAN_HEADER_SIZE;
            span::create_empty(&*self.runtime, residual_offset, residual_data_size);
            state.span_index.insert(residual_offset, remainder);
            state.free_spans.insert(residual_offset, remainder);

            trace!(
                "allocate: carved region at {free_offset} (size {wanted_total}), residual free span at {residual_offset} (size {remainder})"
            );
            Ok(free_offset)
        } else {
            // Remainder too small to host its own span header: grant the
            // whole free span to the region rather than leak it.
            span::create_region(&*self.runtime, free_offset, free_size);
            state.span_index.insert(free_offset, free_size);
            trace!("allocate: granted whole free span at {free_offset} (size {free_size})");
            Ok(free_offset)
        }
    }

    /// Free a region span, re-tagging it empty and coalescing with any
    /// adjacent empty spans in both directions.
    pub fn free(&self, region_offset: u64) -> Result<()> {
        let mut state = self.state.lock();
        let size = *state
            .span_index
            .get(&region_offset)
            .ok_or_else(|| StreamError::InvalidArgument(format!("no span at {region_offset}")))?;

        let mut merged_offset = region_offset;
        let mut merged_size = size;

        // Coalesce with the following span, if it is empty.
        let next = state
            .span_index
            .range((merged_offset + merged_size)..)
            .next()
            .map(|(&o, &s)| (o, s));
        if let Some((next_offset, next_size)) = next {
            if next_offset == merged_offset + merged_size && state.free_spans.contains_key(&next_offset) {
                state.free_spans.remove(&next_offset);
                state.span_index.remove(&next_offset);
                merged_size += next_size;
            }
        }

        // Coalesce with the preceding span, if it is empty.
        let prev = state
            .span_index
            .range(..merged_offset)
            .next_back()
            .map(|(&o, &s)| (o, s));
        if let Some((prev_offset, prev_size)) = prev {
            if prev_offset + prev_size == merged_offset && state.free_spans.contains_key(&prev_offset) {
                state.free_spans.remove(&prev_offset);
                state.span_index.remove(&prev_offset);
                merged_offset = prev_offset;
                merged_size += prev_size;
            }
        }

        state.span_index.remove(&region_offset);
        span::create_empty(&*self.runtime, merged_offset, merged_size - span::SPAN_HEADER_SIZE);
        state.span_index.insert(merged_offset, merged_size);
        state.free_spans.insert(merged_offset, merged_size);

        debug!("free: region {region_offset} ({size} bytes) merged into free span at {merged_offset} ({merged_size} bytes)");
        Ok(())
    }

    /// Invoke `callback(region_offset)` for every region span currently
    /// in the tiling, in offset order.
    pub fn foreach_region<F: FnMut(u64)>(&self, mut callback: F) {
        let state = self.state.lock();
        for (&offset, _) in state.span_index.iter() {
            if !state.free_spans.contains_key(&offset) {
                callback(offset);
            }
        }
    }

    /// Total span size (including its own header) of the region at
    /// `region_offset`, if one is currently allocated there.
    pub fn region_size(&self, region_offset: u64) -> Option<u64> {
        let state = self.state.lock();
        if state.free_spans.contains_key(&region_offset) {
            return None;
        }
        state.span_index.get(&region_offset).copied()
    }

    pub fn usable_offset(&self) -> u64 {
        self.usable_offset
    }

    pub fn usable_size(&self) -> u64 {
        self.usable_size
    }

    /// Total bytes currently available across all free spans. Diagnostic
    /// only; not part of the allocation contract.
    pub fn free_bytes(&self) -> u64 {
        let state = self.state.lock();
        state.free_spans.values().sum()
    }
}

impl Drop for RegionAllocator {
    fn drop(&mut self) {
        let state = self.state.lock();
        if state.free_spans.len() > 1 {
            warn!(
                "region allocator dropped with {} disjoint free spans (fragmentation)",
                state.free_spans.len()
            );
        }
    }
}
