//! Span codec — the universal on-media record.
//!
//! A span occupies a contiguous, 8-byte-aligned byte range. Its first 8
//! bytes pack a 2-bit type tag into the top bits and a 62-bit extra field
//! into the remainder, exactly as `span.h`'s `enum span_type` describes.
//! Polymorphism is modeled as a tagged variant, not a class hierarchy:
//! decoding is pattern matching on the tag bits.

use crate::error::{Result, StreamError};
use crate::runtime::PmemRuntime;
use crate::stream::layout::{align_up, popcount_memory};

pub const SPAN_HEADER_SIZE: u64 = 8;
pub const ENTRY_METADATA_SIZE: u64 = 8; // the popcount word
const TYPE_SHIFT: u32 = 62;
const TYPE_MASK: u64 = 0b11 << TYPE_SHIFT;
const EXTRA_MASK: u64 = !TYPE_MASK;

/// Largest value the 62-bit extra field can hold — the maximum size of
/// any single span.
pub const MAX_SPAN_EXTRA: u64 = EXTRA_MASK;

const TAG_EMPTY: u64 = 0b00;
const TAG_ENTRY: u64 = 0b10;
const TAG_REGION: u64 = 0b11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanType {
    Empty,
    Entry,
    Region,
}

/// Flags controlling whether `create_entry` flushes immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppendFlags {
    pub no_flush: bool,
}

impl AppendFlags {
    pub const IMMEDIATE: AppendFlags = AppendFlags { no_flush: false };
    pub const DEFERRED: AppendFlags = AppendFlags { no_flush: true };
}

/// Decoded metadata for a span at some offset, mirroring `span_runtime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanRuntime {
    Empty { total_size: u64 },
    Region { total_size: u64 },
    Entry { total_size: u64, data_offset: u64, data_size: u64, popcount: u64 },
}

impl SpanRuntime {
    pub fn total_size(&self) -> u64 {
        match *self {
            SpanRuntime::Empty { total_size } => total_size,
            SpanRuntime::Region { total_size } => total_size,
            SpanRuntime::Entry { total_size, .. } => total_size,
        }
    }

    pub fn span_type(&self) -> SpanType {
        match self {
            SpanRuntime::Empty { .. } => SpanType::Empty,
            SpanRuntime::Region { .. } => SpanType::Region,
            SpanRuntime::Entry { .. } => SpanType::Entry,
        }
    }
}

#[inline]
fn read_word(runtime: &dyn PmemRuntime, offset: u64) -> u64 {
    debug_assert_eq!(offset % SPAN_HEADER_SIZE, 0, "span offset must be 8-byte aligned");
    unsafe {
        let ptr = runtime.base_ptr().add(offset as usize) as *const u64;
        std::ptr::read_volatile(ptr)
    }
}

fn encode_header(tag: u64, extra: u64) -> u64 {
    debug_assert!(extra <= MAX_SPAN_EXTRA, "span extra field overflows 62 bits");
    (tag << TYPE_SHIFT) | (extra & EXTRA_MASK)
}

fn write_header(runtime: &dyn PmemRuntime, offset: u64, word: u64, flags: AppendFlags) {
    let dst = unsafe { runtime.base_ptr().add(offset as usize) };
    let bytes = word.to_ne_bytes();
    unsafe {
        if flags.no_flush {
            runtime.memcpy_nondrain(dst, bytes.as_ptr(), bytes.len());
        } else {
            runtime.memcpy_persist(dst, bytes.as_ptr(), bytes.len());
        }
    }
}

/// Create an empty (free) span of `data_size` bytes at `offset`.
pub fn create_empty(runtime: &dyn PmemRuntime, offset: u64, data_size: u64) {
    let word = encode_header(TAG_EMPTY, data_size);
    write_header(runtime, offset, word, AppendFlags::IMMEDIATE);
}

/// Create a region span spanning `size` bytes (including its own
/// 8-byte header) at `offset`.
pub fn create_region(runtime: &dyn PmemRuntime, offset: u64, size: u64) {
    let word = encode_header(TAG_REGION, size);
    write_header(runtime, offset, word, AppendFlags::IMMEDIATE);
}

/// Create an entry span at `offset`: header, popcount word, then payload.
///
/// `flags.no_flush` defers flushing the bytes written — the caller then
/// owns flushing the exact `[offset, offset + total_size)` extent later
/// via [`flush_extent`]. `Stream::append` always uses the immediate-flush
/// default, so `no_flush` is available to callers that manage their own
/// batched flushing but is not exercised by the stream core itself.
pub fn create_entry(runtime: &dyn PmemRuntime, offset: u64, data: &[u8], flags: AppendFlags) {
    let popcount = popcount_memory(data);
    let header_word = encode_header(TAG_ENTRY, data.len() as u64);

    let header_dst = unsafe { runtime.base_ptr().add(offset as usize) };
    let popcount_offset = offset + SPAN_HEADER_SIZE;
    let popcount_dst = unsafe { runtime.base_ptr().add(popcount_offset as usize) };
    let data_offset = popcount_offset + ENTRY_METADATA_SIZE;
    let data_dst = unsafe { runtime.base_ptr().add(data_offset as usize) };

    let header_bytes = header_word.to_ne_bytes();
    let popcount_bytes = popcount.to_ne_bytes();

    unsafe {
        runtime.memcpy_nondrain(header_dst, header_bytes.as_ptr(), header_bytes.len());
        runtime.memcpy_nondrain(popcount_dst, popcount_bytes.as_ptr(), popcount_bytes.len());
        if !data.is_empty() {
            runtime.memcpy_nondrain(data_dst, data.as_ptr(), data.len());
        }
    }
    if !flags.no_flush {
        let total = entry_total_size(data.len() as u64);
        unsafe_flush_and_drain(runtime, offset, total);
    }
}

fn unsafe_flush_and_drain(runtime: &dyn PmemRuntime, offset: u64, len: u64) {
    unsafe {
        let addr = runtime.base_ptr().add(offset as usize);
        runtime.flush(addr, len as usize);
        runtime.drain();
    }
}

/// Flush a byte extent previously written with `no_flush` set.
pub fn flush_extent(runtime: &dyn PmemRuntime, offset: u64, len: u64) {
    unsafe_flush_and_drain(runtime, offset, len);
}

pub fn entry_total_size(data_len: u64) -> u64 {
    align_up(SPAN_HEADER_SIZE + ENTRY_METADATA_SIZE + data_len, SPAN_HEADER_SIZE)
}

pub fn region_total_size(data_len: u64) -> u64 {
    align_up(SPAN_HEADER_SIZE + data_len, SPAN_HEADER_SIZE)
}

pub fn empty_total_size(data_size: u64) -> u64 {
    align_up(SPAN_HEADER_SIZE + data_size, SPAN_HEADER_SIZE)
}

/// Decode the span at `offset`, asserting nothing about its tag.
pub fn get_runtime(runtime: &dyn PmemRuntime, offset: u64) -> Result<SpanRuntime> {
    let word = read_word(runtime, offset);
    let tag = word >> TYPE_SHIFT;
    let extra = word & EXTRA_MASK;

    match tag {
        TAG_EMPTY => Ok(SpanRuntime::Empty { total_size: empty_total_size(extra) }),
        TAG_REGION => Ok(SpanRuntime::Region { total_size: align_up(extra, SPAN_HEADER_SIZE) }),
        TAG_ENTRY => {
            let popcount_offset = offset + SPAN_HEADER_SIZE;
            let popcount = read_word(runtime, popcount_offset);
            let data_offset = popcount_offset + ENTRY_METADATA_SIZE;
            Ok(SpanRuntime::Entry {
                total_size: entry_total_size(extra),
                data_offset,
                data_size: extra,
                popcount,
            })
        }
        _ => Err(StreamError::Corrupt(format!(
            "invalid span tag {:#04b} at offset {offset}",
            tag
        ))),
    }
}

/// Like `get_runtime`, but a programmer error (wrong tag) panics instead
/// of returning `ERR_CORRUPT` — this path is for call sites that already
/// know the tag (e.g. the allocator reading back a region it just wrote),
/// where a tag mismatch means a bug in this crate, not on-media
/// corruption.
pub fn get_entry_runtime(runtime: &dyn PmemRuntime, offset: u64) -> Result<SpanRuntime> {
    let rt = get_runtime(runtime, offset)?;
    assert_eq!(rt.span_type(), SpanType::Entry, "span at {offset} is not an entry");
    Ok(rt)
}

pub fn get_region_runtime(runtime: &dyn PmemRuntime, offset: u64) -> Result<SpanRuntime> {
    let rt = get_runtime(runtime, offset)?;
    assert_eq!(rt.span_type(), SpanType::Region, "span at {offset} is not a region");
    Ok(rt)
}

pub fn get_empty_runtime(runtime: &dyn PmemRuntime, offset: u64) -> Result<SpanRuntime> {
    let rt = get_runtime(runtime, offset)?;
    assert_eq!(rt.span_type(), SpanType::Empty, "span at {offset} is not empty");
    Ok(rt)
}

/// Read an entry's payload bytes out of the mapped region.
///
/// # Safety
/// `entry` must describe an `Entry` span that is fully within `runtime`'s
/// mapped range.
pub unsafe fn entry_payload<'a>(runtime: &'a dyn PmemRuntime, entry: &SpanRuntime) -> &'a [u8] {
    match *entry {
        SpanRuntime::Entry { data_offset, data_size, .. } => {
            std::slice::from_raw_parts(runtime.base_ptr().add(data_offset as usize), data_size as usize)
        }
        _ => panic!("entry_payload called on a non-entry span"),
    }
}
