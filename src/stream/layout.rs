//! `#[repr(C)]` structures that live directly on the mapped PMEM file.
//!
//! Fields are ordered u64-first to avoid implicit alignment padding, same
//! convention the teacher cache's `shm::layout` uses for its own mmap'd
//! header.

use crate::runtime::PmemRuntime;

/// Signature written at offset 0, left-padded with NUL to 64 bytes.
pub const SIGNATURE: &[u8] = b"PMEMSTREAM";
pub const SIGNATURE_SIZE: usize = 64;

/// Reserved, never handed out as a real timestamp.
pub const INVALID_TIMESTAMP: u64 = 0;

pub const CACHELINE_SIZE: u64 = 64;

/// Bytes reserved in the header for the region allocator's own metadata.
/// The allocator is self-describing from the span tiling alone, so this is
/// a small fixed reservation rather than a variable-size structure — see
/// DESIGN.md.
pub const ALLOCATOR_HEADER_SIZE: usize = 32;

#[repr(C)]
pub struct AllocatorHeader {
    pub _reserved: [u8; ALLOCATOR_HEADER_SIZE],
}

const _: () = assert!(std::mem::size_of::<AllocatorHeader>() == ALLOCATOR_HEADER_SIZE);

/// Stream header, resident at offset 0 of the backing region.
///
/// Padding after `allocator_header` brings the struct up to `HEADER_SIZE`
/// so the usable span-tiling area starts at a fixed, 8-byte-aligned offset
/// regardless of target platform struct packing.
#[repr(C)]
pub struct Header {
    pub signature: [u8; SIGNATURE_SIZE], // 0..64
    pub stream_size: u64,                // 64..72
    pub block_size: u64,                 // 72..80
    pub persisted_timestamp: u64,        // 80..88
    pub allocator_header: AllocatorHeader, // 88..120
    pub _pad: [u8; HEADER_SIZE - 120],
}

pub const HEADER_SIZE: usize = 256;

const _: () = assert!(std::mem::size_of::<Header>() == HEADER_SIZE);

/// Offset where the span tiling (usable area) begins.
pub const fn usable_offset() -> u64 {
    HEADER_SIZE as u64
}

/// Round `size` up to the next multiple of `align` (`align` must be a
/// power of two). Matches the original's `ALIGN_UP` bit-mask form.
#[inline]
pub const fn align_up(size: u64, align: u64) -> u64 {
    (size + align - 1) & !(align - 1)
}

#[inline]
pub const fn align_down(size: u64, align: u64) -> u64 {
    size & !(align - 1)
}

#[inline]
pub const fn is_pow2(value: u64) -> bool {
    value != 0 && (value & (value - 1)) == 0
}

/// Population count (count of 1-bits) across a byte range, walked 8 bytes
/// at a time with a byte-wise tail — mirrors `util_popcount_memory`.
pub fn popcount_memory(data: &[u8]) -> u64 {
    let mut count = 0u64;
    let chunks = data.chunks_exact(8);
    let remainder = chunks.remainder();
    for chunk in chunks {
        let word = u64::from_ne_bytes(chunk.try_into().unwrap());
        count += word.count_ones() as u64;
    }
    for &byte in remainder {
        count += byte.count_ones() as u64;
    }
    count
}

/// The signature as it actually sits on media: `SIGNATURE` followed by
/// NUL padding out to `SIGNATURE_SIZE`.
pub fn padded_signature() -> [u8; SIGNATURE_SIZE] {
    let mut buf = [0u8; SIGNATURE_SIZE];
    buf[..SIGNATURE.len()].copy_from_slice(SIGNATURE);
    buf
}

/// Borrow `len` bytes starting at `offset` directly out of the mapping.
pub(crate) fn read_bytes<'a>(runtime: &'a dyn PmemRuntime, offset: u64, len: usize) -> &'a [u8] {
    unsafe { std::slice::from_raw_parts(runtime.base_ptr().add(offset as usize), len) }
}

/// Volatile read of a `u64` header field. Used for fields the stream core
/// reads without taking a lock (e.g. `persisted_timestamp`).
pub(crate) fn read_u64(runtime: &dyn PmemRuntime, offset: u64) -> u64 {
    unsafe {
        let ptr = runtime.base_ptr().add(offset as usize) as *const u64;
        std::ptr::read_volatile(ptr)
    }
}

/// Write and durably persist a `u64` header field.
pub(crate) fn write_u64_persist(runtime: &dyn PmemRuntime, offset: u64, value: u64) {
    write_bytes_persist(runtime, offset, &value.to_ne_bytes());
}

/// Write and durably persist an arbitrary byte range of the header.
pub(crate) fn write_bytes_persist(runtime: &dyn PmemRuntime, offset: u64, bytes: &[u8]) {
    unsafe {
        let dst = runtime.base_ptr().add(offset as usize);
        runtime.memcpy_persist(dst, bytes.as_ptr(), bytes.len());
    }
}
