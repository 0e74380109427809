//! Backing-store collaborator.
//!
//! The PMEM runtime is treated as an external, already-provided
//! collaborator: `base_ptr`, `size`, `memcpy_persist`, `memcpy_nondrain`,
//! `flush`, `drain`, `memset_persist`. The stream core issues no direct
//! system calls and only ever goes through this trait.
//!
//! `MmapRuntime` is this crate's concrete implementation, backed by a
//! memory-mapped file (`memmap2`, the same crate the teacher cache uses
//! for its shared region). Real PMEM durability relies on `clwb`/`clflushopt`
//! plus an `sfence`; ordinary mmap'd files have no such instructions
//! available from portable Rust, so `flush` is implemented as a range
//! `msync` and `drain` as a full memory fence. This is an approximation —
//! documented in DESIGN.md — good enough to exercise the crash-consistency
//! logic above it, not a substitute for real PMEM hardware.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::atomic::{fence, Ordering};

use memmap2::MmapMut;

/// The storage contract the stream core depends on. No direct syscalls
/// happen above this trait.
pub trait PmemRuntime: Send + Sync {
    fn base_ptr(&self) -> *mut u8;
    fn size(&self) -> usize;

    /// Copy `n` bytes from `src` to `dst` and make the write durable
    /// before returning (flush + drain).
    ///
    /// # Safety
    /// `dst` must be a valid, writable range of `n` bytes within this
    /// runtime's mapped region; `src` must be readable for `n` bytes.
    unsafe fn memcpy_persist(&self, dst: *mut u8, src: *const u8, n: usize);

    /// Copy `n` bytes from `src` to `dst` without flushing. Caller must
    /// later `flush` the exact extent written.
    ///
    /// # Safety
    /// Same requirements as `memcpy_persist`.
    unsafe fn memcpy_nondrain(&self, dst: *mut u8, src: *const u8, n: usize);

    /// Flush (but do not drain) `n` bytes starting at `addr`.
    ///
    /// # Safety
    /// `addr` must be within this runtime's mapped region.
    unsafe fn flush(&self, addr: *const u8, n: usize);

    /// Wait for all outstanding flushes to complete.
    fn drain(&self);

    /// Fill `n` bytes at `dst` with byte `b` and make it durable.
    ///
    /// # Safety
    /// `dst` must be a valid, writable range of `n` bytes.
    unsafe fn memset_persist(&self, dst: *mut u8, b: u8, n: usize);
}

/// Memory-mapped-file backed `PmemRuntime`.
pub struct MmapRuntime {
    mmap: MmapMut,
}

impl MmapRuntime {
    /// Create (or truncate) a file of `size` bytes and map it.
    pub fn create<P: AsRef<Path>>(path: P, size: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size as u64)?;
        Self::from_file(file)
    }

    /// Open an existing backing file and map it at its current size.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::from_file(file)
    }

    fn from_file(file: File) -> io::Result<Self> {
        // Safety: we hold exclusive ownership of `file` and its mapping
        // for the lifetime of this `MmapRuntime`.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(MmapRuntime { mmap })
    }

    /// Construct an in-memory (non-file-backed) runtime, useful for tests
    /// that don't need to exercise crash recovery across process restarts.
    pub fn anonymous(size: usize) -> io::Result<Self> {
        let mmap = MmapMut::map_anon(size)?;
        Ok(MmapRuntime { mmap })
    }
}

impl PmemRuntime for MmapRuntime {
    fn base_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    fn size(&self) -> usize {
        self.mmap.len()
    }

    unsafe fn memcpy_persist(&self, dst: *mut u8, src: *const u8, n: usize) {
        self.memcpy_nondrain(dst, src, n);
        self.flush(dst, n);
        self.drain();
    }

    unsafe fn memcpy_nondrain(&self, dst: *mut u8, src: *const u8, n: usize) {
        std::ptr::copy_nonoverlapping(src, dst, n);
    }

    unsafe fn flush(&self, addr: *const u8, n: usize) {
        if n == 0 {
            return;
        }
        let base = self.mmap.as_ptr() as usize;
        let offset = (addr as usize).saturating_sub(base);
        // Best-effort: flush/drain have no Result in the trait, so a
        // failed msync here is swallowed the same way a `clwb` instruction
        // can't fail.
        let _ = self.mmap.flush_range(offset, n);
    }

    fn drain(&self) {
        fence(Ordering::SeqCst);
    }

    unsafe fn memset_persist(&self, dst: *mut u8, b: u8, n: usize) {
        std::ptr::write_bytes(dst, b, n);
        self.flush(dst, n);
        self.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_runtime_roundtrips_bytes() {
        let runtime = MmapRuntime::anonymous(4096).unwrap();
        let payload = b"hello persistent world";
        unsafe {
            runtime.memcpy_persist(runtime.base_ptr(), payload.as_ptr(), payload.len());
            let read = std::slice::from_raw_parts(runtime.base_ptr(), payload.len());
            assert_eq!(read, payload);
        }
    }

    #[test]
    fn memset_persist_fills_range() {
        let runtime = MmapRuntime::anonymous(64).unwrap();
        unsafe {
            runtime.memset_persist(runtime.base_ptr(), 0xAB, 16);
            let read = std::slice::from_raw_parts(runtime.base_ptr(), 16);
            assert!(read.iter().all(|&b| b == 0xAB));
        }
    }

    #[test]
    fn file_backed_runtime_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.data");
        {
            let runtime = MmapRuntime::create(&path, 4096).unwrap();
            unsafe {
                runtime.memcpy_persist(runtime.base_ptr(), b"abc".as_ptr(), 3);
            }
        }
        let runtime = MmapRuntime::open(&path).unwrap();
        let read = unsafe { std::slice::from_raw_parts(runtime.base_ptr(), 3) };
        assert_eq!(read, b"abc");
    }
}
