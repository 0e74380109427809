//! Thread-id allocator.
//!
//! Maps each calling thread to a stable small integer in `[0,
//! MAX_CONCURRENCY)` for the lifetime of the thread, releasing the slot
//! when the thread exits.
//!
//! One bitmap per stream, not a process-wide global, so two streams opened
//! by the same thread get independent producer ids.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Hard cap mirrored from the original `PMEMSTREAM_MAX_CONCURRENCY`.
pub const MAX_CONCURRENCY: usize = 64;

#[derive(Debug)]
pub struct ThreadIdPool {
    bitmap: AtomicU64,
    capacity: u32,
}

impl ThreadIdPool {
    pub fn new(capacity: u32) -> Self {
        assert!(
            capacity > 0 && capacity as usize <= MAX_CONCURRENCY,
            "thread id pool capacity out of range"
        );
        ThreadIdPool {
            bitmap: AtomicU64::new(0),
            capacity,
        }
    }

    fn try_acquire(&self) -> Option<u32> {
        let mask: u64 = if self.capacity == 64 {
            u64::MAX
        } else {
            (1u64 << self.capacity) - 1
        };
        loop {
            let current = self.bitmap.load(Ordering::Acquire);
            let free = !current & mask;
            if free == 0 {
                return None;
            }
            let bit = free.trailing_zeros();
            let updated = current | (1u64 << bit);
            if self
                .bitmap
                .compare_exchange_weak(current, updated, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(bit);
            }
        }
    }

    fn release(&self, id: u32) {
        self.bitmap.fetch_and(!(1u64 << id), Ordering::AcqRel);
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// RAII guard releasing a producer id back to its pool when the owning
/// thread's thread-local storage is torn down.
struct ThreadIdSlot {
    pool: Arc<ThreadIdPool>,
    id: u32,
}

impl Drop for ThreadIdSlot {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

thread_local! {
    static ASSIGNED: RefCell<Vec<(usize, ThreadIdSlot)>> = RefCell::new(Vec::new());
}

/// Get (assigning if necessary) this thread's producer id for `pool`.
///
/// Returns `None` if the pool has no free slots — callers should treat
/// this the same as ring overflow: back off and retry.
pub fn producer_id_for(pool: &Arc<ThreadIdPool>) -> Option<u32> {
    let key = Arc::as_ptr(pool) as usize;
    ASSIGNED.with(|cell| {
        let mut assigned = cell.borrow_mut();
        if let Some((_, slot)) = assigned.iter().find(|(k, _)| *k == key) {
            return Some(slot.id);
        }
        let id = pool.try_acquire()?;
        assigned.push((
            key,
            ThreadIdSlot {
                pool: Arc::clone(pool),
                id,
            },
        ));
        Some(id)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_stable_id_to_same_thread() {
        let pool = Arc::new(ThreadIdPool::new(4));
        let a = producer_id_for(&pool).unwrap();
        let b = producer_id_for(&pool).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn exhausts_and_releases_on_thread_exit() {
        let pool = Arc::new(ThreadIdPool::new(2));
        let id0 = producer_id_for(&pool).unwrap();
        let id1 = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || producer_id_for(&pool).unwrap())
                .join()
                .unwrap()
        };
        assert_ne!(id0, id1);
        // Thread that owned id1 has exited, so its slot should be free again.
        let pool2 = Arc::clone(&pool);
        let id2 = std::thread::spawn(move || producer_id_for(&pool2).unwrap())
            .join()
            .unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn reports_none_when_pool_exhausted() {
        let pool = Arc::new(ThreadIdPool::new(1));
        let _id = producer_id_for(&pool).unwrap();
        let pool2 = Arc::clone(&pool);
        let result = std::thread::spawn(move || producer_id_for(&pool2))
            .join()
            .unwrap();
        assert!(result.is_none());
    }
}
