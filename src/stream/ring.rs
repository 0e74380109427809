//! Lock-free MPMC timestamp ring.
//!
//! Producers reserve a run of timestamps with `acquire`, write their entry,
//! then call `produce` to mark the reservation complete. `consume` advances
//! `consumed_offset` through the longest contiguous prefix of reservations
//! that have all been produced — the "low watermark" a single reader can
//! safely treat as committed. This mirrors the original `mpmc_queue`: each
//! producer gets one slot holding the start of its in-flight reservation
//! (or an `IDLE` sentinel when it has none), and the consumer advances past
//! the minimum of all active slots.
//!
//! `committed_timestamp` is `consumed_offset + 1` — offsets here are a
//! 0-based count of timestamps granted so far, and the "next-to-commit"
//! convention from the original source is preserved verbatim rather than
//! renumbered to be 1-based internally.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, StreamError};

/// Sentinel meaning "this producer has no outstanding reservation".
const IDLE: u64 = u64::MAX;

pub struct TimestampRing {
    /// Total timestamps ever granted by `acquire`.
    granted_offset: AtomicU64,
    /// Longest contiguous prefix of granted timestamps known to be produced.
    consumed_offset: AtomicU64,
    /// Ring capacity: `acquire` refuses to outrun `consumed_offset` by more
    /// than this many timestamps.
    queue_size: u64,
    /// Per-producer in-flight reservation start, or `IDLE`.
    slots: Vec<AtomicU64>,
}

impl TimestampRing {
    pub fn new(num_producers: u32, queue_size: u64) -> Self {
        let slots = (0..num_producers).map(|_| AtomicU64::new(IDLE)).collect();
        TimestampRing {
            granted_offset: AtomicU64::new(0),
            consumed_offset: AtomicU64::new(0),
            queue_size,
            slots,
        }
    }

    /// Reserve `size` contiguous timestamps for `producer_id`, returning the
    /// offset of the first one. Fails with `Overflow` if doing so would
    /// outrun the ring's capacity; the caller should back off and retry
    /// after `consume` has advanced.
    pub fn acquire(&self, producer_id: u32, size: u64) -> Result<u64> {
        let slot = self.slot(producer_id)?;

        let start = self.granted_offset.fetch_add(size, Ordering::AcqRel);
        let end = start + size;
        let consumed = self.consumed_offset.load(Ordering::Acquire);
        if end - consumed > self.queue_size {
            self.granted_offset.fetch_sub(size, Ordering::AcqRel);
            return Err(StreamError::Overflow);
        }

        slot.store(start, Ordering::Release);
        Ok(start)
    }

    /// Mark `producer_id`'s current reservation complete, making it
    /// eligible for `consume` to advance past.
    pub fn produce(&self, producer_id: u32) -> Result<()> {
        self.slot(producer_id)?.store(IDLE, Ordering::Release);
        Ok(())
    }

    /// Advance `consumed_offset` through the contiguous prefix of
    /// reservations completed by producers `0..=max_producer_id`. Returns
    /// `(advanced_by, new_consumed_offset)`.
    pub fn consume(&self, max_producer_id: u32) -> Result<(u64, u64)> {
        let last = max_producer_id as usize;
        if last >= self.slots.len() {
            return Err(StreamError::InvalidArgument(format!(
                "producer id {max_producer_id} out of range for ring of {} producers",
                self.slots.len()
            )));
        }

        loop {
            let current = self.consumed_offset.load(Ordering::Acquire);
            let mut ready = self.granted_offset.load(Ordering::Acquire);
            for slot in &self.slots[..=last] {
                let v = slot.load(Ordering::Acquire);
                if v != IDLE {
                    ready = ready.min(v);
                }
            }

            if ready <= current {
                return Ok((0, current));
            }

            match self.consumed_offset.compare_exchange_weak(
                current,
                ready,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok((ready - current, ready)),
                Err(_) => continue,
            }
        }
    }

    pub fn get_consumed_offset(&self) -> u64 {
        self.consumed_offset.load(Ordering::Acquire)
    }

    pub fn get_granted_offset(&self) -> u64 {
        self.granted_offset.load(Ordering::Acquire)
    }

    /// Reinitialize both cursors to `offset` and clear all producer slots.
    /// Not safe to call concurrently with `acquire`/`produce`/`consume` —
    /// used only while opening or recovering a stream, before any producer
    /// has been handed a handle to it.
    pub fn reset(&self, offset: u64) {
        self.granted_offset.store(offset, Ordering::Release);
        self.consumed_offset.store(offset, Ordering::Release);
        for slot in &self.slots {
            slot.store(IDLE, Ordering::Release);
        }
    }

    pub fn num_producers(&self) -> u32 {
        self.slots.len() as u32
    }

    fn slot(&self, producer_id: u32) -> Result<&AtomicU64> {
        self.slots.get(producer_id as usize).ok_or_else(|| {
            StreamError::InvalidArgument(format!(
                "producer id {producer_id} out of range for ring of {} producers",
                self.slots.len()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_acquire_produce_consume_advances_one_at_a_time() {
        let ring = TimestampRing::new(1, 16);
        for i in 0..8u64 {
            let start = ring.acquire(0, 1).unwrap();
            assert_eq!(start, i);
            ring.produce(0).unwrap();
            let (advanced, consumed) = ring.consume(0).unwrap();
            assert_eq!(advanced, 1);
            assert_eq!(consumed, i + 1);
        }
    }

    #[test]
    fn ring_capacity_drains_to_full_count_across_producers() {
        // 4 producers, queue size 16, 64 acquires of weight 1 total.
        let ring = TimestampRing::new(4, 16);
        for round in 0..16u64 {
            for producer in 0..4u32 {
                let _ = ring.acquire(producer, 1).unwrap();
                ring.produce(producer).unwrap();
            }
            let _ = round;
        }
        let (_, consumed) = ring.consume(3).unwrap();
        assert_eq!(consumed, 64);
        assert_eq!(ring.get_granted_offset(), 64);
    }

    #[test]
    fn consume_stalls_behind_unproduced_reservation() {
        let ring = TimestampRing::new(2, 16);
        let _ = ring.acquire(0, 1).unwrap();
        // Producer 1 reserves and produces, but producer 0 hasn't yet.
        let _ = ring.acquire(1, 1).unwrap();
        ring.produce(1).unwrap();

        let (advanced, consumed) = ring.consume(1).unwrap();
        assert_eq!(advanced, 0, "must not advance past producer 0's open reservation");
        assert_eq!(consumed, 0);

        ring.produce(0).unwrap();
        let (advanced, consumed) = ring.consume(1).unwrap();
        assert_eq!(advanced, 2);
        assert_eq!(consumed, 2);
    }

    #[test]
    fn acquire_overflows_and_rolls_back_when_queue_is_full() {
        let ring = TimestampRing::new(1, 4);
        for _ in 0..4 {
            ring.acquire(0, 1).unwrap();
            ring.produce(0).unwrap();
        }
        // consumed_offset is still 0 (nobody called consume), so the ring
        // is logically full even though every reservation was produced.
        let err = ring.acquire(0, 1).unwrap_err();
        assert!(matches!(err, StreamError::Overflow));
        assert_eq!(ring.get_granted_offset(), 4, "failed acquire must roll back its fetch_add");

        ring.consume(0).unwrap();
        // Now that consumed_offset caught up, there is room again.
        assert!(ring.acquire(0, 1).is_ok());
    }

    #[test]
    fn reset_reinitializes_both_cursors_and_slots() {
        let ring = TimestampRing::new(2, 16);
        ring.acquire(0, 3).unwrap();
        ring.produce(0).unwrap();
        ring.consume(0).unwrap();

        ring.reset(100);
        assert_eq!(ring.get_consumed_offset(), 100);
        assert_eq!(ring.get_granted_offset(), 100);
        let start = ring.acquire(1, 1).unwrap();
        assert_eq!(start, 100);
    }

    #[test]
    fn acquire_rejects_out_of_range_producer_id() {
        let ring = TimestampRing::new(2, 16);
        assert!(ring.acquire(5, 1).is_err());
        assert!(ring.produce(5).is_err());
        assert!(ring.consume(5).is_err());
    }
}
