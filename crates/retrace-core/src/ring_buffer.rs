//! Lock-free single-producer single-consumer ring buffer for captured frames.
//!
//! Sits between the capture thread (producer) and the forwarding thread
//! (consumer). No mutexes: each side owns one index and publishes it with
//! release ordering, and reads the other side's index with acquire ordering.
//! Ownership of an element moves into its slot on push and out on pop.

use crate::error::{Result, RetraceError};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Fixed-capacity slot array shared by a [`Producer`] and a [`Consumer`].
///
/// Capacity must be a power of two so index wraparound is a bitmask. One
/// slot is always left empty to tell "full" from "empty", so at most
/// `capacity - 1` elements are queued at once.
pub struct RingBuffer<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
}

// SAFETY: A slot is only touched by the producer while it lies in the free
// region (between write_pos and read_pos) and only by the consumer while it
// lies in the filled region. The acquire/release pairs on the indices order
// the slot accesses, and `Producer`/`Consumer` are not `Clone`, so there is
// exactly one thread on each side.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// Create a ring buffer with `capacity` slots.
    ///
    /// Fails unless `capacity` is a power of two and at least 2.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity < 2 || !capacity.is_power_of_two() {
            return Err(RetraceError::InvalidParameter(format!(
                "ring buffer capacity must be a power of two >= 2, got {capacity}"
            )));
        }

        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            slots,
            mask: capacity - 1,
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
        })
    }

    /// Create a ring buffer and split it into its two endpoints.
    pub fn with_capacity(capacity: usize) -> Result<(Producer<T>, Consumer<T>)> {
        Ok(Self::new(capacity)?.split())
    }

    /// Split into a producer and a consumer handle.
    pub fn split(self) -> (Producer<T>, Consumer<T>) {
        let shared = Arc::new(self);
        (
            Producer {
                shared: Arc::clone(&shared),
            },
            Consumer { shared },
        )
    }

    /// Number of slots (usable capacity is one less).
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Approximate occupancy; a snapshot of both indices.
    pub fn len(&self) -> usize {
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Acquire);
        w.wrapping_sub(r) & self.mask
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        let w = *self.write_pos.get_mut();
        let mut r = *self.read_pos.get_mut();
        while r != w {
            // SAFETY: every slot in [read_pos, write_pos) holds an initialised
            // element that was never popped.
            unsafe { self.slots[r].get_mut().assume_init_drop() };
            r = (r + 1) & self.mask;
        }
    }
}

/// Writing end of a [`RingBuffer`].
pub struct Producer<T> {
    shared: Arc<RingBuffer<T>>,
}

impl<T> Producer<T> {
    /// Push an element without blocking.
    ///
    /// Returns the element back if the buffer is full.
    pub fn push(&mut self, item: T) -> std::result::Result<(), T> {
        let rb = &*self.shared;
        let w = rb.write_pos.load(Ordering::Relaxed);
        let next = (w + 1) & rb.mask;
        if next == rb.read_pos.load(Ordering::Acquire) {
            return Err(item);
        }

        // SAFETY: slot `w` is in the free region; the consumer will not read it
        // until the release store below publishes it.
        unsafe { (*rb.slots[w].get()).write(item) };
        rb.write_pos.store(next, Ordering::Release);
        Ok(())
    }

    /// Approximate number of queued elements.
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }

    /// Whether a push would fail right now.
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity() - 1
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }
}

/// Reading end of a [`RingBuffer`].
pub struct Consumer<T> {
    shared: Arc<RingBuffer<T>>,
}

impl<T> Consumer<T> {
    /// Pop the oldest element without blocking.
    pub fn pop(&mut self) -> Option<T> {
        let rb = &*self.shared;
        let r = rb.read_pos.load(Ordering::Relaxed);
        if r == rb.write_pos.load(Ordering::Acquire) {
            return None;
        }

        // SAFETY: slot `r` was published by the producer's release store, which
        // the acquire load above synchronised with.
        let item = unsafe { (*rb.slots[r].get()).assume_init_read() };
        rb.read_pos.store((r + 1) & rb.mask, Ordering::Release);
        Some(item)
    }

    /// Pop up to `max` elements into `out`. Returns how many were moved.
    pub fn pop_batch(&mut self, out: &mut Vec<T>, max: usize) -> usize {
        let mut moved = 0;
        while moved < max {
            match self.pop() {
                Some(item) => {
                    out.push(item);
                    moved += 1;
                }
                None => break,
            }
        }
        moved
    }

    /// Approximate number of queued elements.
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    #[test]
    fn test_basic_push_pop() {
        let (mut tx, mut rx) = RingBuffer::with_capacity(8).unwrap();
        for i in 0..5 {
            tx.push(i).unwrap();
        }
        assert_eq!(rx.len(), 5);
        for i in 0..5 {
            assert_eq!(rx.pop(), Some(i));
        }
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn test_full_returns_item() {
        let (mut tx, mut rx) = RingBuffer::with_capacity(4).unwrap();
        tx.push(1).unwrap();
        tx.push(2).unwrap();
        tx.push(3).unwrap();
        assert!(tx.is_full());
        assert_eq!(tx.push(4), Err(4));

        assert_eq!(rx.pop(), Some(1));
        tx.push(4).unwrap();
        assert_eq!(rx.pop(), Some(2));
        assert_eq!(rx.pop(), Some(3));
        assert_eq!(rx.pop(), Some(4));
    }

    #[test]
    fn test_wrap_around() {
        let (mut tx, mut rx) = RingBuffer::with_capacity(4).unwrap();
        for round in 0..10 {
            tx.push(round * 2).unwrap();
            tx.push(round * 2 + 1).unwrap();
            assert_eq!(rx.pop(), Some(round * 2));
            assert_eq!(rx.pop(), Some(round * 2 + 1));
        }
        assert!(rx.is_empty());
    }

    #[test]
    fn test_rejects_non_power_of_two() {
        assert!(RingBuffer::<u8>::new(0).is_err());
        assert!(RingBuffer::<u8>::new(1).is_err());
        assert!(RingBuffer::<u8>::new(3).is_err());
        assert!(RingBuffer::<u8>::new(48).is_err());
        assert!(RingBuffer::<u8>::new(64).is_ok());
    }

    #[test]
    fn test_pop_batch() {
        let (mut tx, mut rx) = RingBuffer::with_capacity(16).unwrap();
        for i in 0..10 {
            tx.push(i).unwrap();
        }
        let mut out = Vec::new();
        assert_eq!(rx.pop_batch(&mut out, 4), 4);
        assert_eq!(out, vec![0, 1, 2, 3]);
        assert_eq!(rx.pop_batch(&mut out, 100), 6);
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn test_unconsumed_items_are_dropped() {
        let marker = Arc::new(());
        {
            let (mut tx, mut rx) = RingBuffer::with_capacity(8).unwrap();
            for _ in 0..5 {
                tx.push(Arc::clone(&marker)).unwrap();
            }
            drop(rx.pop());
            assert_eq!(Arc::strong_count(&marker), 5);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_cross_thread_fifo() {
        let (mut tx, mut rx) = RingBuffer::with_capacity(64).unwrap();
        const COUNT: u64 = 100_000;

        let producer = std::thread::spawn(move || {
            let mut next = 0u64;
            while next < COUNT {
                if tx.push(next).is_ok() {
                    next += 1;
                } else {
                    std::hint::spin_loop();
                }
            }
        });

        let mut expected = 0u64;
        while expected < COUNT {
            if let Some(value) = rx.pop() {
                assert_eq!(value, expected);
                expected += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        producer.join().unwrap();
        assert!(rx.pop().is_none());
    }

    proptest! {
        #[test]
        fn prop_matches_fifo_model(ops in proptest::collection::vec(any::<Option<u32>>(), 0..512)) {
            let (mut tx, mut rx) = RingBuffer::with_capacity(16).unwrap();
            let mut model = VecDeque::new();

            for op in ops {
                match op {
                    Some(value) => {
                        let pushed = tx.push(value).is_ok();
                        prop_assert_eq!(pushed, model.len() < 15);
                        if pushed {
                            model.push_back(value);
                        }
                    }
                    None => prop_assert_eq!(rx.pop(), model.pop_front()),
                }
                prop_assert_eq!(rx.len(), model.len());
            }

            while let Some(expected) = model.pop_front() {
                prop_assert_eq!(rx.pop(), Some(expected));
            }
            prop_assert_eq!(rx.pop(), None);
        }
    }
}
