//! Bounded single-producer / single-consumer ring used for quote fan-out.
//!
//! Design:
//! - Fixed power-of-two capacity (1024), index masking instead of modulo
//! - Monotonic head/tail counters, cache-line padded to avoid false sharing
//! - Producer publishes a slot with a release store, consumer acquires it
//! - Full ring is a non-fatal condition: `push` hands the value back
//!
//! Correct only with exactly one producer and one consumer. The pipeline
//! enforces this by construction: one transport receive thread pushes, one
//! consumer worker thread pops. `Producer`/`Consumer` are intentionally not
//! `Clone`.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;

/// Ring capacity per side per venue. Power of two for fast index masking.
pub const QUEUE_CAPACITY: usize = 1024;

const MASK: usize = QUEUE_CAPACITY - 1;

struct Ring<T> {
    /// Next slot the consumer will read. Written by the consumer only.
    head: CachePadded<AtomicUsize>,
    /// Next slot the producer will write. Written by the producer only.
    tail: CachePadded<AtomicUsize>,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: slot access is partitioned by the head/tail protocol; each slot is
// touched by at most one side at a time.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        let mut pos = head;
        while pos != tail {
            // SAFETY: slots in [head, tail) hold initialized values.
            unsafe {
                (*self.slots[pos & MASK].get()).assume_init_drop();
            }
            pos = pos.wrapping_add(1);
        }
    }
}

/// Push side of the ring. Owned by the transport receive thread.
pub struct Producer<T> {
    ring: Arc<Ring<T>>,
}

/// Pop side of the ring. Owned by the consumer worker thread.
pub struct Consumer<T> {
    ring: Arc<Ring<T>>,
}

// The handles may be moved across threads but never shared between them.
unsafe impl<T: Send> Send for Producer<T> {}
unsafe impl<T: Send> Send for Consumer<T> {}

/// Create a new SPSC ring and split it into its two endpoints.
pub fn ring<T>() -> (Producer<T>, Consumer<T>) {
    let slots = (0..QUEUE_CAPACITY)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let ring = Arc::new(Ring {
        head: CachePadded::new(AtomicUsize::new(0)),
        tail: CachePadded::new(AtomicUsize::new(0)),
        slots,
    });
    (
        Producer {
            ring: Arc::clone(&ring),
        },
        Consumer { ring },
    )
}

impl<T> Producer<T> {
    /// Attempt to enqueue a value. Returns it back when the ring is full.
    ///
    /// SAFETY contract: must only be called from a single thread at a time
    /// (the venue's receive thread).
    #[inline]
    pub fn push(&self, value: T) -> Result<(), T> {
        let ring = &*self.ring;
        let tail = ring.tail.load(Ordering::Relaxed);
        let head = ring.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) == QUEUE_CAPACITY {
            return Err(value);
        }
        // SAFETY: slot at `tail` is unoccupied (consumer is at least
        // CAPACITY slots behind) and only this producer writes it.
        unsafe {
            (*ring.slots[tail & MASK].get()).write(value);
        }
        ring.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Number of occupied slots at the instant of the call.
    #[inline]
    pub fn len(&self) -> usize {
        let tail = self.ring.tail.load(Ordering::Relaxed);
        let head = self.ring.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Consumer<T> {
    /// Dequeue the oldest value, if any.
    #[inline]
    pub fn pop(&self) -> Option<T> {
        let ring = &*self.ring;
        let head = ring.head.load(Ordering::Relaxed);
        let tail = ring.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        // SAFETY: slot at `head` was published by the producer's release
        // store on `tail` and only this consumer reads it.
        let value = unsafe { (*ring.slots[head & MASK].get()).assume_init_read() };
        ring.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Number of occupied slots at the instant of the call.
    #[inline]
    pub fn len(&self) -> usize {
        let tail = self.ring.tail.load(Ordering::Acquire);
        let head = self.ring.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
