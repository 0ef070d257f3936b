//! Single-producer/single-consumer bounded ring buffer
//!
//! The ring is sized to the next power of two at or above the requested
//! capacity. Head and tail are monotonic counters; the only synchronization
//! is the Acquire/Release exchange of those two indices. The producer and
//! consumer halves are separate non-clonable handles, so the SPSC contract is
//! enforced by ownership rather than by convention.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Ring<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    /// Next slot to write; owned by the producer
    head: AtomicUsize,
    /// Next slot to read; owned by the consumer
    tail: AtomicUsize,
}

// SAFETY: a slot is written only by the single producer before head is
// published and read only by the single consumer after observing that head.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    fn capacity(&self) -> usize {
        self.mask + 1
    }

    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let mut tail = *self.tail.get_mut();
        while tail != head {
            let slot = &mut self.slots[tail & self.mask];
            // SAFETY: slots in [tail, head) hold initialized values.
            unsafe { slot.get_mut().assume_init_drop() };
            tail = tail.wrapping_add(1);
        }
    }
}

/// Create a bounded SPSC queue holding at least `capacity` items.
///
/// Returns `None` for a zero capacity.
pub fn bounded<T>(capacity: usize) -> Option<(Producer<T>, Consumer<T>)> {
    if capacity == 0 {
        return None;
    }
    let size = capacity.checked_next_power_of_two()?;
    let slots = (0..size)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<Vec<_>>()
        .into_boxed_slice();

    let ring = Arc::new(Ring {
        slots,
        mask: size - 1,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });

    Some((
        Producer { ring: ring.clone() },
        Consumer { ring },
    ))
}

/// Writing half of a bounded queue
pub struct Producer<T> {
    ring: Arc<Ring<T>>,
}

impl<T> Producer<T> {
    /// Push an item, handing it back if the ring is full.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        let ring = &*self.ring;
        let head = ring.head.load(Ordering::Relaxed);
        let tail = ring.tail.load(Ordering::Acquire);

        if head.wrapping_sub(tail) == ring.capacity() {
            return Err(item);
        }

        // SAFETY: the slot at head is outside [tail, head) so the consumer
        // does not touch it until head is published below.
        unsafe { (*ring.slots[head & ring.mask].get()).write(item) };
        ring.head.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Ring capacity (a power of two)
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Whether the ring is currently empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the ring is currently full
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }
}

/// Reading half of a bounded queue
pub struct Consumer<T> {
    ring: Arc<Ring<T>>,
}

impl<T> Consumer<T> {
    /// Pop the oldest item, if any.
    pub fn pop(&mut self) -> Option<T> {
        let ring = &*self.ring;
        let tail = ring.tail.load(Ordering::Relaxed);
        let head = ring.head.load(Ordering::Acquire);

        if head == tail {
            return None;
        }

        // SAFETY: head was published with Release after the slot was written.
        let item = unsafe { (*ring.slots[tail & ring.mask].get()).assume_init_read() };
        ring.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    /// Ring capacity (a power of two)
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Whether the ring is currently empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
