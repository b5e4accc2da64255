//! Bounded MPMC exchange queue between pollers and workers.
//!
//! A fixed ring of slots, each guarded by its own sequence marker instead of
//! a global lock. Producers and consumers take tickets from two independent
//! counters; the ticket picks the slot (`ticket & mask`) and the marker says
//! whose turn it is:
//!
//! - `marker == ticket`: empty, writable by the producer holding `ticket`
//! - `marker == ticket + 1`: published, readable by the consumer holding `ticket`
//! - after a read the marker becomes `ticket + capacity`, handing the slot to
//!   the producer one lap later
//!
//! Both operations busy-wait on the marker. This is a blocking channel: a
//! producer facing a full ring spins until some consumer frees its slot, and
//! the number of spins is returned as a backpressure signal.

use std::cell::UnsafeCell;
use std::hint;
use std::mem::MaybeUninit;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

/// Spins between scheduler yields while waiting on a marker.
const YIELD_EVERY: u64 = 1 << 10;

/// Keeps a value on its own cache line.
#[repr(C, align(64))]
struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

#[repr(C, align(64))]
struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Fixed-capacity ring moving values from producer to consumer threads.
pub struct ExchangeQueue<T> {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    slots: Box<[Slot<T>]>,
    mask: usize,
}

// Safety: a slot's value is only touched by the single ticket holder that the
// marker handshake admits, and the release store / acquire load pair on the
// marker orders the write before the read.
unsafe impl<T: Send> Send for ExchangeQueue<T> {}
unsafe impl<T: Send> Sync for ExchangeQueue<T> {}

impl<T> ExchangeQueue<T> {
    /// Create a queue with `capacity` slots.
    ///
    /// # Panics
    /// If `capacity` is zero or not a power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "queue capacity must be a power of two, got {capacity}"
        );

        let slots = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            slots,
            mask: capacity - 1,
        }
    }

    /// Number of slots in the ring.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Append a value, spinning while the reserved slot is still occupied.
    ///
    /// Returns how many times the producer had to spin, zero when the slot
    /// was free on arrival.
    pub fn push(&self, value: T) -> u64 {
        // Relaxed: the marker handshake below carries the synchronization.
        let ticket = self.tail.fetch_add(1, Ordering::Relaxed);
        let slot = &self.slots[ticket & self.mask];

        let overflows = spin_until(&slot.sequence, ticket);

        unsafe { (*slot.value.get()).write(value) };
        slot.sequence.store(ticket.wrapping_add(1), Ordering::Release);

        overflows
    }

    /// Remove the oldest value, spinning until one is published.
    pub fn pop(&self) -> T {
        let ticket = self.head.fetch_add(1, Ordering::Relaxed);
        let slot = &self.slots[ticket & self.mask];

        spin_until(&slot.sequence, ticket.wrapping_add(1));

        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.sequence
            .store(ticket.wrapping_add(self.capacity()), Ordering::Release);

        value
    }

    #[cfg(test)]
    fn marker(&self, index: usize) -> usize {
        self.slots[index].sequence.load(Ordering::Acquire)
    }

    #[cfg(test)]
    fn reserved(&self) -> usize {
        self.tail.load(Ordering::Relaxed)
    }
}

/// Spin until `sequence` reaches `expected`, returning the iteration count.
fn spin_until(sequence: &AtomicUsize, expected: usize) -> u64 {
    let mut spins = 0u64;
    while sequence.load(Ordering::Acquire) != expected {
        spins += 1;
        hint::spin_loop();
        if spins % YIELD_EVERY == 0 {
            thread::yield_now();
        }
    }
    spins
}

impl<T> Drop for ExchangeQueue<T> {
    fn drop(&mut self) {
        let head = *self.head.value.get_mut();
        let tail = *self.tail.value.get_mut();
        let pending = tail.wrapping_sub(head).min(self.capacity());

        for offset in 0..pending {
            let ticket = head.wrapping_add(offset);
            let slot = &mut self.slots[ticket & self.mask];
            if *slot.sequence.get_mut() == ticket.wrapping_add(1) {
                unsafe { slot.value.get_mut().assume_init_drop() };
            }
        }
    }
}
