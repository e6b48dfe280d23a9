//! Receive ring
//!
//! A fixed size ring of [CanFrame]s, filled by the CAN receive interrupt and
//! drained by the hub task. It is optimized and opinionated for the following
//! cases:
//!
//! * Exactly one producer context (the interrupt) and one consumer context
//!   (the task calling [Hub::step()][crate::Hub::step])
//! * Use in cases where the target may not have CAS atomics, so only `load`s
//!   and `store`s are used, always inside a [critical section][critical_section::with]
//! * A full ring never blocks the interrupt: the oldest frame is dropped, and
//!   the drop is counted in [RingBuffer::overflows()]
//!
//! `head` and `tail` are free-running counters, the slot index is the counter
//! modulo `N`. `head == tail` means empty, `head - tail == N` means full.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use grounded::{const_init::ConstInit, uninit::GroundedArrayCell};

use crate::codec::CanFrame;

impl ConstInit for CanFrame {
    const VAL: Self = CanFrame::EMPTY;
}

/// Storage for exactly N received frames
pub struct RingBuffer<const N: usize> {
    slots: GroundedArrayCell<CanFrame, N>,
    head: AtomicUsize,
    tail: AtomicUsize,
    overflows: AtomicU32,
}

// SAFETY: slots are only read or written inside a critical section, while
// holding exclusive access to the indices that select them.
unsafe impl<const N: usize> Sync for RingBuffer<N> {}

impl<const N: usize> RingBuffer<N> {
    /// Create a new, empty ring
    ///
    /// Intended for static usage.
    pub const fn new() -> Self {
        assert!(N > 0);
        Self {
            slots: GroundedArrayCell::const_init(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            overflows: AtomicU32::new(0),
        }
    }

    /// The number of frames the ring can hold
    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Store a frame, dropping the oldest one if the ring is full
    ///
    /// Never blocks and never allocates, so this may be called from interrupt
    /// context. Returns `false` if a frame had to be dropped.
    pub fn push(&self, frame: CanFrame) -> bool {
        critical_section::with(|_| {
            let head = self.head.load(Ordering::Acquire);
            let mut tail = self.tail.load(Ordering::Acquire);
            let mut kept = true;

            if head.wrapping_sub(tail) >= N {
                // Full: give up the oldest slot
                tail = tail.wrapping_add(1);
                self.tail.store(tail, Ordering::Release);
                let ct = self.overflows.load(Ordering::Relaxed);
                self.overflows.store(ct.wrapping_add(1), Ordering::Relaxed);
                kept = false;
            }

            // SAFETY: we are in a critical section, and `head % N` is not
            // between `tail` and `head`, so no reader can observe this slot.
            unsafe {
                self.slots.as_mut_ptr().add(head % N).write(frame);
            }
            self.head.store(head.wrapping_add(1), Ordering::Release);
            kept
        })
    }

    /// Take the oldest frame, if any
    ///
    /// Must only be called from the single consumer context.
    pub fn pop(&self) -> Option<CanFrame> {
        critical_section::with(|_| {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }
            // SAFETY: we are in a critical section, and the slot at `tail` was
            // written by a completed `push`.
            let frame = unsafe { self.slots.as_mut_ptr().add(tail % N).read() };
            self.tail.store(tail.wrapping_add(1), Ordering::Release);
            Some(frame)
        })
    }

    /// The number of frames waiting to be popped
    pub fn len(&self) -> usize {
        critical_section::with(|_| {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            head.wrapping_sub(tail)
        })
    }

    /// Is the ring empty?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all waiting frames
    pub fn clear(&self) {
        critical_section::with(|_| {
            let head = self.head.load(Ordering::Acquire);
            self.tail.store(head, Ordering::Release);
        })
    }

    /// Number of frames dropped because the ring was full
    ///
    /// Monotonic, wraps at `u32::MAX`.
    #[inline]
    pub fn overflows(&self) -> u32 {
        self.overflows.load(Ordering::Relaxed)
    }
}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u8) -> CanFrame {
        CanFrame::new(0x400 | n as u16, &[n, 0x11]).unwrap()
    }

    #[test]
    fn fifo_order() {
        let ring = RingBuffer::<4>::new();
        assert!(ring.is_empty());
        assert!(ring.push(frame(1)));
        assert!(ring.push(frame(2)));
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.pop(), Some(frame(1)));
        assert_eq!(ring.pop(), Some(frame(2)));
        assert_eq!(ring.pop(), None);
        assert_eq!(ring.overflows(), 0);
    }

    #[test]
    fn overflow_keeps_most_recent() {
        let ring = RingBuffer::<4>::new();
        for n in 0..10 {
            ring.push(frame(n));
        }
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.overflows(), 6);
        for n in 6..10 {
            assert_eq!(ring.pop(), Some(frame(n)));
        }
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn overflow_signalled_on_push() {
        let ring = RingBuffer::<2>::new();
        assert!(ring.push(frame(0)));
        assert!(ring.push(frame(1)));
        assert!(!ring.push(frame(2)));
        assert_eq!(ring.pop(), Some(frame(1)));
    }

    #[test]
    fn indices_wrap_around() {
        let ring = RingBuffer::<3>::new();
        for n in 0..20u8 {
            ring.push(frame(n));
            ring.push(frame(n.wrapping_add(100)));
            assert_eq!(ring.pop(), Some(frame(n)));
            assert_eq!(ring.pop(), Some(frame(n.wrapping_add(100))));
        }
        assert!(ring.is_empty());
        assert_eq!(ring.overflows(), 0);
    }

    #[test]
    fn clear_empties() {
        let ring = RingBuffer::<3>::new();
        ring.push(frame(1));
        ring.push(frame(2));
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.pop(), None);
        ring.push(frame(3));
        assert_eq!(ring.pop(), Some(frame(3)));
    }
}
