// SPDX-License-Identifier: Apache-2.0

//! Lock-free single-producer/single-consumer byte ring used by the serial
//! FIFOs. Cursors grow without wrapping and are masked on access, so
//! `tail - head` is always the fill level.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

pub const FIFO_LEN: usize = 64;
const FIFO_MASK: usize = FIFO_LEN - 1;

pub struct Fifo {
    data: [AtomicU8; FIFO_LEN],
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl Default for Fifo {
    fn default() -> Self {
        Fifo {
            data: std::array::from_fn(|_| AtomicU8::new(0)),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }
}

impl Fifo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self) -> usize {
        self.tail
            .load(Ordering::Acquire)
            .wrapping_sub(self.head.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.level() == 0
    }

    pub fn is_full(&self) -> bool {
        self.level() > FIFO_MASK
    }

    /// Producer side. Returns false when the ring is full.
    pub fn put(&self, value: u8) -> bool {
        if self.is_full() {
            return false;
        }
        let tail = self.tail.load(Ordering::Relaxed);
        self.data[tail & FIFO_MASK].store(value, Ordering::Relaxed);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Consumer-side look at the next byte without removing it, so a failed
    /// host write can leave the byte queued.
    pub fn peek(&self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let head = self.head.load(Ordering::Relaxed);
        Some(self.data[head & FIFO_MASK].load(Ordering::Relaxed))
    }

    /// Consumer side.
    pub fn get(&self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let head = self.head.load(Ordering::Relaxed);
        let value = self.data[head & FIFO_MASK].load(Ordering::Relaxed);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Consumer-side drain; used by FCR FIFO-clear writes.
    pub fn clear(&self) {
        self.head
            .store(self.tail.load(Ordering::Acquire), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_preserves_order() {
        let fifo = Fifo::new();
        for n in 0..FIFO_LEN as u8 {
            assert!(fifo.put(n));
        }
        for n in 0..FIFO_LEN as u8 {
            assert_eq!(fifo.get(), Some(n));
        }
        assert!(fifo.is_empty());
    }

    #[test]
    fn put_fails_when_full() {
        let fifo = Fifo::new();
        for n in 0..FIFO_LEN as u8 {
            assert!(fifo.put(n));
        }
        assert!(fifo.is_full());
        assert!(!fifo.put(0xFF));
        assert_eq!(fifo.level(), FIFO_LEN);
    }

    #[test]
    fn get_on_empty_returns_none() {
        let fifo = Fifo::new();
        assert_eq!(fifo.get(), None);
    }

    #[test]
    fn level_tracks_cursor_wraparound() {
        let fifo = Fifo::new();
        // Push the cursors well past one lap of the ring.
        for lap in 0..5u8 {
            for n in 0..FIFO_LEN as u8 {
                assert!(fifo.put(lap ^ n));
            }
            for n in 0..FIFO_LEN as u8 {
                assert_eq!(fifo.get(), Some(lap ^ n));
            }
        }
        assert_eq!(fifo.level(), 0);
    }

    #[test]
    fn clear_empties_the_ring() {
        let fifo = Fifo::new();
        for n in 0..10 {
            fifo.put(n);
        }
        fifo.clear();
        assert!(fifo.is_empty());
        assert_eq!(fifo.get(), None);
    }
}
