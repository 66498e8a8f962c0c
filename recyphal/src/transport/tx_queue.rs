//! Per-media transmission queue
//!
//! Frames wait here between `send` and the moment the media interface
//! accepts them. Ordering is highest priority first, FIFO within one
//! priority (a monotone sequence number breaks ties). Capacity is fixed at
//! construction; deadline expiration is evaluated lazily at peek time.

use alloc::collections::BinaryHeap;
use core::cmp::Ordering;

use recyphal_media::time::Instant;

use crate::core::Priority;
use crate::transport::Error;

struct Entry<F> {
    priority: Priority,
    seq: u64,
    deadline: Instant,
    frame: F,
}

impl<F> PartialEq for Entry<F> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<F> Eq for Entry<F> {}

impl<F> PartialOrd for Entry<F> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<F> Ord for Entry<F> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: "greater" is served first. Numerically lower priority
        // codes are more urgent, lower sequence numbers go first.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub(crate) struct TxQueue<F> {
    items: BinaryHeap<Entry<F>>,
    capacity: usize,
    next_seq: u64,
    expired: u64,
}

impl<F> TxQueue<F> {
    pub fn new(capacity: usize) -> Result<Self, Error> {
        let mut items = BinaryHeap::new();
        items.try_reserve(capacity).map_err(|_| Error::Memory)?;
        Ok(Self {
            items,
            capacity,
            next_seq: 0,
            expired: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn free_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.items.len())
    }

    pub fn push(&mut self, priority: Priority, deadline: Instant, frame: F) -> Result<(), Error> {
        if self.items.len() >= self.capacity {
            return Err(Error::Capacity);
        }
        self.items.push(Entry {
            priority,
            seq: self.next_seq,
            deadline,
            frame,
        });
        self.next_seq += 1;
        Ok(())
    }

    /// Returns the most urgent not-yet-expired frame and its deadline.
    ///
    /// Frames whose deadline is at or before `now` are silently dropped
    /// (counted in [`take_expired`](Self::take_expired)).
    pub fn peek(&mut self, now: Instant) -> Option<(&F, Instant)> {
        while let Some(entry) = self.items.peek() {
            if now < entry.deadline {
                break;
            }
            self.items.pop();
            self.expired += 1;
        }
        self.items.peek().map(|entry| (&entry.frame, entry.deadline))
    }

    /// Removes the frame last returned by `peek`.
    pub fn pop(&mut self) -> Option<F> {
        self.items.pop().map(|entry| entry.frame)
    }

    /// Drains and returns the count of frames dropped by deadline since the
    /// last call.
    pub fn take_expired(&mut self) -> u64 {
        core::mem::take(&mut self.expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NEVER: Instant = Instant::MAX;

    fn ts(us: u64) -> Instant {
        Instant::from_micros(us)
    }

    #[test]
    fn test_priority_order() {
        let mut queue = TxQueue::new(8).unwrap();
        queue.push(Priority::Slow, NEVER, 1u32).unwrap();
        queue.push(Priority::Exceptional, NEVER, 2).unwrap();
        queue.push(Priority::Nominal, NEVER, 3).unwrap();

        assert_eq!(queue.peek(ts(0)).map(|(f, _)| *f), Some(2));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut queue = TxQueue::new(8).unwrap();
        for frame in 0u32..5 {
            queue.push(Priority::Nominal, NEVER, frame).unwrap();
        }
        for frame in 0u32..5 {
            assert_eq!(queue.pop(), Some(frame));
        }
    }

    #[test]
    fn test_capacity() {
        let mut queue = TxQueue::new(2).unwrap();
        queue.push(Priority::Nominal, NEVER, 1u32).unwrap();
        queue.push(Priority::Nominal, NEVER, 2).unwrap();
        assert_eq!(
            queue.push(Priority::Nominal, NEVER, 3),
            Err(Error::Capacity)
        );
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_expired_dropped_at_peek() {
        let mut queue = TxQueue::new(8).unwrap();
        queue.push(Priority::Nominal, ts(100), 1u32).unwrap();
        queue.push(Priority::Nominal, ts(300), 2).unwrap();

        // Strictly before the deadline the frame is still eligible.
        assert_eq!(queue.peek(ts(99)).map(|(f, _)| *f), Some(1));
        // At the deadline it is dropped, never delivered.
        assert_eq!(queue.peek(ts(100)).map(|(f, _)| *f), Some(2));
        assert_eq!(queue.take_expired(), 1);
        assert_eq!(queue.take_expired(), 0);
    }

    #[test]
    fn test_expired_high_priority_unblocks_lower() {
        let mut queue = TxQueue::new(8).unwrap();
        queue.push(Priority::Fast, ts(10), 1u32).unwrap();
        queue.push(Priority::Slow, NEVER, 2).unwrap();

        assert_eq!(queue.peek(ts(50)).map(|(f, _)| *f), Some(2));
        assert_eq!(queue.take_expired(), 1);
    }
}
