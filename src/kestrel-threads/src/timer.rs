//! Timed-wait expiry queue.
//!
//! An indexed binary min-heap of thread ids keyed by absolute expiry tick.
//! Each thread has at most one entry; `pos` maps a thread to its heap slot so
//! that an entry can be canceled in O(log n) when the wait is resolved by
//! another path.
use crate::ThreadId;

/// A duration in ticks.
pub type Ticks = u32;

/// Ticks since the kernel started.
///
/// 64 bits, so `now + Ticks::MAX` never wraps.
pub type Instant = u64;

const NOT_QUEUED: u8 = 0xFF;

pub(crate) struct TimerQueue<const N: usize> {
    heap: [u8; N],
    len: usize,
    pos: [u8; N],
    expiry: [Instant; N],
    // Insertion sequence, breaks ties between equal expiries.
    seq: [u64; N],
    next_seq: u64,
}

impl<const N: usize> TimerQueue<N> {
    pub const fn new() -> Self {
        Self {
            heap: [0; N],
            len: 0,
            pos: [NOT_QUEUED; N],
            expiry: [0; N],
            seq: [0; N],
            next_seq: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, pid: ThreadId) -> bool {
        self.pos[usize::from(pid)] != NOT_QUEUED
    }

    /// Arms the timer of `pid` to fire at `expiry`, replacing any earlier entry.
    pub fn insert(&mut self, pid: ThreadId, expiry: Instant) {
        self.remove(pid);
        let id = usize::from(pid);
        self.expiry[id] = expiry;
        self.seq[id] = self.next_seq;
        self.next_seq += 1;

        let slot = self.len;
        self.heap[slot] = pid.get();
        self.pos[id] = slot as u8;
        self.len += 1;
        self.sift_up(slot);
    }

    /// Cancels the timer of `pid`. Canceling twice is a no-op.
    pub fn remove(&mut self, pid: ThreadId) -> bool {
        let id = usize::from(pid);
        let slot = self.pos[id];
        if slot == NOT_QUEUED {
            return false;
        }
        let slot = usize::from(slot);
        let last = self.len - 1;
        self.swap(slot, last);
        self.len = last;
        self.pos[id] = NOT_QUEUED;
        if slot < self.len {
            self.sift_down(slot);
            self.sift_up(slot);
        }
        true
    }

    /// Removes and returns the earliest entry if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<ThreadId> {
        if self.len == 0 {
            return None;
        }
        let first = self.heap[0];
        if now < self.expiry[usize::from(first)] {
            return None;
        }
        let pid = ThreadId::new(first);
        self.remove(pid);
        Some(pid)
    }

    /// Expiry of the earliest entry.
    pub fn next_expiry(&self) -> Option<Instant> {
        (self.len > 0).then(|| self.expiry[usize::from(self.heap[0])])
    }

    fn less(&self, a: usize, b: usize) -> bool {
        let (a, b) = (usize::from(self.heap[a]), usize::from(self.heap[b]));
        (self.expiry[a], self.seq[a]) < (self.expiry[b], self.seq[b])
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.pos[usize::from(self.heap[a])] = a as u8;
        self.pos[usize::from(self.heap[b])] = b as u8;
    }

    fn sift_up(&mut self, mut slot: usize) {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if !self.less(slot, parent) {
                break;
            }
            self.swap(slot, parent);
            slot = parent;
        }
    }

    fn sift_down(&mut self, mut slot: usize) {
        loop {
            let left = 2 * slot + 1;
            let right = left + 1;
            let mut smallest = slot;
            if left < self.len && self.less(left, smallest) {
                smallest = left;
            }
            if right < self.len && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == slot {
                break;
            }
            self.swap(slot, smallest);
            slot = smallest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: u8) -> ThreadId {
        ThreadId::new(n)
    }

    fn drain_at(timers: &mut TimerQueue<8>, now: Instant) -> Vec<u8> {
        core::iter::from_fn(|| timers.pop_due(now))
            .map(ThreadId::get)
            .collect()
    }

    #[test]
    fn fires_in_expiry_then_insertion_order() {
        let mut timers: TimerQueue<8> = TimerQueue::new();
        timers.insert(pid(0), 30);
        timers.insert(pid(1), 10);
        timers.insert(pid(2), 20);
        timers.insert(pid(3), 10);

        assert!(drain_at(&mut timers, 9).is_empty());
        assert_eq!(drain_at(&mut timers, 10), [1, 3]);
        assert_eq!(drain_at(&mut timers, 25), [2]);
        assert_eq!(timers.next_expiry(), Some(30));
        assert_eq!(drain_at(&mut timers, 30), [0]);
        assert!(timers.is_empty());
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut timers: TimerQueue<8> = TimerQueue::new();
        timers.insert(pid(4), 5);
        timers.insert(pid(5), 6);

        assert!(timers.remove(pid(4)));
        assert!(!timers.remove(pid(4)));
        assert!(!timers.contains(pid(4)));
        assert_eq!(drain_at(&mut timers, 100), [5]);
        assert!(!timers.remove(pid(5)));
    }

    #[test]
    fn rearming_replaces_entry() {
        let mut timers: TimerQueue<8> = TimerQueue::new();
        timers.insert(pid(1), 5);
        timers.insert(pid(1), 50);
        assert!(drain_at(&mut timers, 5).is_empty());
        assert_eq!(drain_at(&mut timers, 50), [1]);
    }

    #[test]
    fn longest_duration_sorts_after_short_ones() {
        let mut timers: TimerQueue<8> = TimerQueue::new();
        let now = Instant::from(u32::MAX - 1);
        timers.insert(pid(0), now + Instant::from(Ticks::MAX));
        timers.insert(pid(1), now + 1);
        timers.insert(pid(2), now + 3);

        assert_eq!(drain_at(&mut timers, now + 1), [1]);
        assert_eq!(drain_at(&mut timers, now + 3), [2]);
        assert!(drain_at(&mut timers, now + Instant::from(Ticks::MAX) - 1).is_empty());
        assert_eq!(drain_at(&mut timers, now + Instant::from(Ticks::MAX)), [0]);
    }

    #[test]
    fn removal_from_middle_keeps_heap_order() {
        let mut timers: TimerQueue<8> = TimerQueue::new();
        for (n, expiry) in [(0, 8), (1, 3), (2, 6), (3, 1), (4, 9), (5, 2), (6, 7)] {
            timers.insert(pid(n), expiry);
        }
        timers.remove(pid(2));
        timers.remove(pid(3));
        assert_eq!(drain_at(&mut timers, 10), [5, 1, 6, 0, 4]);
    }
}
