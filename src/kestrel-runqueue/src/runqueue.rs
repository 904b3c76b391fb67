// Disable indexing lints for now
#![allow(clippy::indexing_slicing)]

use self::clist::CList;

/// Runqueue number, which is also the thread priority.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RunqueueId(u8);

impl RunqueueId {
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u8 {
        self.0
    }
}

impl From<RunqueueId> for usize {
    fn from(value: RunqueueId) -> Self {
        usize::from(value.0)
    }
}

/// Index of a thread slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ThreadId(u8);

impl ThreadId {
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u8 {
        self.0
    }
}

impl From<ThreadId> for usize {
    fn from(value: ThreadId) -> Self {
        usize::from(value.0)
    }
}

/// Runqueue for `N_QUEUES`, supporting `N_THREADS` total.
///
/// Assumptions:
/// - runqueue numbers (corresponding priorities) are 0..N_QUEUES (exclusive)
/// - lower runqueue number ([`RunqueueId`]) means higher priority
/// - runqueue numbers fit in u32 bits (supporting max 32 priority levels)
/// - [`ThreadId`]s range from 0..N_THREADS
/// - `N_THREADS` is <255 (as u8 is used to store them, but 0xFF is used as
///   special value)
///
/// The current implementation needs an u32 for the bit cache,
/// an `[ThreadId; N_QUEUES]` array for the list tail indexes
/// and two `[u8; N_THREADS]` arrays for the list next and prev indexes.
pub struct RunQueue<const N_QUEUES: usize, const N_THREADS: usize> {
    /// Bitcache that represents the currently used queues
    /// in `0..N_QUEUES`.
    bitcache: u32,
    queues: CList<N_QUEUES, N_THREADS>,
}

impl<const N_QUEUES: usize, const N_THREADS: usize> RunQueue<N_QUEUES, N_THREADS> {
    const LEVELS_FIT: () = assert!(N_QUEUES <= 32, "at most 32 runqueues are supported");
    const THREADS_FIT: () = assert!(N_THREADS < 255, "at most 254 threads are supported");

    #[allow(clippy::new_without_default)]
    pub const fn new() -> RunQueue<N_QUEUES, N_THREADS> {
        let () = Self::LEVELS_FIT;
        let () = Self::THREADS_FIT;
        RunQueue {
            bitcache: 0,
            queues: CList::new(),
        }
    }

    /// Adds thread with pid `n` to the tail of runqueue number `rq`.
    ///
    /// Adding a thread that is already queued is a no-op.
    pub fn add(&mut self, n: ThreadId, rq: RunqueueId) {
        debug_assert!(usize::from(n) < N_THREADS);
        debug_assert!(usize::from(rq) < N_QUEUES);
        self.bitcache |= 1 << rq.0;
        self.queues.push(n.0, rq.0);
    }

    /// Removes thread with pid `n` from runqueue number `rq`.
    ///
    /// `n` does not need to be the head of its queue. Removing a thread that
    /// is not queued is a no-op.
    pub fn del(&mut self, n: ThreadId, rq: RunqueueId) {
        debug_assert!(usize::from(n) < N_THREADS);
        debug_assert!(usize::from(rq) < N_QUEUES);

        self.queues.del(n.0, rq.0);

        if self.queues.is_empty(rq.0) {
            self.bitcache &= !(1 << rq.0);
        }
    }

    /// Returns the pid that should run next.
    ///
    /// Returns the head of the non-empty runqueue with the lowest index.
    pub fn get_next(&self) -> Option<ThreadId> {
        if self.bitcache == 0 {
            return None;
        }
        let rq = self.bitcache.trailing_zeros() as u8;
        self.queues.peek_head(rq).map(ThreadId)
    }

    /// Advances runqueue number `rq`.
    ///
    /// This is used to "yield" to another thread of *the same* priority.
    pub fn advance(&mut self, rq: RunqueueId) {
        debug_assert!(usize::from(rq) < N_QUEUES);
        self.queues.advance(rq.0);
    }
}

mod clist {
    //! This module implements an array of `N_QUEUES` circular doubly linked lists
    //! over two arrays of size `N_THREADS`.
    //! The arrays are used for "next" and "prev" pointers, so each integer value
    //! corresponds to one element, which can only be in one of the lists.

    #[derive(Debug, Copy, Clone)]
    pub struct CList<const N_QUEUES: usize, const N_THREADS: usize> {
        tail: [u8; N_QUEUES],
        next_idxs: [u8; N_THREADS],
        prev_idxs: [u8; N_THREADS],
    }

    impl<const N_QUEUES: usize, const N_THREADS: usize> CList<N_QUEUES, N_THREADS> {
        pub const fn new() -> Self {
            CList {
                tail: [Self::sentinel(); N_QUEUES],
                next_idxs: [Self::sentinel(); N_THREADS],
                prev_idxs: [Self::sentinel(); N_THREADS],
            }
        }

        pub const fn sentinel() -> u8 {
            0xFF
        }

        pub fn is_empty(&self, rq: u8) -> bool {
            self.tail[rq as usize] == Self::sentinel()
        }

        pub fn push(&mut self, n: u8, rq: u8) {
            assert!(n < Self::sentinel());
            if self.next_idxs[n as usize] != Self::sentinel() {
                return;
            }
            let tail = self.tail[rq as usize];
            if tail == Self::sentinel() {
                // rq is empty, link n to itself
                self.next_idxs[n as usize] = n;
                self.prev_idxs[n as usize] = n;
            } else {
                let head = self.next_idxs[tail as usize];
                self.next_idxs[n as usize] = head;
                self.prev_idxs[n as usize] = tail;
                self.next_idxs[tail as usize] = n;
                self.prev_idxs[head as usize] = n;
            }
            self.tail[rq as usize] = n;
        }

        /// Unlinks `n` from list `rq` in constant time.
        pub fn del(&mut self, n: u8, rq: u8) {
            let next = self.next_idxs[n as usize];
            if next == Self::sentinel() {
                // not in any list
                return;
            }

            if next == n {
                // `n` bites itself, so there's only one entry.
                self.tail[rq as usize] = Self::sentinel();
            } else {
                let prev = self.prev_idxs[n as usize];
                self.next_idxs[prev as usize] = next;
                self.prev_idxs[next as usize] = prev;
                if self.tail[rq as usize] == n {
                    self.tail[rq as usize] = prev;
                }
            }

            self.next_idxs[n as usize] = Self::sentinel();
            self.prev_idxs[n as usize] = Self::sentinel();
        }

        pub fn pop_head(&mut self, rq: u8) -> Option<u8> {
            let head = self.peek_head(rq)?;
            self.del(head, rq);
            Some(head)
        }

        pub fn peek_head(&self, rq: u8) -> Option<u8> {
            let tail = self.tail[rq as usize];
            if tail == Self::sentinel() {
                None
            } else {
                Some(self.next_idxs[tail as usize])
            }
        }

        pub fn advance(&mut self, rq: u8) {
            let tail = self.tail[rq as usize];
            if tail != Self::sentinel() {
                self.tail[rq as usize] = self.next_idxs[tail as usize];
            }
        }
    }

}
