use crate::{thread::Thread, ThreadId};

/// Per-thread linkage into at most one [`ThreadList`].
#[derive(Copy, Clone, Debug)]
pub(crate) struct Link {
    next: Option<ThreadId>,
    prev: Option<ThreadId>,
    linked: bool,
}

impl Link {
    pub const UNLINKED: Self = Self {
        next: None,
        prev: None,
        linked: false,
    };
}

/// Manages blocked [`Thread`]s for a resource.
///
/// Waiters are kept in priority order, FIFO among equal priorities. The
/// links live in the scheduler, indexed by [`ThreadId`], so a thread can be
/// unlinked in constant time by whichever path resolves its wait.
#[derive(Debug, Default)]
pub(crate) struct ThreadList {
    /// Next thread to run once the resource is available.
    head: Option<ThreadId>,
    tail: Option<ThreadId>,
}

impl ThreadList {
    /// Creates a new empty [`ThreadList`]
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
        }
    }

    /// Enrolls `pid` behind every waiter of the same or higher priority.
    ///
    /// Walks from the tail, so enrolling at the lowest priority present is
    /// constant time. Otherwise the walk visits at most every other waiter,
    /// which is bounded by [`THREADS_NUMOF`](crate::THREADS_NUMOF).
    pub fn insert(&mut self, pid: ThreadId, threads: &[Thread], links: &mut [Link]) {
        debug_assert!(!links[usize::from(pid)].linked);
        let prio = threads[usize::from(pid)].prio;

        let mut after = self.tail;
        while let Some(n) = after {
            if threads[usize::from(n)].prio <= prio {
                break;
            }
            after = links[usize::from(n)].prev;
        }

        let before = match after {
            Some(a) => links[usize::from(a)].next,
            None => self.head,
        };

        links[usize::from(pid)] = Link {
            next: before,
            prev: after,
            linked: true,
        };
        match after {
            Some(a) => links[usize::from(a)].next = Some(pid),
            None => self.head = Some(pid),
        }
        match before {
            Some(b) => links[usize::from(b)].prev = Some(pid),
            None => self.tail = Some(pid),
        }
    }

    /// Removes the head from this [`ThreadList`].
    pub fn pop(&mut self, links: &mut [Link]) -> Option<ThreadId> {
        let head = self.head?;
        self.remove(head, links);
        Some(head)
    }

    /// Unlinks `pid`. Returns `false` if it was not linked, which is not an error.
    pub fn remove(&mut self, pid: ThreadId, links: &mut [Link]) -> bool {
        let link = links[usize::from(pid)];
        if !link.linked {
            return false;
        }
        match link.prev {
            Some(p) => links[usize::from(p)].next = link.next,
            None => self.head = link.next,
        }
        match link.next {
            Some(n) => links[usize::from(n)].prev = link.prev,
            None => self.tail = link.prev,
        }
        links[usize::from(pid)] = Link::UNLINKED;
        true
    }

    pub fn peek(&self) -> Option<ThreadId> {
        self.head
    }

    /// Determines if this [`ThreadList`] is empty.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}
