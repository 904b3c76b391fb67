//! Fixed-size message queues over caller-supplied storage.
//!
//! A send to a queue with a blocked receiver copies the element straight into
//! the receiver's buffer; a receive from a full queue with a blocked sender
//! pulls that sender's element into the freed slot. Either way the waiter is
//! woken within the same critical section, so no element and no wakeup can be
//! raced away in between.

use kestrel_log::{debug, info, warn};

use crate::pool::Handle;
use crate::scheduler::{Outcome, Scheduler};
use crate::thread::{Transfer, WaitObject, WakeReason};
use crate::threadlist::ThreadList;
use crate::{Error, Timeout};

/// Handle to a message queue.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct QueueId(pub(crate) Handle);

pub(crate) struct QueueCb {
    storage: &'static mut [u8],
    element_size: usize,
    capacity: usize,
    /// Slot of the oldest element.
    head: usize,
    count: usize,
    /// Receivers waiting for an element; only non-empty while `count == 0`.
    pub(crate) rx_waiters: ThreadList,
    /// Senders waiting for space; only non-empty while `count == capacity`.
    pub(crate) tx_waiters: ThreadList,
}

impl QueueCb {
    fn new(storage: &'static mut [u8], element_size: usize, capacity: usize) -> Result<Self, Error> {
        let needed = element_size
            .checked_mul(capacity)
            .ok_or(Error::InvalidParam)?;
        if element_size == 0 || capacity == 0 || storage.len() < needed {
            return Err(Error::InvalidParam);
        }
        Ok(Self {
            storage,
            element_size,
            capacity,
            head: 0,
            count: 0,
            rx_waiters: ThreadList::new(),
            tx_waiters: ThreadList::new(),
        })
    }

    fn is_full(&self) -> bool {
        self.count == self.capacity
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn slot(&mut self, index: usize) -> &mut [u8] {
        let start = index * self.element_size;
        &mut self.storage[start..start + self.element_size]
    }

    fn push(&mut self, element: &[u8]) {
        debug_assert!(!self.is_full());
        let tail = (self.head + self.count) % self.capacity;
        self.slot(tail).copy_from_slice(element);
        self.count += 1;
    }

    fn pop(&mut self, out: &mut [u8]) {
        debug_assert!(!self.is_empty());
        let head = self.head;
        out.copy_from_slice(self.slot(head));
        self.head = (self.head + 1) % self.capacity;
        self.count -= 1;
    }
}

impl Scheduler {
    pub(crate) fn queue_create(
        &mut self,
        storage: &'static mut [u8],
        element_size: usize,
        capacity: usize,
    ) -> Result<QueueId, Error> {
        let queue = QueueCb::new(storage, element_size, capacity)?;
        let id = QueueId(self.queues.insert(queue)?);
        info!("queue {} created, {} x {} bytes", id, capacity, element_size);
        Ok(id)
    }

    /// Deletes the queue, waking every waiter with [`WakeReason::Deleted`].
    ///
    /// Receivers are woken before senders, each list in wait order. Returns
    /// the storage, which no woken thread touches again.
    pub(crate) fn queue_delete(&mut self, id: QueueId) -> Result<&'static mut [u8], Error> {
        let mut queue = self.queues.remove(id.0).ok_or_else(|| unknown(id))?;
        let mut woken = 0usize;
        while let Some(pid) = queue.rx_waiters.pop(&mut self.wait_links) {
            self.wake(pid, WakeReason::Deleted);
            woken += 1;
        }
        while let Some(pid) = queue.tx_waiters.pop(&mut self.wait_links) {
            self.wake(pid, WakeReason::Deleted);
            woken += 1;
        }
        info!("queue {} deleted, {} waiters woken", id, woken);
        Ok(queue.storage)
    }

    pub(crate) fn queue_send(
        &mut self,
        id: QueueId,
        element: &[u8],
        timeout: Timeout,
    ) -> Result<Outcome, Error> {
        let queue = self.queues.get_mut(id.0).ok_or_else(|| unknown(id))?;
        if element.len() != queue.element_size {
            return Err(Error::InvalidParam);
        }

        if let Some(receiver) = queue.rx_waiters.pop(&mut self.wait_links) {
            debug_assert!(queue.is_empty());
            let transfer = self.thread(receiver).transfer;
            // SAFETY: the receiver is blocked in `queue_receive`, which owns
            // the registered buffer until it is woken below.
            unsafe { transfer.as_mut_slice() }.copy_from_slice(element);
            self.wake(receiver, WakeReason::Signaled);
            debug!("queue {}: handed element to {}", id, receiver);
            return Ok(Outcome::Done);
        }

        if !queue.is_full() {
            queue.push(element);
            return Ok(Outcome::Done);
        }

        let pid = self.block_current(
            WaitObject::QueueTx(id),
            timeout,
            Transfer::from_slice(element),
        )?;
        if let Some(queue) = self.queues.get_mut(id.0) {
            queue.tx_waiters.insert(pid, &self.threads, &mut self.wait_links);
        }
        Ok(Outcome::Pending)
    }

    pub(crate) fn queue_receive(
        &mut self,
        id: QueueId,
        out: &mut [u8],
        timeout: Timeout,
    ) -> Result<Outcome, Error> {
        let queue = self.queues.get_mut(id.0).ok_or_else(|| unknown(id))?;
        if out.len() != queue.element_size {
            return Err(Error::InvalidParam);
        }

        if !queue.is_empty() {
            queue.pop(out);
            if let Some(sender) = queue.tx_waiters.pop(&mut self.wait_links) {
                let transfer = self.threads[usize::from(sender)].transfer;
                // SAFETY: the sender is blocked in `queue_send`, which keeps
                // the element borrowed until it is woken below.
                queue.push(unsafe { transfer.as_slice() });
                self.wake(sender, WakeReason::Signaled);
                debug!("queue {}: took element from {}", id, sender);
            }
            return Ok(Outcome::Done);
        }

        let pid = self.block_current(
            WaitObject::QueueRx(id),
            timeout,
            Transfer::from_mut_slice(out),
        )?;
        if let Some(queue) = self.queues.get_mut(id.0) {
            queue.rx_waiters.insert(pid, &self.threads, &mut self.wait_links);
        }
        Ok(Outcome::Pending)
    }

    pub(crate) fn queue_len(&self, id: QueueId) -> Result<usize, Error> {
        self.queues
            .get(id.0)
            .map(|queue| queue.count)
            .ok_or_else(|| unknown(id))
    }
}

fn unknown(id: QueueId) -> Error {
    warn!("queue {}: invalid handle", id);
    Error::InvalidHandle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::tests::{run_as, scheduler, spawn};
    use crate::thread::ThreadState;
    use crate::ThreadId;

    fn storage(len: usize) -> &'static mut [u8] {
        Box::leak(vec![0u8; len].into_boxed_slice())
    }

    fn wake_of(s: &mut Scheduler, pid: ThreadId) -> Option<WakeReason> {
        s.take_wake(pid)
    }

    #[test]
    fn create_rejects_bad_parameters() {
        let mut s = scheduler();
        assert_eq!(s.queue_create(storage(16), 0, 16), Err(Error::InvalidParam));
        assert_eq!(s.queue_create(storage(16), 1, 0), Err(Error::InvalidParam));
        assert_eq!(s.queue_create(storage(15), 1, 16), Err(Error::InvalidParam));
        assert_eq!(
            s.queue_create(storage(16), usize::MAX, 2),
            Err(Error::InvalidParam)
        );
        for _ in 0..crate::QUEUES_NUMOF {
            s.queue_create(storage(4), 4, 1).unwrap();
        }
        assert_eq!(s.queue_create(storage(4), 4, 1), Err(Error::NoMemorySlots));
    }

    #[test]
    fn wrong_element_length_is_rejected() {
        let mut s = scheduler();
        let q = s.queue_create(storage(8), 2, 4).unwrap();
        assert_eq!(s.queue_send(q, &[1], Timeout::NoWait), Err(Error::InvalidParam));
        let mut out = [0u8; 3];
        assert_eq!(
            s.queue_receive(q, &mut out, Timeout::NoWait),
            Err(Error::InvalidParam)
        );
    }

    #[test]
    fn delete_wakes_every_receiver() {
        let mut s = scheduler();
        let q = s.queue_create(storage(16), 1, 16).unwrap();
        let receivers: Vec<_> = (0..4).map(|i| spawn(&mut s, 3 + i)).collect();
        let mut bufs = [[0u8; 1]; 4];
        for (pid, buf) in receivers.iter().zip(bufs.iter_mut()) {
            run_as(&mut s, *pid);
            let timeout = if pid.get() % 2 == 0 {
                Timeout::Never
            } else {
                Timeout::Ticks(500)
            };
            assert_eq!(s.queue_receive(q, buf, timeout), Ok(Outcome::Pending));
        }

        s.queue_delete(q).unwrap();
        for pid in &receivers {
            assert_eq!(s.get_state(*pid), Some(ThreadState::Ready));
            assert_eq!(wake_of(&mut s, *pid), Some(WakeReason::Deleted));
            assert_eq!(wake_of(&mut s, *pid), None);
        }
        assert!(s.timers.is_empty());

        // a deleted handle is rejected before touching any wait list
        let mut out = [0u8; 1];
        assert_eq!(s.queue_send(q, &[1], Timeout::Never), Err(Error::InvalidHandle));
        assert_eq!(
            s.queue_receive(q, &mut out, Timeout::NoWait),
            Err(Error::InvalidHandle)
        );
        assert_eq!(s.queue_delete(q).err(), Some(Error::InvalidHandle));
        assert_eq!(s.queue_len(q), Err(Error::InvalidHandle));
    }

    #[test]
    fn delete_returns_storage_and_wakes_senders() {
        let mut s = scheduler();
        let q = s.queue_create(storage(2), 2, 1).unwrap();
        let sender = spawn(&mut s, 1);
        run_as(&mut s, sender);
        s.queue_send(q, &[7, 7], Timeout::NoWait).unwrap();
        assert_eq!(s.queue_send(q, &[8, 8], Timeout::Ticks(3)), Ok(Outcome::Pending));

        let storage = s.queue_delete(q).unwrap();
        assert_eq!(storage, &[7, 7]);
        assert_eq!(wake_of(&mut s, sender), Some(WakeReason::Deleted));
        assert_eq!(s.switch_to_next(), Some(sender));
    }

    #[test]
    fn send_wakes_most_urgent_then_oldest_receiver() {
        let mut s = scheduler();
        let q = s.queue_create(storage(4), 1, 4).unwrap();
        let w1 = spawn(&mut s, 5);
        let w2 = spawn(&mut s, 2);
        let w3 = spawn(&mut s, 5);
        let w4 = spawn(&mut s, 2);
        let producer = spawn(&mut s, 9);

        let mut bufs = [[0u8; 1]; 4];
        for (pid, buf) in [w1, w2, w3, w4].into_iter().zip(bufs.iter_mut()) {
            run_as(&mut s, pid);
            s.queue_receive(q, buf, Timeout::Never).unwrap();
        }

        run_as(&mut s, producer);
        for (element, expected) in [(10, w2), (20, w4), (30, w1), (40, w3)] {
            assert_eq!(s.queue_send(q, &[element], Timeout::NoWait), Ok(Outcome::Done));
            assert_eq!(s.get_state(expected), Some(ThreadState::Ready));
            assert_eq!(wake_of(&mut s, expected), Some(WakeReason::Signaled));
            assert_eq!(s.queue_len(q), Ok(0));
        }
        assert_eq!(bufs, [[30], [10], [40], [20]]);
    }

    #[test]
    fn signal_cancels_timeout() {
        let mut s = scheduler();
        let q = s.queue_create(storage(1), 1, 1).unwrap();
        let receiver = spawn(&mut s, 1);
        let producer = spawn(&mut s, 2);

        run_as(&mut s, receiver);
        let mut buf = [0u8; 1];
        assert_eq!(
            s.queue_receive(q, &mut buf, Timeout::Ticks(5)),
            Ok(Outcome::Pending)
        );
        s.tick();
        s.tick();

        assert_eq!(s.switch_to_next(), Some(producer));
        s.queue_send(q, &[0xAB], Timeout::NoWait).unwrap();
        assert_eq!(buf, [0xAB]);
        assert_eq!(s.switch_to_next(), Some(receiver));
        assert_eq!(s.take_current_wake(), Some(WakeReason::Signaled));

        // block again without timeout and run far past the old expiry
        assert_eq!(
            s.queue_receive(q, &mut buf, Timeout::Never),
            Ok(Outcome::Pending)
        );
        for _ in 0..10 {
            s.tick();
        }
        assert_eq!(
            s.get_state(receiver),
            Some(ThreadState::Blocked(WaitObject::QueueRx(q)))
        );
        assert_eq!(wake_of(&mut s, receiver), None);
    }

    #[test]
    fn timeout_removes_waiter_from_queue() {
        let mut s = scheduler();
        let q = s.queue_create(storage(1), 1, 1).unwrap();
        let impatient = spawn(&mut s, 1);
        let patient = spawn(&mut s, 2);
        let producer = spawn(&mut s, 3);

        let mut a = [0u8; 1];
        let mut b = [0u8; 1];
        run_as(&mut s, impatient);
        s.queue_receive(q, &mut a, Timeout::Ticks(2)).unwrap();
        run_as(&mut s, patient);
        s.queue_receive(q, &mut b, Timeout::Never).unwrap();

        s.tick();
        s.tick();
        assert_eq!(wake_of(&mut s, impatient), Some(WakeReason::TimedOut));

        run_as(&mut s, producer);
        s.queue_send(q, &[5], Timeout::NoWait).unwrap();
        assert_eq!(wake_of(&mut s, patient), Some(WakeReason::Signaled));
        assert_eq!((a, b), ([0], [5]));
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let mut s = scheduler();
        let q = s.queue_create(storage(3), 1, 3).unwrap();
        let pid = spawn(&mut s, 0);
        run_as(&mut s, pid);

        let mut out = [0u8; 1];
        let ops = [true, true, false, true, true, true, true, false, false, false, false, true];
        for send in ops {
            let before = s.queue_len(q).unwrap();
            let res = if send {
                s.queue_send(q, &[before as u8], Timeout::NoWait)
            } else {
                s.queue_receive(q, &mut out, Timeout::NoWait)
            };
            let after = s.queue_len(q).unwrap();
            assert!(after <= 3);
            match res {
                Ok(Outcome::Done) => {}
                Err(Error::WouldBlock) => assert_eq!(before, after),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(s.get_state(pid), Some(ThreadState::Running));
        assert!(s.timers.is_empty());
    }

    #[test]
    fn elements_round_trip_in_order() {
        let mut s = scheduler();
        let q = s.queue_create(storage(16), 4, 4).unwrap();
        let pid = spawn(&mut s, 0);
        run_as(&mut s, pid);

        let elements = [[0x00, 0xFF, 0x80, 0x7F], [1, 2, 3, 4], [0xDE, 0xAD, 0xBE, 0xEF]];
        let mut out = [0u8; 4];
        // wrap the ring a few times
        for _ in 0..3 {
            for e in &elements {
                s.queue_send(q, e, Timeout::NoWait).unwrap();
            }
            for e in &elements {
                s.queue_receive(q, &mut out, Timeout::NoWait).unwrap();
                assert_eq!(&out, e);
            }
        }
    }

    #[test]
    fn full_queue_then_blocked_sender() {
        let mut s = scheduler();
        let q = s.queue_create(storage(1), 1, 1).unwrap();
        let a = spawn(&mut s, 1);
        let b = spawn(&mut s, 1);
        let c = spawn(&mut s, 1);

        run_as(&mut s, a);
        assert_eq!(s.queue_send(q, b"X", Timeout::NoWait), Ok(Outcome::Done));
        assert_eq!(s.queue_len(q), Ok(1));

        run_as(&mut s, b);
        assert_eq!(s.queue_send(q, b"Y", Timeout::NoWait), Err(Error::WouldBlock));
        assert_eq!(s.queue_send(q, b"Y", Timeout::Ticks(0)), Err(Error::WouldBlock));
        assert_eq!(s.queue_len(q), Ok(1));
        assert_eq!(s.get_state(b), Some(ThreadState::Running));

        // retried with a real timeout, B waits for space
        assert_eq!(s.queue_send(q, b"Y", Timeout::Ticks(10)), Ok(Outcome::Pending));

        run_as(&mut s, c);
        let mut out = [0u8; 1];
        assert_eq!(s.queue_receive(q, &mut out, Timeout::NoWait), Ok(Outcome::Done));
        assert_eq!(&out, b"X");
        // Y moved into the freed slot, B's send completed
        assert_eq!(wake_of(&mut s, b), Some(WakeReason::Signaled));
        assert_eq!(s.queue_len(q), Ok(1));
        assert!(s.timers.is_empty());

        s.queue_receive(q, &mut out, Timeout::NoWait).unwrap();
        assert_eq!(&out, b"Y");
        assert_eq!(s.queue_len(q), Ok(0));
    }
}
