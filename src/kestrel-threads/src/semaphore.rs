//! Counting semaphores, blocking through the same wait machinery as queues.

use kestrel_log::{info, warn};

use crate::pool::Handle;
use crate::scheduler::{Outcome, Scheduler};
use crate::thread::{Transfer, WaitObject, WakeReason};
use crate::threadlist::ThreadList;
use crate::{Error, Timeout};

/// Handle to a counting semaphore.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SemaphoreId(pub(crate) Handle);

pub(crate) struct SemaphoreCb {
    count: u8,
    /// Only non-empty while `count == 0`.
    pub(crate) waiters: ThreadList,
}

impl Scheduler {
    pub(crate) fn semaphore_create(&mut self, initial: u8) -> Result<SemaphoreId, Error> {
        let id = SemaphoreId(self.semaphores.insert(SemaphoreCb {
            count: initial,
            waiters: ThreadList::new(),
        })?);
        info!("semaphore {} created, count {}", id, initial);
        Ok(id)
    }

    pub(crate) fn semaphore_delete(&mut self, id: SemaphoreId) -> Result<(), Error> {
        let mut sem = self.semaphores.remove(id.0).ok_or_else(|| unknown(id))?;
        while let Some(pid) = sem.waiters.pop(&mut self.wait_links) {
            self.wake(pid, WakeReason::Deleted);
        }
        info!("semaphore {} deleted", id);
        Ok(())
    }

    pub(crate) fn semaphore_get(
        &mut self,
        id: SemaphoreId,
        timeout: Timeout,
    ) -> Result<Outcome, Error> {
        let sem = self.semaphores.get_mut(id.0).ok_or_else(|| unknown(id))?;
        if sem.count > 0 {
            sem.count -= 1;
            return Ok(Outcome::Done);
        }
        let pid = self.block_current(WaitObject::Semaphore(id), timeout, Transfer::NONE)?;
        if let Some(sem) = self.semaphores.get_mut(id.0) {
            sem.waiters.insert(pid, &self.threads, &mut self.wait_links);
        }
        Ok(Outcome::Pending)
    }

    /// Hands the unit to the first waiter, or increments the count.
    pub(crate) fn semaphore_put(&mut self, id: SemaphoreId) -> Result<(), Error> {
        let sem = self.semaphores.get_mut(id.0).ok_or_else(|| unknown(id))?;
        if let Some(pid) = sem.waiters.pop(&mut self.wait_links) {
            self.wake(pid, WakeReason::Signaled);
            return Ok(());
        }
        sem.count = sem.count.checked_add(1).ok_or(Error::Overflow)?;
        Ok(())
    }

    pub(crate) fn semaphore_count(&self, id: SemaphoreId) -> Result<u8, Error> {
        self.semaphores
            .get(id.0)
            .map(|sem| sem.count)
            .ok_or_else(|| unknown(id))
    }
}

fn unknown(id: SemaphoreId) -> Error {
    warn!("semaphore {}: invalid handle", id);
    Error::InvalidHandle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::tests::{run_as, scheduler, spawn};
    use crate::thread::ThreadState;

    #[test]
    fn count_and_overflow() {
        let mut s = scheduler();
        let sem = s.semaphore_create(u8::MAX - 1).unwrap();
        s.semaphore_put(sem).unwrap();
        assert_eq!(s.semaphore_put(sem), Err(Error::Overflow));
        assert_eq!(s.semaphore_count(sem), Ok(u8::MAX));

        let pid = spawn(&mut s, 0);
        run_as(&mut s, pid);
        assert_eq!(s.semaphore_get(sem, Timeout::NoWait), Ok(Outcome::Done));
        assert_eq!(s.semaphore_count(sem), Ok(u8::MAX - 1));
    }

    #[test]
    fn put_wakes_waiters_in_priority_order() {
        let mut s = scheduler();
        let sem = s.semaphore_create(0).unwrap();
        let low = spawn(&mut s, 6);
        let high = spawn(&mut s, 1);
        let poster = spawn(&mut s, 9);

        for pid in [low, high] {
            run_as(&mut s, pid);
            assert_eq!(s.semaphore_get(sem, Timeout::Never), Ok(Outcome::Pending));
        }
        run_as(&mut s, poster);
        assert_eq!(s.semaphore_get(sem, Timeout::NoWait), Err(Error::WouldBlock));

        s.semaphore_put(sem).unwrap();
        assert_eq!(s.take_wake(high), Some(WakeReason::Signaled));
        assert_eq!(
            s.get_state(low),
            Some(ThreadState::Blocked(WaitObject::Semaphore(sem)))
        );
        assert_eq!(s.semaphore_count(sem), Ok(0));
    }

    #[test]
    fn delete_wakes_waiters() {
        let mut s = scheduler();
        let sem = s.semaphore_create(0).unwrap();
        let waiter = spawn(&mut s, 2);
        run_as(&mut s, waiter);
        s.semaphore_get(sem, Timeout::Ticks(100)).unwrap();

        s.semaphore_delete(sem).unwrap();
        assert_eq!(s.take_wake(waiter), Some(WakeReason::Deleted));
        assert!(s.timers.is_empty());
        assert_eq!(s.semaphore_put(sem), Err(Error::InvalidHandle));
        assert_eq!(s.semaphore_delete(sem), Err(Error::InvalidHandle));
    }
}
