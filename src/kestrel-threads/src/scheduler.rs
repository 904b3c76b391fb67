//! Kernel state and the thread state machine.
//!
//! Everything here runs inside a critical section, reached through the
//! [`KernelCell`](crate::kernel_cell::KernelCell) in [`Kernel`](crate::Kernel).
//! Nothing in this module switches context; it only decides who should run.

use kestrel_log::{debug, info, warn};
use kestrel_runqueue::RunQueue;

use crate::arch::ThreadData;
use crate::pool::Pool;
use crate::queue::QueueCb;
use crate::semaphore::SemaphoreCb;
use crate::thread::{StackRegion, Thread, ThreadState, Transfer, WaitObject, WakeReason, STACK_FILL};
use crate::threadlist::Link;
use crate::timer::{Instant, Ticks, TimerQueue};
use crate::{
    Error, RunqueueId, ThreadId, Timeout, QUEUES_NUMOF, SCHED_PRIO_LEVELS, SEMAPHORES_NUMOF,
    THREADS_NUMOF,
};

/// Result of an operation that may have suspended the caller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Completed without blocking.
    Done,
    /// The current thread is now blocked; the wake reason tells how it ended.
    Pending,
}

const FREE_WORDS: usize = THREADS_NUMOF.div_ceil(32);

/// One bit per thread slot, set while the slot is unused.
const fn all_slots_free() -> [u32; FREE_WORDS] {
    let mut words = [u32::MAX; FREE_WORDS];
    let tail = THREADS_NUMOF % 32;
    if tail != 0 {
        words[FREE_WORDS - 1] = (1 << tail) - 1;
    }
    words
}

/// Struct holding all scheduler state
pub(crate) struct Scheduler {
    /// Global thread runqueue.
    pub(crate) runqueue: RunQueue<SCHED_PRIO_LEVELS, THREADS_NUMOF>,
    /// The actual TCBs.
    pub(crate) threads: [Thread; THREADS_NUMOF],
    /// Wait list linkage, one per thread.
    pub(crate) wait_links: [Link; THREADS_NUMOF],
    free_slots: [u32; FREE_WORDS],
    /// Threads neither unused nor terminated.
    live_threads: usize,
    pub(crate) timers: TimerQueue<THREADS_NUMOF>,
    pub(crate) ticks: Instant,
    pub(crate) queues: Pool<QueueCb, QUEUES_NUMOF>,
    pub(crate) semaphores: Pool<SemaphoreCb, SEMAPHORES_NUMOF>,
    /// The currently running thread.
    pub(crate) current_thread: Option<ThreadId>,
    /// Set once the port started dispatching threads.
    pub(crate) started: bool,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            runqueue: RunQueue::new(),
            threads: [const { Thread::default() }; THREADS_NUMOF],
            wait_links: [Link::UNLINKED; THREADS_NUMOF],
            free_slots: all_slots_free(),
            live_threads: 0,
            timers: TimerQueue::new(),
            ticks: 0,
            queues: Pool::new(),
            semaphores: Pool::new(),
            current_thread: None,
            started: false,
        }
    }

    /// Returns checked mutable access to the thread data of the currently
    /// running thread.
    ///
    /// Returns `None` if there is no current thread.
    pub(crate) fn current(&mut self) -> Option<&mut Thread> {
        self.current_thread
            .map(|tid| &mut self.threads[usize::from(tid)])
    }

    pub fn current_pid(&self) -> Option<ThreadId> {
        self.current_thread
    }

    pub(crate) fn thread(&self, pid: ThreadId) -> &Thread {
        &self.threads[usize::from(pid)]
    }

    /// Creates a new thread and makes it ready.
    ///
    /// The stack is filled with [`STACK_FILL`] before `setup` lays out the
    /// initial frame and returns the stack pointer and port data.
    pub(crate) fn create<F>(
        &mut self,
        stack: &'static mut [u8],
        prio: u8,
        min_stack: usize,
        setup: F,
    ) -> Result<ThreadId, Error>
    where
        F: FnOnce(&mut [u8], ThreadId) -> Result<(usize, ThreadData), Error>,
    {
        if usize::from(prio) >= SCHED_PRIO_LEVELS || stack.len() < min_stack {
            return Err(Error::InvalidParam);
        }
        let pid = self.get_unused().ok_or(Error::NoMemorySlots)?;

        stack.fill(STACK_FILL);
        let (sp, data) = setup(stack, pid)?;

        let thread = &mut self.threads[usize::from(pid)];
        thread.sp = sp;
        thread.data = data;
        thread.prio = RunqueueId::new(prio);
        thread.pid = pid;
        thread.stack = StackRegion {
            base: stack.as_ptr() as usize,
            len: stack.len(),
        };
        thread.wake = None;
        thread.transfer = Transfer::NONE;
        self.set_state(pid, ThreadState::Ready);
        self.claim_slot(pid);

        info!("thread {} created, prio {}", pid, prio);
        Ok(pid)
    }

    /// Returns the lowest unused ThreadId.
    fn get_unused(&self) -> Option<ThreadId> {
        let (word, bits) = self
            .free_slots
            .iter()
            .enumerate()
            .find(|(_, bits)| **bits != 0)?;
        let slot = word * 32 + bits.trailing_zeros() as usize;
        Some(ThreadId::new(slot as u8))
    }

    fn claim_slot(&mut self, pid: ThreadId) {
        let slot = usize::from(pid);
        self.free_slots[slot / 32] &= !(1 << (slot % 32));
        self.live_threads += 1;
    }

    /// Marks the slot of a thread that is already dead as unused.
    fn release_slot(&mut self, pid: ThreadId) {
        let slot = usize::from(pid);
        self.free_slots[slot / 32] |= 1 << (slot % 32);
    }

    /// Checks if a thread with valid state exists for this `thread_id`.
    pub(crate) fn is_valid_pid(&self, thread_id: ThreadId) -> bool {
        self.threads
            .get(usize::from(thread_id))
            .is_some_and(|t| !matches!(t.state, ThreadState::Invalid | ThreadState::Terminated))
    }

    /// Returns the state of a thread.
    pub fn get_state(&self, thread_id: ThreadId) -> Option<ThreadState> {
        let thread = self.threads.get(usize::from(thread_id))?;
        (thread.state != ThreadState::Invalid).then_some(thread.state)
    }

    /// Sets the state of a thread.
    ///
    /// This function handles adding/ removing the thread to the Runqueue depending
    /// on its previous or new state.
    pub(crate) fn set_state(&mut self, pid: ThreadId, state: ThreadState) -> ThreadState {
        let thread = &mut self.threads[usize::from(pid)];
        let old_state = thread.state;
        thread.state = state;
        if !old_state.is_runnable() && state.is_runnable() {
            self.runqueue.add(thread.pid, thread.prio);
        } else if old_state.is_runnable() && !state.is_runnable() {
            self.runqueue.del(thread.pid, thread.prio);
        }
        old_state
    }

    /// Whether the port has to switch context: a different thread should run,
    /// or the current one stopped being runnable.
    pub fn needs_switch(&self) -> bool {
        if !self.started {
            return false;
        }
        match self.current_thread {
            Some(pid) => {
                self.runqueue.get_next() != Some(pid)
                    || self.thread(pid).state != ThreadState::Running
            }
            None => self.runqueue.get_next().is_some(),
        }
    }

    /// Makes the head of the runqueue the current thread.
    ///
    /// The previous thread goes back to [`ThreadState::Ready`] if it was
    /// still running, or is reclaimed if it had terminated. Returns `None`
    /// without touching anything if no thread is ready.
    pub(crate) fn switch_to_next(&mut self) -> Option<ThreadId> {
        let next = self.runqueue.get_next()?;
        if let Some(prev) = self.current_thread.filter(|prev| *prev != next) {
            let thread = &mut self.threads[usize::from(prev)];
            match thread.state {
                ThreadState::Running => thread.state = ThreadState::Ready,
                ThreadState::Terminated => {
                    debug!("thread {} reclaimed", prev);
                    thread.state = ThreadState::Invalid;
                    self.release_slot(prev);
                }
                _ => {}
            }
        }
        self.threads[usize::from(next)].state = ThreadState::Running;
        self.current_thread = Some(next);
        Some(next)
    }

    /// "Yields" to another thread with the same priority.
    pub(crate) fn yield_current(&mut self) {
        if let Some(prio) = self.current().map(|t| t.prio) {
            self.runqueue.advance(prio);
        }
    }

    /// Suspends the current thread on `object`, arming its timer if the
    /// timeout is bounded.
    ///
    /// The caller enrolls the returned thread in the object's wait list.
    pub(crate) fn block_current(
        &mut self,
        object: WaitObject,
        timeout: Timeout,
        transfer: Transfer,
    ) -> Result<ThreadId, Error> {
        let expiry = match timeout.normalize() {
            Timeout::NoWait => return Err(Error::WouldBlock),
            Timeout::Ticks(ticks) => Some(self.ticks + Instant::from(ticks)),
            Timeout::Never => None,
        };
        let pid = self
            .current_thread
            .filter(|pid| self.thread(*pid).state == ThreadState::Running)
            .ok_or(Error::WouldBlock)?;

        let thread = &mut self.threads[usize::from(pid)];
        thread.wake = None;
        thread.transfer = transfer;
        self.set_state(pid, ThreadState::Blocked(object));
        if let Some(expiry) = expiry {
            self.timers.insert(pid, expiry);
        }
        Ok(pid)
    }

    /// Resolves the wait of `pid` and makes it ready.
    ///
    /// Cancels its timer, so the wait is resolved exactly once.
    pub(crate) fn wake(&mut self, pid: ThreadId, reason: WakeReason) {
        self.timers.remove(pid);
        let thread = &mut self.threads[usize::from(pid)];
        debug_assert!(matches!(thread.state, ThreadState::Blocked(_)));
        thread.wake = Some(reason);
        thread.transfer = Transfer::NONE;
        self.set_state(pid, ThreadState::Ready);
    }

    /// Takes the wake reason of `pid`, once.
    pub(crate) fn take_wake(&mut self, pid: ThreadId) -> Option<WakeReason> {
        self.threads[usize::from(pid)].wake.take()
    }

    /// Takes the wake reason of the current thread, once it is running again.
    pub(crate) fn take_current_wake(&mut self) -> Option<WakeReason> {
        let pid = self.current_thread?;
        if self.thread(pid).state != ThreadState::Running {
            return None;
        }
        self.take_wake(pid)
    }

    /// Unlinks a blocked thread from the wait list it is enrolled in.
    pub(crate) fn detach(&mut self, pid: ThreadId) {
        let links = &mut self.wait_links;
        match self.threads[usize::from(pid)].state {
            ThreadState::Blocked(WaitObject::QueueRx(queue)) => {
                if let Some(queue) = self.queues.get_mut(queue.0) {
                    queue.rx_waiters.remove(pid, links);
                }
            }
            ThreadState::Blocked(WaitObject::QueueTx(queue)) => {
                if let Some(queue) = self.queues.get_mut(queue.0) {
                    queue.tx_waiters.remove(pid, links);
                }
            }
            ThreadState::Blocked(WaitObject::Semaphore(sem)) => {
                if let Some(sem) = self.semaphores.get_mut(sem.0) {
                    sem.waiters.remove(pid, links);
                }
            }
            _ => {}
        }
    }

    /// Deletes a thread.
    ///
    /// The thread leaves the runqueue, its wait list and the timer queue. A
    /// thread deleting itself is only marked terminated, its slot is reclaimed
    /// once another thread runs. Returns whether `pid` was the current thread.
    pub(crate) fn delete(&mut self, pid: ThreadId) -> Result<bool, Error> {
        if !self.is_valid_pid(pid) {
            warn!("thread {}: invalid handle", pid);
            return Err(Error::InvalidHandle);
        }
        self.detach(pid);
        self.timers.remove(pid);
        let thread = &mut self.threads[usize::from(pid)];
        thread.wake = None;
        thread.transfer = Transfer::NONE;

        let is_current = self.current_thread == Some(pid);
        if is_current {
            self.set_state(pid, ThreadState::Terminated);
        } else {
            self.set_state(pid, ThreadState::Invalid);
            self.release_slot(pid);
        }
        self.live_threads -= 1;
        info!("thread {} deleted", pid);
        Ok(is_current)
    }

    /// Terminates the current thread after its entry function returned.
    pub(crate) fn exit_current(&mut self) {
        if let Some(pid) = self.current_thread {
            debug!("thread {} exited", pid);
            let _ = self.delete(pid);
        }
    }

    /// Suspends the current thread for `ticks`.
    pub(crate) fn delay(&mut self, ticks: Ticks) -> Result<Outcome, Error> {
        if ticks == 0 {
            return Ok(Outcome::Done);
        }
        self.block_current(WaitObject::Delay, Timeout::Ticks(ticks), Transfer::NONE)?;
        Ok(Outcome::Pending)
    }

    /// Advances time by one tick and times out every due wait.
    pub(crate) fn tick(&mut self) {
        self.ticks += 1;
        while let Some(pid) = self.timers.pop_due(self.ticks) {
            self.detach(pid);
            self.wake(pid, WakeReason::TimedOut);
        }
    }

    /// Whether a tick could make progress.
    pub(crate) fn has_pending_timers(&self) -> bool {
        !self.timers.is_empty()
    }

    /// Idles until the earliest armed timer fires, as if the ticks in
    /// between had passed with nothing to do.
    #[allow(dead_code)]
    pub(crate) fn skip_to_next_expiry(&mut self) {
        if let Some(expiry) = self.timers.next_expiry() {
            self.ticks = expiry - 1;
            self.tick();
        }
    }

    /// Whether any thread is still alive.
    pub(crate) fn has_threads(&self) -> bool {
        self.live_threads > 0
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::arch::{Arch, Cpu};

    pub(crate) fn stack() -> &'static mut [u8] {
        Box::leak(Box::new([0u8; 512]))
    }

    /// A started scheduler with no threads.
    pub(crate) fn scheduler() -> Scheduler {
        let mut s = Scheduler::new();
        s.started = true;
        s
    }

    pub(crate) fn spawn(s: &mut Scheduler, prio: u8) -> ThreadId {
        s.create(stack(), prio, 0, |_, _| Ok((0, Cpu::DEFAULT_THREAD_DATA)))
            .unwrap()
    }

    /// Lets `pid` run, as if every more urgent thread were not there.
    pub(crate) fn run_as(s: &mut Scheduler, pid: ThreadId) {
        if let Some(prev) = s.current_thread {
            if s.thread(prev).state == ThreadState::Running {
                s.threads[usize::from(prev)].state = ThreadState::Ready;
            }
        }
        assert!(s.thread(pid).state.is_runnable());
        s.threads[usize::from(pid)].state = ThreadState::Running;
        s.current_thread = Some(pid);
    }

    #[test]
    fn create_validates_arguments() {
        let mut s = scheduler();
        let setup = |_: &mut [u8], _| Ok((0, Cpu::DEFAULT_THREAD_DATA));
        assert_eq!(
            s.create(stack(), SCHED_PRIO_LEVELS as u8, 0, setup),
            Err(Error::InvalidParam)
        );
        assert_eq!(
            s.create(stack(), 0, 4096, setup),
            Err(Error::InvalidParam)
        );
        for _ in 0..THREADS_NUMOF {
            spawn(&mut s, 1);
        }
        assert_eq!(s.create(stack(), 1, 0, setup), Err(Error::NoMemorySlots));
    }

    #[test]
    fn create_fills_stack() {
        let mut s = scheduler();
        let pid = s
            .create(stack(), 3, 0, |stack, _| {
                assert!(stack.iter().all(|b| *b == STACK_FILL));
                // pretend the thread used the top 100 bytes
                let len = stack.len();
                stack[len - 100..].fill(0);
                Ok((0, Cpu::DEFAULT_THREAD_DATA))
            })
            .unwrap();
        let region = s.thread(pid).stack;
        assert_eq!(region.len, 512);
        assert_eq!(region.untouched(), 412);
    }

    #[test]
    fn lowest_priority_value_runs_first() {
        let mut s = scheduler();
        let background = spawn(&mut s, 10);
        assert_eq!(s.switch_to_next(), Some(background));

        let urgent = spawn(&mut s, 2);
        assert!(s.needs_switch());
        assert_eq!(s.switch_to_next(), Some(urgent));
        assert_eq!(s.get_state(background), Some(ThreadState::Ready));
        assert_eq!(s.get_state(urgent), Some(ThreadState::Running));
        assert!(!s.needs_switch());
    }

    #[test]
    fn nothing_switches_before_start() {
        let mut s = Scheduler::new();
        spawn(&mut s, 1);
        assert!(!s.needs_switch());
        s.started = true;
        assert!(s.needs_switch());
    }

    #[test]
    fn yield_rotates_equal_priorities() {
        let mut s = scheduler();
        let a = spawn(&mut s, 4);
        let b = spawn(&mut s, 4);
        assert_eq!(s.switch_to_next(), Some(a));
        s.yield_current();
        assert!(s.needs_switch());
        assert_eq!(s.switch_to_next(), Some(b));
        s.yield_current();
        assert_eq!(s.switch_to_next(), Some(a));
    }

    #[test]
    fn delay_blocks_until_expiry() {
        let mut s = scheduler();
        let sleeper = spawn(&mut s, 1);
        let idle = spawn(&mut s, 9);
        s.switch_to_next();

        assert_eq!(s.delay(0), Ok(Outcome::Done));
        assert_eq!(s.delay(3), Ok(Outcome::Pending));
        assert_eq!(
            s.get_state(sleeper),
            Some(ThreadState::Blocked(WaitObject::Delay))
        );
        assert_eq!(s.switch_to_next(), Some(idle));

        s.tick();
        s.tick();
        assert!(!s.needs_switch());
        s.tick();
        assert!(s.needs_switch());
        assert_eq!(s.switch_to_next(), Some(sleeper));
        assert_eq!(s.take_current_wake(), Some(WakeReason::TimedOut));
        assert_eq!(s.take_current_wake(), None);
    }

    #[test]
    fn longest_delay_is_not_due_early() {
        let mut s = scheduler();
        let sleeper = spawn(&mut s, 1);
        let other = spawn(&mut s, 2);
        s.switch_to_next();

        assert_eq!(s.delay(Ticks::MAX), Ok(Outcome::Pending));
        assert_eq!(s.switch_to_next(), Some(other));
        s.tick();
        assert_eq!(
            s.get_state(sleeper),
            Some(ThreadState::Blocked(WaitObject::Delay))
        );

        // a short wait armed later still fires first
        run_as(&mut s, other);
        assert_eq!(s.delay(3), Ok(Outcome::Pending));
        assert_eq!(s.timers.next_expiry(), Some(4));

        s.skip_to_next_expiry();
        assert_eq!(s.get_state(other), Some(ThreadState::Ready));
        assert_eq!(
            s.get_state(sleeper),
            Some(ThreadState::Blocked(WaitObject::Delay))
        );

        s.skip_to_next_expiry();
        assert_eq!(s.ticks, Instant::from(Ticks::MAX));
        assert_eq!(s.get_state(sleeper), Some(ThreadState::Ready));
    }

    #[test]
    fn blocking_needs_a_running_thread() {
        let mut s = scheduler();
        assert_eq!(s.delay(5), Err(Error::WouldBlock));
        assert!(s.timers.is_empty());
    }

    #[test]
    fn deleting_blocked_thread_cancels_timer() {
        let mut s = scheduler();
        let sleeper = spawn(&mut s, 1);
        let other = spawn(&mut s, 2);
        s.switch_to_next();
        s.delay(10).unwrap();
        assert_eq!(s.switch_to_next(), Some(other));

        assert_eq!(s.delete(sleeper), Ok(false));
        assert_eq!(s.get_state(sleeper), None);
        assert!(s.timers.is_empty());
        assert_eq!(s.delete(sleeper), Err(Error::InvalidHandle));

        for _ in 0..20 {
            s.tick();
        }
        assert!(!s.needs_switch());
        assert_eq!(s.get_state(sleeper), None);
    }

    #[test]
    fn current_thread_is_reclaimed_after_switch() {
        let mut s = scheduler();
        let first = spawn(&mut s, 1);
        let second = spawn(&mut s, 2);
        s.switch_to_next();

        s.exit_current();
        assert_eq!(s.get_state(first), Some(ThreadState::Terminated));
        assert!(!s.is_valid_pid(first));
        // the slot is still in use until the switch
        let third = spawn(&mut s, 3);
        assert_ne!(third, first);

        assert_eq!(s.switch_to_next(), Some(second));
        assert_eq!(s.get_state(first), None);
        assert_eq!(spawn(&mut s, 3), first);
    }

    #[test]
    fn freed_slots_are_reused_lowest_first() {
        let mut s = scheduler();
        let pids: Vec<_> = (0..THREADS_NUMOF).map(|_| spawn(&mut s, 1)).collect();
        let setup = |_: &mut [u8], _| Ok((0, Cpu::DEFAULT_THREAD_DATA));
        assert_eq!(s.create(stack(), 1, 0, setup), Err(Error::NoMemorySlots));

        let last = pids[THREADS_NUMOF - 1];
        s.delete(last).unwrap();
        if THREADS_NUMOF > 2 {
            s.delete(pids[1]).unwrap();
            assert_eq!(spawn(&mut s, 1), pids[1]);
        }
        assert_eq!(spawn(&mut s, 1), last);
        assert_eq!(s.create(stack(), 1, 0, setup), Err(Error::NoMemorySlots));

        for pid in &pids {
            s.delete(*pid).unwrap();
        }
        assert!(!s.has_threads());
        assert_eq!(spawn(&mut s, 1), pids[0]);
        assert!(s.has_threads());
    }

    #[test]
    fn has_threads_tracks_live_threads() {
        let mut s = scheduler();
        assert!(!s.has_threads());
        let pid = spawn(&mut s, 0);
        s.switch_to_next();
        assert!(s.has_threads());
        s.exit_current();
        assert!(!s.has_threads());
        assert_eq!(s.switch_to_next(), None);
        assert_eq!(s.current_pid(), Some(pid));
    }
}
