//! Preemptive priority scheduler with tick-based timeouts and blocking
//! message queues.
//!
//! All kernel state lives in one [`Kernel`] value, usually a `static`. Every
//! mutation happens inside a critical section; context switches are requested
//! from the port afterwards. Priorities are [`RunqueueId`]s: the lower the
//! value, the more urgent the thread.
//!
//! A wait on a queue or semaphore ends in exactly one of three ways: the
//! object is signaled, the timeout expires, or the object is deleted.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
// Disable indexing lints for now, possible panics are documented or rely on internally-enforced
// invariants
#![allow(clippy::indexing_slicing)]

use core::sync::atomic::{fence, Ordering};

pub use kestrel_runqueue::{RunqueueId, ThreadId};

mod arch;
pub mod critical;
mod error;
mod kernel_cell;
mod pool;
mod queue;
mod scheduler;
mod semaphore;
mod thread;
mod threadlist;
mod timer;

#[cfg(all(target_arch = "arm", target_feature = "thumb2"))]
pub use arch::configure_systick;
pub use error::Error;
pub use queue::QueueId;
pub use semaphore::SemaphoreId;
pub use thread::{StackUsage, ThreadState, WaitObject};
pub use timer::{Instant, Ticks};

use arch::{Arch, Cpu};
use kernel_cell::KernelCell;
use scheduler::{Outcome, Scheduler};
use thread::WakeReason;

/// a global defining the number of possible priority levels
pub const SCHED_PRIO_LEVELS: usize = kestrel_utils::usize_from_env_or!(
    "CONFIG_SCHED_PRIO_LEVELS",
    32,
    "number of thread priority levels"
);

/// a global defining the number of threads that can be created
pub const THREADS_NUMOF: usize =
    kestrel_utils::usize_from_env_or!("CONFIG_THREADS_NUMOF", 16, "maximum number of threads");

/// Maximum number of message queues alive at once.
pub const QUEUES_NUMOF: usize =
    kestrel_utils::usize_from_env_or!("CONFIG_QUEUES_NUMOF", 8, "maximum number of queues");

/// Maximum number of semaphores alive at once.
pub const SEMAPHORES_NUMOF: usize = kestrel_utils::usize_from_env_or!(
    "CONFIG_SEMAPHORES_NUMOF",
    8,
    "maximum number of semaphores"
);

/// Tick rate; all timeouts are in ticks.
pub const TICKS_PER_SEC: u32 =
    kestrel_utils::u32_from_env_or!("CONFIG_TICKS_PER_SEC", 100, "kernel ticks per second");

/// Smallest stack accepted by [`Kernel::thread_create`] on this port.
pub const MIN_STACK_SIZE: usize = <Cpu as Arch>::MIN_STACK_SIZE;

const _: () = assert!(SCHED_PRIO_LEVELS > 0 && SCHED_PRIO_LEVELS <= 32);
const _: () = assert!(THREADS_NUMOF > 0 && THREADS_NUMOF < 255);
const _: () = assert!(QUEUES_NUMOF < 256 && SEMAPHORES_NUMOF < 256);
const _: () = assert!(TICKS_PER_SEC > 0);

/// Thread entry function.
pub type ThreadFn = fn(arg: usize);

/// How long a call may block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Timeout {
    /// Fail with [`Error::WouldBlock`] instead of blocking.
    NoWait,
    /// Block for at most this many ticks. `Ticks(0)` is the same as
    /// [`Timeout::NoWait`].
    Ticks(Ticks),
    /// Block until signaled or until the object is deleted.
    Never,
}

impl Timeout {
    pub(crate) fn normalize(self) -> Self {
        match self {
            Self::Ticks(0) => Self::NoWait,
            other => other,
        }
    }
}

/// The kernel: scheduler state plus the port driving it.
pub struct Kernel {
    pub(crate) scheduler: KernelCell<Scheduler>,
    pub(crate) cpu: Cpu,
}

impl Kernel {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            scheduler: KernelCell::new(Scheduler::new()),
            cpu: Cpu::new(),
        }
    }

    /// Triggers the port if another thread should run now.
    fn reschedule(&'static self) {
        if self.scheduler.with(|s| s.needs_switch()) {
            self.cpu.schedule(self);
        }
    }

    /// Switches away from the blocked current thread and returns why it was
    /// woken.
    fn wait(&'static self) -> WakeReason {
        loop {
            self.cpu.schedule(self);
            if let Some(reason) = self.scheduler.with_mut(|mut s| s.take_current_wake()) {
                // whoever woke us may have written our transfer buffer
                fence(Ordering::Acquire);
                return reason;
            }
        }
    }

    fn complete(&'static self, outcome: Outcome) -> Result<(), Error> {
        match outcome {
            Outcome::Done => {
                self.reschedule();
                Ok(())
            }
            Outcome::Pending => match self.wait() {
                WakeReason::Signaled => Ok(()),
                WakeReason::TimedOut => Err(Error::Timeout),
                WakeReason::Deleted => Err(Error::Deleted),
            },
        }
    }

    /// Interrupt handlers must not block.
    fn allowed(timeout: Timeout) -> Timeout {
        if Cpu::in_isr() {
            Timeout::NoWait
        } else {
            timeout
        }
    }

    /// Creates a thread running `func(arg)` on `stack` with priority `prio`.
    ///
    /// The thread is ready immediately and preempts the caller if it is more
    /// urgent. Returning from `func` terminates it.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParam`] if `prio` is not below [`SCHED_PRIO_LEVELS`] or
    /// the stack is smaller than [`MIN_STACK_SIZE`];
    /// [`Error::NoMemorySlots`] if all [`THREADS_NUMOF`] slots are in use.
    pub fn thread_create(
        &'static self,
        func: ThreadFn,
        arg: usize,
        stack: &'static mut [u8],
        prio: u8,
    ) -> Result<ThreadId, Error> {
        let pid = self.scheduler.with_mut(|mut s| {
            s.create(stack, prio, MIN_STACK_SIZE, |stack, _| {
                self.cpu.setup_stack(self, stack, func, arg)
            })
        })?;
        self.reschedule();
        Ok(pid)
    }

    /// Deletes a thread, wherever it is waiting.
    ///
    /// Deleting the current thread does not return.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidHandle`] if no such thread exists.
    pub fn thread_delete(&'static self, thread_id: ThreadId) -> Result<(), Error> {
        let was_current = self.scheduler.with_mut(|mut s| s.delete(thread_id))?;
        if was_current {
            self.cpu.schedule(self);
            unreachable!();
        }
        self.reschedule();
        Ok(())
    }

    /// "Yields" to another thread with the same priority.
    pub fn thread_yield(&'static self) {
        self.scheduler.with_mut(|mut s| s.yield_current());
        self.reschedule();
    }

    /// Returns the [`ThreadId`] of the currently active thread.
    ///
    /// Note: when called from ISRs, this will return the thread id of the thread
    /// that was interrupted.
    pub fn current_pid(&self) -> Option<ThreadId> {
        self.scheduler.with(|s| s.current_pid())
    }

    /// Returns the [`ThreadState`] for this `thread_id`.
    ///
    /// Returns `None` if `thread_id` is out of bound or no thread with
    /// valid state exists.
    pub fn thread_state(&self, thread_id: ThreadId) -> Option<ThreadState> {
        self.scheduler.with(|s| s.get_state(thread_id))
    }

    /// Stack size and high-water mark of a thread.
    ///
    /// On the host port threads run on OS thread stacks, never on the one
    /// passed to [`Kernel::thread_create`], so `used` is always `0` there.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidHandle`] if no such thread exists.
    pub fn thread_stack_usage(&self, thread_id: ThreadId) -> Result<StackUsage, Error> {
        self.scheduler.with(|s| {
            if !s.is_valid_pid(thread_id) {
                return Err(Error::InvalidHandle);
            }
            let stack = s.thread(thread_id).stack;
            Ok(StackUsage {
                size: stack.len,
                used: stack.len - stack.untouched(),
            })
        })
    }

    /// Creates a queue of `capacity` elements of `element_size` bytes over
    /// `storage`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParam`] if either size is zero or `storage` is too
    /// small; [`Error::NoMemorySlots`] if all [`QUEUES_NUMOF`] slots are in use.
    pub fn queue_create(
        &self,
        storage: &'static mut [u8],
        element_size: usize,
        capacity: usize,
    ) -> Result<QueueId, Error> {
        self.scheduler
            .with_mut(|mut s| s.queue_create(storage, element_size, capacity))
    }

    /// Deletes a queue and hands its storage back.
    ///
    /// Every thread blocked on the queue wakes with [`Error::Deleted`].
    ///
    /// # Errors
    ///
    /// [`Error::InvalidHandle`] if the queue does not exist (anymore).
    pub fn queue_delete(&'static self, queue: QueueId) -> Result<&'static mut [u8], Error> {
        let storage = self.scheduler.with_mut(|mut s| s.queue_delete(queue))?;
        self.reschedule();
        Ok(storage)
    }

    /// Sends `element`, waiting up to `timeout` while the queue is full.
    ///
    /// A blocked receiver gets the element directly.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`], [`Error::Deleted`] as outcomes of a wait;
    /// [`Error::WouldBlock`] if the queue is full and blocking is not
    /// allowed; [`Error::InvalidHandle`]; [`Error::InvalidParam`] if
    /// `element` does not have the queue's element size.
    pub fn queue_send(
        &'static self,
        queue: QueueId,
        element: &[u8],
        timeout: Timeout,
    ) -> Result<(), Error> {
        let timeout = Self::allowed(timeout);
        let outcome = self
            .scheduler
            .with_mut(|mut s| s.queue_send(queue, element, timeout))?;
        self.complete(outcome)
    }

    /// Receives the oldest element into `out`, waiting up to `timeout` while
    /// the queue is empty.
    ///
    /// # Errors
    ///
    /// Same as [`Kernel::queue_send`].
    pub fn queue_receive(
        &'static self,
        queue: QueueId,
        out: &mut [u8],
        timeout: Timeout,
    ) -> Result<(), Error> {
        let timeout = Self::allowed(timeout);
        let outcome = self
            .scheduler
            .with_mut(|mut s| s.queue_receive(queue, out, timeout))?;
        self.complete(outcome)
    }

    /// Number of elements stored in the queue.
    pub fn queue_len(&self, queue: QueueId) -> Result<usize, Error> {
        self.scheduler.with(|s| s.queue_len(queue))
    }

    /// Creates a counting semaphore.
    ///
    /// # Errors
    ///
    /// [`Error::NoMemorySlots`] if all [`SEMAPHORES_NUMOF`] slots are in use.
    pub fn semaphore_create(&self, initial: u8) -> Result<SemaphoreId, Error> {
        self.scheduler.with_mut(|mut s| s.semaphore_create(initial))
    }

    /// Deletes a semaphore; its waiters wake with [`Error::Deleted`].
    pub fn semaphore_delete(&'static self, semaphore: SemaphoreId) -> Result<(), Error> {
        self.scheduler
            .with_mut(|mut s| s.semaphore_delete(semaphore))?;
        self.reschedule();
        Ok(())
    }

    /// Takes one unit, waiting up to `timeout` while the count is zero.
    pub fn semaphore_get(&'static self, semaphore: SemaphoreId, timeout: Timeout) -> Result<(), Error> {
        let timeout = Self::allowed(timeout);
        let outcome = self
            .scheduler
            .with_mut(|mut s| s.semaphore_get(semaphore, timeout))?;
        self.complete(outcome)
    }

    /// Releases one unit, waking the first waiter if there is one.
    ///
    /// # Errors
    ///
    /// [`Error::Overflow`] if the count is already at its maximum.
    pub fn semaphore_put(&'static self, semaphore: SemaphoreId) -> Result<(), Error> {
        self.scheduler.with_mut(|mut s| s.semaphore_put(semaphore))?;
        self.reschedule();
        Ok(())
    }

    pub fn semaphore_count(&self, semaphore: SemaphoreId) -> Result<u8, Error> {
        self.scheduler.with(|s| s.semaphore_count(semaphore))
    }

    /// Suspends the current thread for `ticks`. `0` returns immediately.
    ///
    /// # Errors
    ///
    /// [`Error::WouldBlock`] when called outside of a thread.
    pub fn delay(&'static self, ticks: Ticks) -> Result<(), Error> {
        if ticks == 0 {
            return Ok(());
        }
        if Cpu::in_isr() {
            return Err(Error::WouldBlock);
        }
        let outcome = self.scheduler.with_mut(|mut s| s.delay(ticks))?;
        // a delay only ends by expiring
        let _ = self.complete(outcome);
        Ok(())
    }

    /// Advances time by one tick.
    ///
    /// Called from the tick interrupt. Times out due waits and requests a
    /// context switch if a more urgent thread became ready.
    pub fn tick(&'static self) {
        self.scheduler.with_mut(|mut s| s.tick());
        self.reschedule();
    }

    /// Ticks since start.
    pub fn ticks(&self) -> Instant {
        self.scheduler.with(|s| s.ticks)
    }
}
