use crate::arch::{Arch, Cpu, ThreadData};
use crate::{QueueId, RunqueueId, SemaphoreId, ThreadId};

/// Byte pattern new stacks are filled with, for high-water detection.
pub(crate) const STACK_FILL: u8 = 0x5A;

/// Main struct for holding thread data
#[derive(Debug)]
pub struct Thread {
    pub sp: usize,
    pub state: ThreadState,
    pub prio: RunqueueId,
    pub pid: ThreadId,
    pub(crate) data: ThreadData,
    pub(crate) stack: StackRegion,
    /// Why the thread was last woken; set by whoever resolves its wait.
    pub(crate) wake: Option<WakeReason>,
    /// Element buffer of a pending queue operation.
    pub(crate) transfer: Transfer,
}

/// Possible states of a thread
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ThreadState {
    /// Free TCB slot.
    Invalid,
    /// Runnable, waiting for the CPU.
    Ready,
    Running,
    /// Suspended until the wait on the object is resolved.
    Blocked(WaitObject),
    /// Finished or deleted while running; reclaimed at the next context switch.
    Terminated,
}

impl ThreadState {
    /// Whether a thread in this state belongs in the runqueue.
    pub fn is_runnable(self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }
}

/// What a blocked thread is waiting for.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WaitObject {
    /// A plain delay; only the timer can end it.
    Delay,
    QueueRx(QueueId),
    QueueTx(QueueId),
    Semaphore(SemaphoreId),
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum WakeReason {
    Signaled,
    TimedOut,
    Deleted,
}

/// Caller-supplied stack memory. The kernel never frees it.
#[derive(Copy, Clone, Debug)]
pub(crate) struct StackRegion {
    pub base: usize,
    pub len: usize,
}

impl StackRegion {
    pub const EMPTY: Self = Self { base: 0, len: 0 };

    /// Bytes at the bottom of the stack still holding [`STACK_FILL`].
    pub fn untouched(&self) -> usize {
        let mut untouched = 0;
        while untouched < self.len {
            // SAFETY: `base..base + len` is the `'static` stack handed over at
            // thread creation; single byte reads are always in bounds.
            let byte = unsafe { core::ptr::read_volatile((self.base + untouched) as *const u8) };
            if byte != STACK_FILL {
                break;
            }
            untouched += 1;
        }
        untouched
    }
}

/// Stack statistics of a thread.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StackUsage {
    /// Size of the stack in bytes.
    pub size: usize,
    /// High-water mark in bytes.
    pub used: usize,
}

/// Address and length of the element a blocked sender offers, or of the
/// buffer a blocked receiver wants filled.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Transfer {
    ptr: usize,
    len: usize,
}

impl Transfer {
    pub const NONE: Self = Self { ptr: 0, len: 0 };

    pub fn from_slice(element: &[u8]) -> Self {
        Self {
            ptr: element.as_ptr() as usize,
            len: element.len(),
        }
    }

    pub fn from_mut_slice(buffer: &mut [u8]) -> Self {
        Self {
            ptr: buffer.as_mut_ptr() as usize,
            len: buffer.len(),
        }
    }

    /// # Safety
    ///
    /// The thread that registered this transfer must still be blocked in the
    /// call that owns the buffer.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        // SAFETY: upheld by the caller.
        unsafe { core::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }

    /// # Safety
    ///
    /// Same as [`Transfer::as_slice`], and the buffer must have been
    /// registered through [`Transfer::from_mut_slice`].
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        // SAFETY: upheld by the caller.
        unsafe { core::slice::from_raw_parts_mut(self.ptr as *mut u8, self.len) }
    }
}

impl Thread {
    /// create a default Thread object
    pub const fn default() -> Thread {
        Thread {
            sp: 0,
            state: ThreadState::Invalid,
            data: Cpu::DEFAULT_THREAD_DATA,
            prio: RunqueueId::new(0),
            pid: ThreadId::new(0),
            stack: StackRegion::EMPTY,
            wake: None,
            transfer: Transfer::NONE,
        }
    }
}
