//! Host port.
//!
//! Every kernel thread runs on its own OS thread. A baton (mutex + condvar)
//! names the one thread allowed to run, so kernel threads still execute one
//! at a time and only switch where the kernel schedules. There is no tick
//! interrupt: when every thread waits, time jumps to the next expiry.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use kestrel_log::{debug, error};

use super::Arch;
use crate::{Error, Kernel, ThreadFn};

/// Why the kernel stopped.
#[derive(Debug)]
enum Halt {
    Exit(u32),
    /// Threads are alive, but none is ready and no timer is armed.
    Deadlock,
    Panicked(String),
}

struct Baton {
    running: Option<u32>,
    next_token: u32,
    halted: Option<Halt>,
}

/// Unwind payload ending an OS thread once the kernel halted.
struct Halted;

pub(crate) struct Cpu {
    baton: Mutex<Baton>,
    cond: Condvar,
}

impl Cpu {
    pub const fn new() -> Self {
        Self {
            baton: Mutex::new(Baton {
                running: None,
                // 0 is the token of thread slots that never ran
                next_token: 1,
                halted: None,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Baton> {
        self.baton.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn halt(&self, halt: Halt) {
        let mut baton = self.lock();
        if baton.halted.is_none() {
            match &halt {
                Halt::Exit(code) => debug!("host: halting with {}", code),
                Halt::Deadlock => error!("host: deadlock, no thread can run"),
                Halt::Panicked(message) => {
                    error!("host: kernel thread panicked: {}", message.as_str());
                }
            }
            baton.halted = Some(halt);
        }
        baton.running = None;
        self.cond.notify_all();
    }

    fn hand_over(&self, token: u32) {
        let mut baton = self.lock();
        if baton.halted.is_none() {
            baton.running = Some(token);
        }
        self.cond.notify_all();
    }

    /// Blocks the calling OS thread until `token` holds the baton.
    ///
    /// Unwinds with [`Halted`] once the kernel halted.
    fn wait_turn(&self, token: u32) {
        let mut baton = self.lock();
        loop {
            if baton.halted.is_some() {
                drop(baton);
                panic::resume_unwind(Box::new(Halted));
            }
            if baton.running == Some(token) {
                return;
            }
            baton = self.cond.wait(baton).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Makes the next ready thread current, jumping ahead in time while
    /// nothing is ready.
    ///
    /// Returns the tokens of the previous and the new current thread.
    fn dispatch(kernel: &'static Kernel) -> Result<(Option<u32>, u32), Halt> {
        kernel.scheduler.with_mut(|mut s| {
            let prev = s.current_pid().map(|pid| s.thread(pid).data);
            loop {
                if let Some(next) = s.switch_to_next() {
                    return Ok((prev, s.thread(next).data));
                }
                if s.has_pending_timers() {
                    s.skip_to_next_expiry();
                } else if s.has_threads() {
                    return Err(Halt::Deadlock);
                } else {
                    return Err(Halt::Exit(0));
                }
            }
        })
    }

    /// Leaves the thread whose entry function just returned.
    fn exit(&self, kernel: &'static Kernel) {
        kernel.scheduler.with_mut(|mut s| s.exit_current());
        match Self::dispatch(kernel) {
            Ok((_, next)) => self.hand_over(next),
            Err(halt) => self.halt(halt),
        }
    }
}

impl Arch for Cpu {
    /// Baton token of the OS thread backing the kernel thread.
    type ThreadData = u32;

    const DEFAULT_THREAD_DATA: Self::ThreadData = 0;

    const MIN_STACK_SIZE: usize = 64;

    fn setup_stack(
        &self,
        kernel: &'static Kernel,
        _stack: &mut [u8],
        func: ThreadFn,
        arg: usize,
    ) -> Result<(usize, Self::ThreadData), Error> {
        let token = {
            let mut baton = self.lock();
            let token = baton.next_token;
            baton.next_token = token.wrapping_add(1).max(1);
            token
        };

        std::thread::Builder::new()
            .name(format!("kestrel-{token}"))
            .spawn(move || {
                let cpu = &kernel.cpu;
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    cpu.wait_turn(token);
                    func(arg);
                    cpu.exit(kernel);
                }));
                if let Err(payload) = result {
                    if !payload.is::<Halted>() {
                        cpu.halt(Halt::Panicked(panic_message(payload.as_ref())));
                    }
                }
            })
            .map_err(|_| Error::NoMemorySlots)?;

        Ok((0, token))
    }

    fn schedule(&self, kernel: &'static Kernel) {
        match Self::dispatch(kernel) {
            Ok((prev, next)) => {
                if prev == Some(next) {
                    return;
                }
                self.hand_over(next);
                if let Some(prev) = prev {
                    self.wait_turn(prev);
                }
            }
            Err(halt) => {
                self.halt(halt);
                panic::resume_unwind(Box::new(Halted));
            }
        }
    }

    fn in_isr() -> bool {
        false
    }
}

fn panic_message(payload: &(dyn core::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Kernel {
    /// Runs the kernel until a thread calls [`Kernel::halt`].
    ///
    /// The calling OS thread only waits; kernel threads run on their own OS
    /// threads, one at a time. Returns the halt code, or `0` once every
    /// thread has ended.
    ///
    /// # Panics
    ///
    /// Panics if a kernel thread panicked, or if every live thread is blocked
    /// with no timer armed.
    pub fn run(&'static self) -> u32 {
        self.scheduler.with_mut(|mut s| s.started = true);
        match Cpu::dispatch(self) {
            Ok((_, next)) => self.cpu.hand_over(next),
            Err(halt) => self.cpu.halt(halt),
        }

        let baton = self
            .cpu
            .cond
            .wait_while(self.cpu.lock(), |baton| baton.halted.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        match &baton.halted {
            Some(Halt::Exit(code)) => *code,
            Some(Halt::Deadlock) => {
                panic!("kestrel: deadlock, every thread is blocked and no timer is armed")
            }
            Some(Halt::Panicked(message)) => panic!("kestrel: kernel thread panicked: {message}"),
            None => unreachable!(),
        }
    }

    /// Stops the kernel, making [`Kernel::run`] return `code`.
    ///
    /// Must be called from a kernel thread; it does not return.
    pub fn halt(&'static self, code: u32) -> ! {
        self.cpu.halt(Halt::Exit(code));
        panic::resume_unwind(Box::new(Halted))
    }
}
