use core::arch::{asm, naked_asm};
use core::ptr::{addr_of_mut, write_volatile};
use core::sync::atomic::{AtomicPtr, Ordering};

use cortex_m::peripheral::scb::{SystemHandler, VectActive};
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{SCB, SYST};
use critical_section::CriticalSection;

use super::Arch;
use crate::{Error, Kernel, ThreadFn, TICKS_PER_SEC};

/// The kernel being dispatched, for the exception handlers.
static KERNEL: AtomicPtr<Kernel> = AtomicPtr::new(core::ptr::null_mut());

/// Where PendSV stores the callee-save registers when there is no outgoing thread.
static mut SCRATCH_REGS: [usize; 8] = [0; 8];

pub(crate) struct Cpu;

impl Cpu {
    pub const fn new() -> Self {
        Self
    }
}

impl Arch for Cpu {
    /// Callee-save registers.
    type ThreadData = [usize; 8];

    const DEFAULT_THREAD_DATA: Self::ThreadData = [0; 8];

    const MIN_STACK_SIZE: usize = 256;

    /// The exact order in which Cortex-M pushes the registers to the stack when
    /// entering the ISR is:
    ///
    /// +---------+ <- sp
    /// |   r0    |
    /// |   r1    |
    /// |   r2    |
    /// |   r3    |
    /// |   r12   |
    /// |   LR    |
    /// |   PC    |
    /// |   PSR   |
    /// +---------+
    fn setup_stack(
        &self,
        _kernel: &'static Kernel,
        stack: &mut [u8],
        func: ThreadFn,
        arg: usize,
    ) -> Result<(usize, Self::ThreadData), Error> {
        let stack_start = stack.as_ptr() as usize;

        // 1. The stack starts at the highest address and grows downwards.
        // 2. A full stored context also contains R4-R11 and the stack pointer,
        //    thus an additional 36 bytes need to be reserved.
        // 3. Cortex-M expects the SP to be 8 byte aligned, so we chop the lowest
        //    7 bits by doing `& 0xFFFFFFF8`.
        let stack_pos = ((stack_start + stack.len() - 36) & 0xFFFFFFF8) as *mut usize;

        // SAFETY: `stack_pos` is 8 words below the end of `stack`, which is at
        // least `MIN_STACK_SIZE` bytes long.
        unsafe {
            write_volatile(stack_pos.offset(0), arg); // -> R0
            write_volatile(stack_pos.offset(1), 1); // -> R1
            write_volatile(stack_pos.offset(2), 2); // -> R2
            write_volatile(stack_pos.offset(3), 3); // -> R3
            write_volatile(stack_pos.offset(4), 12); // -> R12
            write_volatile(stack_pos.offset(5), cleanup as usize); // -> LR
            write_volatile(stack_pos.offset(6), func as usize); // -> PC
            write_volatile(stack_pos.offset(7), 0x01000000); // -> APSR
        }

        Ok((stack_pos as usize, Self::DEFAULT_THREAD_DATA))
    }

    /// Triggers a PendSV exception.
    #[inline(always)]
    fn schedule(&self, _kernel: &'static Kernel) {
        SCB::set_pendsv();
        cortex_m::asm::isb();
    }

    fn in_isr() -> bool {
        SCB::vect_active() != VectActive::ThreadMode
    }
}

fn kernel() -> &'static Kernel {
    // SAFETY: set in `Kernel::start` before the first thread runs, never reset.
    unsafe { &*KERNEL.load(Ordering::Acquire) }
}

/// Thread cleanup function.
///
/// This gets hooked into a newly created thread stack so it gets called when
/// the thread function returns.
extern "C" fn cleanup() -> ! {
    let kernel = kernel();
    kernel.scheduler.with_mut(|mut s| s.exit_current());
    kernel.cpu.schedule(kernel);

    unreachable!();
}

impl Kernel {
    /// Starts dispatching threads.
    ///
    /// Supposed to be called once by startup code, after creating the first
    /// threads and configuring the tick source (see [`configure_systick`]).
    ///
    /// # Panics
    ///
    /// Panics if no thread exists.
    pub fn start(&'static self) -> ! {
        KERNEL.store(self as *const Kernel as *mut Kernel, Ordering::Release);

        // SAFETY: only the priority of PendSV is changed, nothing else
        // touches the SCB before threading starts.
        unsafe {
            let mut peripherals = cortex_m::Peripherals::steal();
            peripherals.SCB.set_priority(SystemHandler::PendSV, 0xFF);
        }

        let next_sp = self.scheduler.with_mut(|mut s| {
            s.started = true;
            s.switch_to_next().map(|pid| s.thread(pid).sp)
        });
        let Some(next_sp) = next_sp else {
            panic!("no thread to start");
        };

        cortex_m::interrupt::disable();
        // SAFETY: `next_sp` points at the initial frame built by `setup_stack`;
        // the SVC handler returns to it in thread mode on the process stack.
        unsafe {
            asm!(
                "
                msr psp, r1 // set new thread's SP to PSP
                cpsie i     // enable interrupts, otherwise svc hard faults
                svc 0       // SVC 0 handles switching
                ",
            in("r1")next_sp);
        }

        unreachable!();
    }
}

/// Configures SysTick to fire [`TICKS_PER_SEC`] times a second.
///
/// The application's `SysTick` handler is expected to call [`Kernel::tick`].
///
/// # Errors
///
/// Returns [`Error::InvalidParam`] if the reload value does not fit the
/// 24-bit counter.
pub fn configure_systick(syst: &mut SYST, core_clock_hz: u32) -> Result<(), Error> {
    let reload = (core_clock_hz / TICKS_PER_SEC)
        .checked_sub(1)
        .filter(|reload| *reload > 0 && *reload <= 0x00FF_FFFF)
        .ok_or(Error::InvalidParam)?;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
    Ok(())
}

#[unsafe(naked)]
#[no_mangle]
#[allow(non_snake_case)]
unsafe extern "C" fn SVCall() {
    naked_asm!(
        "
            movw LR, #0xFFFd
            movt LR, #0xFFFF
            bx lr
            ",
    );
}

#[unsafe(naked)]
#[no_mangle]
#[allow(non_snake_case)]
unsafe extern "C" fn PendSV() {
    naked_asm!(
        "
            mrs r0, psp
            cpsid i
            bl {sched}
            cpsie i
            cmp r0, #0
            /* label rules:
             * - number only
             * - no combination of *only* [01]
             * - add f or b for 'next matching forward/backward'
             * so let's use '99' forward ('99f')
             */
            beq 99f
            stmia r1, {{r4-r11}}
            ldmia r2, {{r4-r11}}
            msr.n psp, r0
            99:
            movw LR, #0xFFFd
            movt LR, #0xFFFF
            bx LR
            ",
        sched = sym sched,
    );
}

/// Schedule the next thread.
///
/// It selects the next thread that should run from the runqueue, idling
/// with `wfi` while none is ready. This may be current thread, or a new one.
///
/// Input:
/// - old_sp (`r0`): the stack pointer of the currently running thread.
///
/// Returns:
/// - `0` in `r0` if the next thread in the runqueue is the currently running thread
/// - Else it writes into the following registers:
///   - `r1`: pointer to the old thread's register save area
///   - `r2`: pointer to the new thread's register save area
///   - `r0`: stack-pointer for new thread
///
/// This function is called in PendSV.
unsafe extern "C" fn sched(old_sp: usize) -> usize {
    // SAFETY: PendSV disabled interrupts before calling.
    let cs = unsafe { CriticalSection::new() };
    let scheduler = kernel().scheduler.as_ptr(cs);

    loop {
        // SAFETY: interrupts are disabled, nothing else holds the scheduler.
        if unsafe { (*scheduler).runqueue.get_next() }.is_some() {
            break;
        }
        cortex_m::asm::wfi();
        // SAFETY: no scheduler reference is held across the window.
        unsafe { cortex_m::interrupt::enable() };
        cortex_m::asm::isb();
        // pending interrupts would now get to run their ISRs
        cortex_m::interrupt::disable();
    }

    // SAFETY: as above, and no ISR can run until PendSV re-enables interrupts.
    let s = unsafe { &mut *scheduler };
    let prev = s.current_pid();
    let Some(next) = s.switch_to_next() else {
        return 0;
    };
    if prev == Some(next) {
        return 0;
    }

    let prev_regs = match prev {
        Some(prev) => {
            let thread = &mut s.threads[usize::from(prev)];
            thread.sp = old_sp;
            thread.data.as_mut_ptr()
        }
        None => addr_of_mut!(SCRATCH_REGS).cast::<usize>(),
    };
    let next = &mut s.threads[usize::from(next)];
    let next_sp = next.sp;
    let next_regs = next.data.as_mut_ptr();

    // PendSV expects these three pointers in r0, r1 and r2:
    // r1 = old register save area
    // r2 = new register save area
    // r0 = next.sp (implicitly done here via return value)
    //
    // write to registers manually, as ABI would return the values via stack
    // SAFETY: only sets registers PendSV reads right after the call.
    unsafe { asm!("", in("r1") prev_regs, in("r2") next_regs) };

    next_sp
}
