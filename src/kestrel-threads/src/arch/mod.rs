use crate::{Error, Kernel, ThreadFn};

/// What a port has to provide to the portable kernel.
pub(crate) trait Arch {
    /// Per-thread data the port keeps in the TCB.
    type ThreadData;

    const DEFAULT_THREAD_DATA: Self::ThreadData;

    /// Smallest stack a thread may be created with.
    const MIN_STACK_SIZE: usize;

    /// Prepares a new thread so that its first dispatch calls `func(arg)`,
    /// and returning from `func` terminates it.
    ///
    /// Returns the initial stack pointer and thread data.
    fn setup_stack(
        &self,
        kernel: &'static Kernel,
        stack: &mut [u8],
        func: ThreadFn,
        arg: usize,
    ) -> Result<(usize, Self::ThreadData), Error>;

    /// Switches to the thread the scheduler selects, or requests the switch
    /// for the next return from interrupt.
    ///
    /// Must be called outside of any critical section.
    fn schedule(&self, kernel: &'static Kernel);

    /// Whether the caller runs in interrupt context, where nothing may block.
    fn in_isr() -> bool;
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "arm", target_feature = "thumb2"))] {
        mod cortex_m;
        pub(crate) use self::cortex_m::Cpu;
        pub use self::cortex_m::configure_systick;
    }
    else if #[cfg(any(test, feature = "std"))] {
        mod host;
        pub(crate) use self::host::Cpu;
    }
    else {
        pub(crate) struct Cpu;

        impl Cpu {
            pub const fn new() -> Self {
                Self
            }
        }

        impl Arch for Cpu {
            type ThreadData = ();
            const DEFAULT_THREAD_DATA: Self::ThreadData = ();
            const MIN_STACK_SIZE: usize = 0;

            fn setup_stack(
                &self,
                _kernel: &'static Kernel,
                _stack: &mut [u8],
                _func: ThreadFn,
                _arg: usize,
            ) -> Result<(usize, Self::ThreadData), Error> {
                unimplemented!()
            }

            fn schedule(&self, _kernel: &'static Kernel) {
                unimplemented!();
            }

            fn in_isr() -> bool {
                false
            }
        }
    }
}

pub(crate) type ThreadData = <Cpu as Arch>::ThreadData;
