#![no_std]
#![no_main]

use core::sync::atomic::{AtomicBool, Ordering};

use cortex_m_rt::{entry, exception};
use cortex_m_semihosting::{
    debug::{self, EXIT_FAILURE, EXIT_SUCCESS},
    hprintln as println,
};

use panic_semihosting as _;

use kestrel_threads::{configure_systick, Error, Kernel, QueueId, Timeout, TICKS_PER_SEC};

/// lm3s6965 core clock under QEMU
const CORE_CLOCK_HZ: u32 = 12_000_000;

static KERNEL: Kernel = Kernel::new();

static mut STACK: [u8; 2048] = [0; 2048];
static mut STACK2: [u8; 2048] = [0; 2048];
static mut STACK3: [u8; 2048] = [0; 2048];
static mut STORAGE: [u8; 16] = [0; 16];
static mut STORAGE2: [u8; 16] = [0; 16];

/// Written once before threading starts.
static mut QUEUES: [Option<QueueId>; 2] = [None; 2];

static RESULTS_OK: [AtomicBool; 2] = [AtomicBool::new(false), AtomicBool::new(false)];

/// `arg` selects the queue and the timeout: 0 waits forever, 1 up to 5s.
fn receiver(arg: usize) {
    let pid = usize::from(KERNEL.current_pid().unwrap());
    let queue = unsafe { QUEUES[arg] }.unwrap();
    let timeout = match arg {
        0 => Timeout::Never,
        _ => Timeout::Ticks(5 * TICKS_PER_SEC),
    };
    println!("{}: receiving, timeout {:?}", pid, timeout);

    let mut byte = [0u8];
    let result = KERNEL.queue_receive(queue, &mut byte, timeout);
    println!("{}: woke with {:?} at tick {}", pid, result, KERNEL.ticks());
    RESULTS_OK[arg].store(result == Err(Error::Deleted), Ordering::SeqCst);
}

fn main_thread(_: usize) {
    KERNEL.delay(TICKS_PER_SEC).unwrap();

    for queue in unsafe { QUEUES }.into_iter().flatten() {
        println!("main: deleting queue");
        KERNEL.queue_delete(queue).unwrap();
    }

    // both receivers are more urgent and have finished by now
    let failures = RESULTS_OK
        .iter()
        .filter(|ok| !ok.load(Ordering::SeqCst))
        .count();
    println!("main: {} failures", failures);

    debug::exit(if failures == 0 {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    });
}

#[exception]
fn SysTick() {
    KERNEL.tick();
}

#[entry]
fn main() -> ! {
    let mut peripherals = cortex_m::Peripherals::take().unwrap();

    unsafe {
        QUEUES = [
            Some(KERNEL.queue_create(&mut STORAGE, 1, 16).unwrap()),
            Some(KERNEL.queue_create(&mut STORAGE2, 1, 16).unwrap()),
        ];
    }

    println!("main() creating threads");
    KERNEL
        .thread_create(receiver, 0, unsafe { &mut STACK }, 1)
        .unwrap();
    KERNEL
        .thread_create(receiver, 1, unsafe { &mut STACK2 }, 1)
        .unwrap();
    KERNEL
        .thread_create(main_thread, 0, unsafe { &mut STACK3 }, 2)
        .unwrap();

    configure_systick(&mut peripherals.SYST, CORE_CLOCK_HZ).unwrap();

    println!("main() post thread create, starting threading");
    KERNEL.start()
}
