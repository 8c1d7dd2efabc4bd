//! # Kernel
//!
//! The one scheduler instance on the board, the exception entry points that
//! drive it, and the thread API applications call.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset_handler (cortex-m-rt)
//!   └─► main()
//!         └─► kernel::boot(cp, app)       ← interrupts masked
//!               ├─► Configure SysTick, handler priorities
//!               ├─► Build the scheduler
//!               └─► enter_thread_mode()   ← PSP, boot thread block
//!                     └─► boot_thread
//!                           ├─► init()        ← boot context becomes "main"
//!                           ├─► start(idle)   ← interrupts on
//!                           ├─► calibrate()
//!                           └─► app()         ← runs as "main"
//! ```

use core::mem::{self, MaybeUninit};
use core::ptr::{self, NonNull};

use log::LevelFilter;

use crate::arch::cortex_m4::{self, CortexM4};
use crate::arch::{IntrLevel, Port};
use crate::config::MAX_THREADS;
use crate::error::SpawnError;
use crate::logger;
use crate::palloc::StaticPool;
use crate::scheduler::Scheduler;
use crate::sync;
use crate::thread::{ThreadBlock, ThreadFn, ThreadRef, Tid};
use crate::timer::{self, TickProbe};

type KernelScheduler = Scheduler<CortexM4, &'static mut StaticPool<MAX_THREADS>>;

// ---------------------------------------------------------------------------
// Global scheduler instance
// ---------------------------------------------------------------------------

/// Block whose stack `main` runs on. Not part of the pool and never freed.
static mut BOOT_BLOCK: MaybeUninit<ThreadBlock> = MaybeUninit::zeroed();

/// Blocks for every other thread, idle included.
static mut POOL: StaticPool<MAX_THREADS> = StaticPool::new();

static mut SCHEDULER: Option<KernelScheduler> = None;

/// Raw pointer to the global scheduler, for the exception handlers.
///
/// # Safety
/// Set once in `boot()` before interrupts are enabled.
#[no_mangle]
pub static mut SCHEDULER_PTR: *mut KernelScheduler = ptr::null_mut();

fn scheduler() -> &'static mut KernelScheduler {
    // SAFETY: written once during boot; every mutation behind it happens
    // with interrupts masked.
    unsafe {
        match SCHEDULER_PTR.as_mut() {
            Some(s) => s,
            None => panic!("kernel used before boot"),
        }
    }
}

// ---------------------------------------------------------------------------
// Boot
// ---------------------------------------------------------------------------

/// Bring up the kernel and run `app` as the thread `"main"`. Does not
/// return.
pub fn boot(mut cp: cortex_m::Peripherals, app: fn() -> !) -> ! {
    cortex_m::interrupt::disable();
    logger::init(LevelFilter::Trace);

    cortex_m4::configure_systick(&mut cp.SYST);
    cortex_m4::set_interrupt_priorities(&mut cp.SCB);

    // SAFETY: single-threaded, interrupts masked, runs once.
    unsafe {
        let pool = &mut *ptr::addr_of_mut!(POOL);
        let sched =
            (*ptr::addr_of_mut!(SCHEDULER)).insert(Scheduler::new(CortexM4, pool, kernel_thread));
        SCHEDULER_PTR = sched;

        let block = NonNull::new_unchecked(ptr::addr_of_mut!(BOOT_BLOCK) as *mut ThreadBlock);
        cortex_m4::enter_thread_mode(ThreadBlock::initial_sp(block), boot_thread, app as usize)
    }
}

extern "C" fn boot_thread(app: usize) -> ! {
    let sched = scheduler();
    sched.init();
    if let Err(e) = sched.start(idle) {
        panic!("cannot create idle thread: {}", e);
    }
    calibrate();

    // SAFETY: `boot` passes an `fn() -> !`.
    let app: fn() -> ! = unsafe { mem::transmute(app) };
    app()
}

/// Measure `loops_per_tick` against the live timer.
fn calibrate() {
    assert_eq!(
        CortexM4.interrupt_level(),
        IntrLevel::On,
        "calibration needs the timer interrupt"
    );
    let loops = timer::calibrate(&mut TickProbe::new(ticks));
    scheduler().set_loops_per_tick(loops);
}

/// First code every created thread runs.
unsafe extern "C" fn kernel_thread(entry: usize, arg: usize) -> ! {
    let entry: ThreadFn = mem::transmute(entry);
    scheduler().run_thread(entry, arg);
    unreachable!("dying thread resumed")
}

fn idle(_: usize) {
    loop {
        scheduler().idle_pass();
    }
}

// ---------------------------------------------------------------------------
// Exception entry points
// ---------------------------------------------------------------------------

/// SysTick exception handler: one tick.
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    scheduler().timer_interrupt();
}

/// Yield on behalf of a thread that PendSV cut off.
pub(crate) extern "C" fn preempt() {
    scheduler().yield_now();
}

// ---------------------------------------------------------------------------
// Kernel API
// ---------------------------------------------------------------------------

/// Start a thread running `entry(arg)`.
///
/// # Example
/// ```ignore
/// kernel::create("blinky", PRI_DEFAULT, blink, 500)?;
/// ```
pub fn create(name: &str, priority: u8, entry: ThreadFn, arg: usize) -> Result<Tid, SpawnError> {
    sync::critical_section(&CortexM4, || scheduler().create(name, priority, entry, arg))
}

pub fn yield_now() {
    scheduler().yield_now();
}

/// Block the calling thread. Interrupts must already be disabled.
pub fn block() {
    scheduler().block();
}

pub fn unblock(t: ThreadRef) {
    scheduler().unblock(t);
}

pub fn exit() -> ! {
    scheduler().exit()
}

pub fn current() -> ThreadRef {
    scheduler().current()
}

pub fn tid() -> Tid {
    scheduler().tid()
}

pub fn name() -> &'static str {
    scheduler().name()
}

pub fn priority() -> u8 {
    scheduler().priority()
}

pub fn set_priority(priority: u8) {
    scheduler().set_priority(priority);
}

/// Sleep for `n` ticks.
pub fn sleep(n: u64) {
    scheduler().sleep(n);
}

pub fn msleep(ms: u64) {
    scheduler().msleep(ms);
}

pub fn usleep(us: u64) {
    scheduler().usleep(us);
}

pub fn nsleep(ns: u64) {
    scheduler().nsleep(ns);
}

pub fn ticks() -> u64 {
    scheduler().ticks()
}

pub fn elapsed(then: u64) -> u64 {
    scheduler().elapsed(then)
}

pub fn print_stats() {
    scheduler().print_stats();
}
