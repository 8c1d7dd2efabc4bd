//! Host simulation port for unit tests.
//!
//! Models the interrupt mask, handler context, the yield-on-return request
//! and a stack pointer. A context switch stores the simulated stack pointer
//! into the outgoing context and loads the incoming one, so the scheduler
//! resolves the running thread exactly as it does on hardware. Test code
//! that calls a blocking operation simply carries on as the newly
//! dispatched thread.

use core::cell::{Cell, RefCell};
use core::mem::MaybeUninit;

use super::{Context, IntrLevel, Port};
use crate::config::{MAX_THREADS, THREAD_BLOCK_SIZE};
use crate::palloc::StaticPool;
use crate::scheduler::Scheduler;
use crate::thread::ThreadBlock;

pub struct SimPort {
    level: Cell<IntrLevel>,
    in_irq: Cell<bool>,
    yield_requested: Cell<bool>,
    sp: Cell<usize>,
    wfi_count: Cell<usize>,
    switches: RefCell<Vec<usize>>,
}

impl SimPort {
    /// A port whose current stack pointer is `sp`, interrupts masked.
    pub fn new(sp: usize) -> Self {
        Self {
            level: Cell::new(IntrLevel::Off),
            in_irq: Cell::new(false),
            yield_requested: Cell::new(false),
            sp: Cell::new(sp),
            wfi_count: Cell::new(0),
            switches: RefCell::new(Vec::new()),
        }
    }

    pub fn set_in_interrupt(&self, on: bool) {
        self.in_irq.set(on);
    }

    /// Consume a pending yield-on-return request.
    pub fn take_yield_request(&self) -> bool {
        self.yield_requested.replace(false)
    }

    /// Number of real switches (from != to) performed so far.
    pub fn switch_count(&self) -> usize {
        self.switches.borrow().len()
    }

    /// Block addresses switched to, in order.
    pub fn switch_targets(&self) -> Vec<usize> {
        self.switches.borrow().clone()
    }

    pub fn wfi_count(&self) -> usize {
        self.wfi_count.get()
    }
}

impl Port for SimPort {
    fn interrupt_level(&self) -> IntrLevel {
        self.level.get()
    }

    fn disable_interrupts(&self) -> IntrLevel {
        self.level.replace(IntrLevel::Off)
    }

    fn enable_interrupts(&self) {
        self.level.set(IntrLevel::On);
    }

    fn in_interrupt(&self) -> bool {
        self.in_irq.get()
    }

    fn yield_on_return(&self) {
        self.yield_requested.set(true);
    }

    fn stack_pointer(&self) -> usize {
        self.sp.get()
    }

    fn wait_for_interrupt(&self) {
        self.wfi_count.set(self.wfi_count.get() + 1);
        self.enable_interrupts();
    }

    fn init_context(
        &self,
        ctx: &mut Context,
        entry: usize,
        arg0: usize,
        arg1: usize,
        stack_top: usize,
    ) {
        *ctx = Context::default();
        ctx.r[0] = arg0;
        ctx.r[1] = arg1;
        ctx.sp = stack_top;
        ctx.pc = entry;
    }

    unsafe fn switch_context(&self, from: *mut Context, to: *const Context) {
        assert_eq!(self.interrupt_level(), IntrLevel::Off, "switch with interrupts on");
        (*from).sp = self.sp.get();
        let next_sp = (*to).sp;
        self.sp.set(next_sp);
        self.switches.borrow_mut().push(next_sp & !(THREAD_BLOCK_SIZE - 1));
    }
}

pub type TestScheduler = Scheduler<SimPort, &'static mut StaticPool<MAX_THREADS>>;

/// Startup-trampoline stand-in; simulated threads never reach it.
pub unsafe extern "C" fn never_entered(_entry: usize, _arg: usize) -> ! {
    unreachable!("simulated threads are never entered")
}

/// Thread body used for every simulated thread.
pub fn noop(_arg: usize) {}

/// A scheduler after `init()` and `start()`: the test itself runs as the
/// bootstrap thread `"main"`, an idle thread exists, interrupts are on.
pub fn booted() -> TestScheduler {
    booted_with_pool(Box::leak(Box::new(StaticPool::new())))
}

pub fn booted_with_pool(pool: &'static mut StaticPool<MAX_THREADS>) -> TestScheduler {
    let boot: &'static mut MaybeUninit<ThreadBlock> = Box::leak(Box::new(MaybeUninit::zeroed()));
    let sp = boot.as_mut_ptr() as usize + THREAD_BLOCK_SIZE - 8;
    let mut sched = Scheduler::new(SimPort::new(sp), pool, never_entered);
    sched.init();
    sched.start(noop).expect("idle thread");
    sched
}

/// Deliver one timer interrupt.
pub fn interrupt(sched: &mut TestScheduler) {
    sched.port().set_in_interrupt(true);
    sched.timer_interrupt();
    sched.port().set_in_interrupt(false);
}

/// Deliver one timer interrupt and honour a yield-on-return request the way
/// the hardware port does once the handler exits.
pub fn interrupt_and_preempt(sched: &mut TestScheduler) {
    interrupt(sched);
    if sched.port().take_yield_request() {
        sched.yield_now();
    }
}
