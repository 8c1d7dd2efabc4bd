//! # Scheduler
//!
//! Thread lifecycle and the core scheduling step for AlarmOS: strict FIFO
//! round-robin over a single ready queue, with an idle thread as the
//! fallback when nothing is runnable.
//!
//! ## Scheduling Step
//!
//! Every path that gives up the CPU ends in [`Scheduler::schedule`]:
//! 1. **Select**: pop the head of the ready queue, or the idle thread
//! 2. **Check**: the outgoing thread is no longer Running, the incoming one
//!    has an intact control block
//! 3. **Dispatch**: mark it Running, reset the time slice
//! 4. **Switch**: if it differs from the caller, park a dying caller on the
//!    destruction queue and switch contexts
//!
//! A thread cannot free the stack it is running on, so an exiting thread is
//! reclaimed by whichever thread next passes through `do_schedule`.
//!
//! ## Preemption
//!
//! The tick hook counts ticks against the running thread. Once it has had
//! `TIME_SLICE` ticks the hook asks the port to yield on interrupt return;
//! the port then calls `yield_now` on the interrupted thread's behalf.

use core::ptr;

use log::{debug, info, trace};

use crate::arch::{IntrLevel, Port};
use crate::config::{PRI_DEFAULT, PRI_MAX, PRI_MIN, TIME_SLICE};
use crate::error::SpawnError;
use crate::palloc::PageAllocator;
use crate::queue::{QueueKind, SleepQueue, ThreadQueue};
use crate::sync;
use crate::thread::{ThreadBlock, ThreadFn, ThreadRef, ThreadStatus, Tid};

/// Startup trampoline every new thread is first dispatched into. Receives
/// the thread body and its argument in the first two argument registers.
pub type Trampoline = unsafe extern "C" fn(usize, usize) -> !;

/// Where the ticks went.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    /// Ticks spent in the idle thread.
    pub idle: u64,
    /// Ticks spent in privileged threads.
    pub kernel: u64,
    /// Ticks spent in unprivileged threads.
    pub user: u64,
}

// ---------------------------------------------------------------------------
// Scheduler struct
// ---------------------------------------------------------------------------

/// All scheduling state of the one CPU.
///
/// Stored as a global `static mut` in `kernel.rs` on the target; tests own
/// one per case. Every field is mutated with interrupts masked.
pub struct Scheduler<P: Port, A: PageAllocator> {
    pub(crate) port: P,
    pub(crate) pages: A,
    trampoline: Trampoline,

    /// Threads ready to run, dispatched from the head.
    pub(crate) ready: ThreadQueue,

    /// Threads blocked until a tick, earliest first.
    pub(crate) sleepers: SleepQueue,

    /// Exited threads whose blocks are freed on the next scheduling step.
    pub(crate) destruction: ThreadQueue,

    /// Runs when the ready queue is empty. Never queued.
    pub(crate) idle: Option<ThreadRef>,

    /// The boot context adopted by `init`. Its block is not ours to free.
    pub(crate) initial: Option<ThreadRef>,

    next_tid: spin::Mutex<u32>,

    /// Ticks the running thread has had since it was dispatched.
    pub(crate) slice_ticks: u32,

    pub(crate) stats: TickStats,

    /// Timer interrupts since boot. Written only by the tick handler.
    pub(crate) ticks: u64,

    /// Busy-wait iterations per tick, set by calibration.
    pub(crate) loops_per_tick: u32,
}

impl<P: Port, A: PageAllocator> Scheduler<P, A> {
    /// An empty scheduler. Call [`init`](Self::init) before anything else.
    pub fn new(port: P, pages: A, trampoline: Trampoline) -> Self {
        Self {
            port,
            pages,
            trampoline,
            ready: ThreadQueue::new(QueueKind::Ready),
            sleepers: SleepQueue::new(),
            destruction: ThreadQueue::new(QueueKind::Destruction),
            idle: None,
            initial: None,
            next_tid: spin::Mutex::new(1),
            slice_ticks: 0,
            stats: TickStats::default(),
            ticks: 0,
            loops_per_tick: 0,
        }
    }

    #[inline]
    pub fn port(&self) -> &P {
        &self.port
    }

    #[inline]
    pub fn pages(&self) -> &A {
        &self.pages
    }

    /// Turn the code that is running right now into the thread `"main"`.
    ///
    /// The caller must already be on a stack inside a size-aligned thread
    /// block, with interrupts disabled.
    pub fn init(&mut self) {
        assert_eq!(
            self.port.interrupt_level(),
            IntrLevel::Off,
            "scheduler init with interrupts enabled"
        );
        assert!(self.initial.is_none(), "scheduler initialised twice");

        let block = ThreadBlock::containing(self.port.stack_pointer());
        // SAFETY: the boot stack lives in the upper part of this block; only
        // the control block at its base is written.
        let main = unsafe { ThreadBlock::init_thread(block, "main", PRI_DEFAULT) };
        let tid = self.allocate_tid();
        unsafe {
            let t = main.get_mut();
            t.tid = tid;
            t.status = ThreadStatus::Running;
        }
        self.initial = Some(main);
        debug!("thread {} \"main\" adopted boot context", tid);
    }

    /// Create the idle thread and turn on interrupts, making the system
    /// preemptive.
    pub fn start(&mut self, idle_entry: ThreadFn) -> Result<(), SpawnError> {
        let idle = self.spawn("idle", PRI_MIN, idle_entry, 0)?;
        self.idle = Some(idle);
        self.port.enable_interrupts();
        Ok(())
    }

    /// Create a thread that runs `entry(arg)` and put it on the ready queue.
    ///
    /// Safe to call from interrupt context. The new thread may run before
    /// this returns only if the caller is preempted.
    pub fn create(
        &mut self,
        name: &str,
        priority: u8,
        entry: ThreadFn,
        arg: usize,
    ) -> Result<Tid, SpawnError> {
        let t = self.spawn(name, priority, entry, arg)?;
        self.unblock(t);
        Ok(t.tid())
    }

    /// Allocate and initialise a Blocked thread without queueing it.
    fn spawn(
        &mut self,
        name: &str,
        priority: u8,
        entry: ThreadFn,
        arg: usize,
    ) -> Result<ThreadRef, SpawnError> {
        assert!(
            (PRI_MIN..=PRI_MAX).contains(&priority),
            "priority {} out of range",
            priority
        );
        let block = self.pages.alloc_zeroed().ok_or(SpawnError::OutOfMemory)?;

        // SAFETY: a fresh block is exclusively ours.
        let t = unsafe { ThreadBlock::init_thread(block, name, priority) };
        let tid = self.allocate_tid();
        let sp = ThreadBlock::initial_sp(block);
        unsafe {
            let thread = t.get_mut();
            thread.tid = tid;
            self.port.init_context(
                &mut thread.context,
                self.trampoline as usize,
                entry as usize,
                arg,
                sp,
            );
        }
        debug!("created thread {} \"{}\" priority {}", tid, name, priority);
        Ok(t)
    }

    fn allocate_tid(&self) -> Tid {
        let mut next = self.next_tid.lock();
        let tid = Tid(*next);
        *next += 1;
        tid
    }

    // -----------------------------------------------------------------------
    // Current thread
    // -----------------------------------------------------------------------

    /// The thread whose stack is in use, found by rounding the stack pointer
    /// down to its block. Unchecked.
    #[inline]
    pub fn running_thread(&self) -> ThreadRef {
        ThreadRef(ThreadBlock::containing(self.port.stack_pointer()).cast())
    }

    /// The running thread, after checking its control block.
    ///
    /// # Panics
    /// If the integrity tag is gone (most likely a stack overflow) or the
    /// thread is not marked Running.
    pub fn current(&self) -> ThreadRef {
        let t = self.running_thread();
        assert!(
            t.get().is_valid(),
            "thread control block at {:#x} corrupted, stack overflow?",
            t.as_ptr() as usize
        );
        assert_eq!(
            t.status(),
            ThreadStatus::Running,
            "current thread {} is not running",
            t.tid()
        );
        t
    }

    #[inline]
    pub fn tid(&self) -> Tid {
        self.current().tid()
    }

    /// Name of the running thread.
    pub fn name(&self) -> &str {
        let t = self.current();
        // SAFETY: the running thread cannot exit while `self` is borrowed.
        unsafe { (*t.as_ptr()).name() }
    }

    pub fn priority(&self) -> u8 {
        self.current().get().priority()
    }

    /// Change the running thread's priority. Stored only; selection is FIFO.
    pub fn set_priority(&mut self, priority: u8) {
        assert!(
            (PRI_MIN..=PRI_MAX).contains(&priority),
            "priority {} out of range",
            priority
        );
        let t = self.current();
        sync::critical_section(&self.port, || unsafe { t.get_mut().priority = priority });
    }

    #[inline]
    pub fn is_idle(&self, t: ThreadRef) -> bool {
        self.idle == Some(t)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Put the running thread to sleep until [`unblock`](Self::unblock).
    ///
    /// Interrupts must be off so that the caller can atomically check a
    /// condition and block on it.
    pub fn block(&mut self) {
        assert!(!self.port.in_interrupt(), "block() in interrupt context");
        assert_eq!(
            self.port.interrupt_level(),
            IntrLevel::Off,
            "block() with interrupts enabled"
        );
        let t = self.current();
        unsafe { t.get_mut().status = ThreadStatus::Blocked };
        self.schedule();
    }

    /// Make a blocked thread ready. Does not preempt the caller.
    pub fn unblock(&mut self, t: ThreadRef) {
        assert!(
            t.get().is_valid(),
            "unblock of corrupted thread at {:#x}",
            t.as_ptr() as usize
        );
        let old = self.port.disable_interrupts();
        assert_eq!(t.status(), ThreadStatus::Blocked, "thread {} is not blocked", t.tid());
        self.ready.push_back(t);
        unsafe { t.get_mut().status = ThreadStatus::Ready };
        self.port.set_interrupt_level(old);
    }

    /// Terminate the running thread.
    pub fn exit(&mut self) -> ! {
        self.retire();
        unreachable!("dying thread resumed");
    }

    /// Everything `exit` does up to the switch. With a real port the switch
    /// never comes back.
    pub(crate) fn retire(&mut self) {
        assert!(!self.port.in_interrupt(), "exit() in interrupt context");
        self.port.disable_interrupts();
        debug!("thread {} exiting", self.current().tid());
        self.do_schedule(ThreadStatus::Dying);
    }

    /// Body of a freshly dispatched thread after the trampoline: run
    /// `entry(arg)` with interrupts on, then exit. Returning from a thread
    /// function is the same as calling [`exit`](Self::exit).
    pub fn run_thread(&mut self, entry: ThreadFn, arg: usize) {
        self.port.enable_interrupts();
        entry(arg);
        self.retire();
    }

    /// One round of the idle loop: block until the scheduler has nothing
    /// better to run, then sleep until the next interrupt.
    pub fn idle_pass(&mut self) {
        self.port.disable_interrupts();
        self.block();
        self.port.wait_for_interrupt();
    }

    /// Give up the CPU. The caller stays runnable and goes to the back of
    /// the ready queue.
    pub fn yield_now(&mut self) {
        assert!(!self.port.in_interrupt(), "yield in interrupt context");
        let cur = self.current();
        let old = self.port.disable_interrupts();
        if !self.is_idle(cur) {
            self.ready.push_back(cur);
        }
        self.do_schedule(ThreadStatus::Ready);
        self.port.set_interrupt_level(old);
    }

    // -----------------------------------------------------------------------
    // Scheduling step
    // -----------------------------------------------------------------------

    /// Free the blocks of threads that exited earlier, give the running
    /// thread `status`, and schedule.
    pub fn do_schedule(&mut self, status: ThreadStatus) {
        assert_eq!(
            self.port.interrupt_level(),
            IntrLevel::Off,
            "do_schedule with interrupts enabled"
        );
        let cur = self.current();

        while let Some(victim) = self.destruction.pop_front() {
            assert!(victim != cur, "thread {} reclaiming its own block", cur.tid());
            debug!("reclaiming thread {}", victim.tid());
            // SAFETY: a dying thread is switched away from before it is
            // queued here, so nothing runs on this block any more.
            unsafe { self.pages.free(victim.block()) };
        }

        unsafe { cur.get_mut().status = status };
        self.schedule();
    }

    fn next_thread_to_run(&mut self) -> ThreadRef {
        match self.ready.pop_front().or(self.idle) {
            Some(t) => t,
            None => panic!("nothing to run and no idle thread"),
        }
    }

    /// Dispatch the next thread. The caller has already left Running.
    pub fn schedule(&mut self) {
        let curr = self.running_thread();
        let next = self.next_thread_to_run();

        assert_eq!(
            self.port.interrupt_level(),
            IntrLevel::Off,
            "schedule with interrupts enabled"
        );
        assert_ne!(
            curr.status(),
            ThreadStatus::Running,
            "thread {} still running at schedule",
            curr.tid()
        );
        assert!(
            next.get().is_valid(),
            "next thread at {:#x} corrupted",
            next.as_ptr() as usize
        );

        unsafe { next.get_mut().status = ThreadStatus::Running };
        self.slice_ticks = 0;

        if curr != next {
            if curr.status() == ThreadStatus::Dying && Some(curr) != self.initial {
                self.destruction.push_back(curr);
            }
            trace!("switch {} -> {}", curr.tid(), next.tid());
            // SAFETY: interrupts are off, both threads are live.
            unsafe {
                self.port.switch_context(
                    ptr::addr_of_mut!((*curr.as_ptr()).context),
                    ptr::addr_of!((*next.as_ptr()).context),
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Tick accounting
    // -----------------------------------------------------------------------

    /// Per-tick accounting, from the timer interrupt.
    pub fn tick(&mut self) {
        let t = self.current();
        if self.is_idle(t) {
            self.stats.idle += 1;
        } else if t.get().is_user() {
            self.stats.user += 1;
        } else {
            self.stats.kernel += 1;
        }

        self.slice_ticks += 1;
        if self.slice_ticks >= TIME_SLICE {
            self.port.yield_on_return();
        }
    }

    pub fn stats(&self) -> TickStats {
        sync::critical_section(&self.port, || self.stats)
    }

    pub fn print_thread_stats(&self) {
        let s = self.stats();
        info!(
            "Thread: {} idle ticks, {} kernel ticks, {} user ticks",
            s.idle, s.kernel, s.user
        );
    }

    /// Log timer and thread statistics.
    pub fn print_stats(&self) {
        self.print_timer_stats();
        self.print_thread_stats();
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
