//! # Tick Source
//!
//! The global tick counter and everything derived from it: elapsed time,
//! tick-granular sleeps, and the calibrated busy-wait used for delays shorter
//! than a tick.
//!
//! ## Calibration
//!
//! `loops_per_tick` is found by asking "does this many iterations of
//! [`busy_wait`] cross a tick boundary?". The first phase doubles from 1024
//! until the answer is yes; the second fixes the next nine bits below the
//! highest one. Only the probe touches hardware, so the search itself runs
//! against a model in the tests.

use core::sync::atomic::{compiler_fence, Ordering};

use log::info;

use crate::arch::{IntrLevel, Port};
use crate::config::TICK_HZ;
use crate::palloc::PageAllocator;
use crate::scheduler::Scheduler;
use crate::sync;

/// Timer reload divisor for a `hz` interrupt rate from a `base_clock` Hz
/// input, rounded to nearest.
pub const fn timer_divisor(base_clock: u32, hz: u64) -> u32 {
    ((base_clock as u64 + hz / 2) / hz) as u32
}

/// Answers whether `loops` iterations of the busy-wait take longer than one
/// tick.
pub trait LoopProbe {
    fn too_many_loops(&mut self, loops: u32) -> bool;
}

/// Probe backed by the live tick counter. Interrupts must be enabled or it
/// never returns.
pub struct TickProbe<F: Fn() -> u64> {
    ticks: F,
}

impl<F: Fn() -> u64> TickProbe<F> {
    pub fn new(ticks: F) -> Self {
        Self { ticks }
    }
}

impl<F: Fn() -> u64> LoopProbe for TickProbe<F> {
    fn too_many_loops(&mut self, loops: u32) -> bool {
        // Line up with the start of a tick.
        let start = (self.ticks)();
        while (self.ticks)() == start {
            compiler_fence(Ordering::SeqCst);
        }

        let start = (self.ticks)();
        busy_wait(loops as u64);
        compiler_fence(Ordering::SeqCst);
        start != (self.ticks)()
    }
}

/// Largest loop count (to within nine significant bits) that fits in one
/// tick.
///
/// # Panics
/// If the count overflows, i.e. the probe never reports a tick crossing.
pub fn calibrate<L: LoopProbe + ?Sized>(probe: &mut L) -> u32 {
    let mut loops_per_tick: u32 = 1 << 10;
    while !probe.too_many_loops(loops_per_tick << 1) {
        loops_per_tick <<= 1;
        assert!(loops_per_tick != 0, "loops_per_tick overflowed during calibration");
    }

    let high_bit = loops_per_tick;
    let mut test_bit = high_bit >> 1;
    while test_bit != high_bit >> 10 {
        if !probe.too_many_loops(loops_per_tick | test_bit) {
            loops_per_tick |= test_bit;
        }
        test_bit >>= 1;
    }
    loops_per_tick
}

/// Spin for `loops` iterations. Never inlined so that the loop runs the same
/// code wherever it is called from.
#[inline(never)]
pub fn busy_wait(mut loops: u64) {
    while loops > 0 {
        loops -= 1;
        compiler_fence(Ordering::SeqCst);
    }
}

impl<P: Port, A: PageAllocator> Scheduler<P, A> {
    /// Timer interrupts since boot.
    pub fn ticks(&self) -> u64 {
        sync::critical_section(&self.port, || self.ticks)
    }

    /// Ticks since `then`, a value returned by [`ticks`](Self::ticks).
    /// A `then` from the future counts as no time at all.
    pub fn elapsed(&self, then: u64) -> u64 {
        self.ticks().saturating_sub(then)
    }

    #[inline]
    pub fn loops_per_tick(&self) -> u32 {
        self.loops_per_tick
    }

    /// Record the result of [`calibrate`].
    pub fn set_loops_per_tick(&mut self, loops: u32) {
        self.loops_per_tick = loops;
        info!("{} loops/s", loops as u64 * TICK_HZ);
    }

    /// Block the running thread for `n` ticks.
    pub fn sleep(&mut self, n: u64) {
        assert_eq!(
            self.port.interrupt_level(),
            IntrLevel::On,
            "sleep with interrupts disabled"
        );
        if n == 0 {
            return;
        }
        let start = self.ticks();
        let old = self.port.disable_interrupts();
        self.sleep_until(start + n);
        self.port.set_interrupt_level(old);
    }

    pub fn msleep(&mut self, ms: u64) {
        self.real_time_sleep(ms, 1000);
    }

    pub fn usleep(&mut self, us: u64) {
        self.real_time_sleep(us, 1000 * 1000);
    }

    pub fn nsleep(&mut self, ns: u64) {
        self.real_time_sleep(ns, 1000 * 1000 * 1000);
    }

    /// Sleep for `num / denom` seconds: by blocking when that is at least a
    /// tick, otherwise by spinning.
    fn real_time_sleep(&mut self, num: u64, denom: u64) {
        let ticks = num * TICK_HZ / denom;

        assert_eq!(
            self.port.interrupt_level(),
            IntrLevel::On,
            "sleep with interrupts disabled"
        );
        if ticks > 0 {
            self.sleep(ticks);
        } else {
            debug_assert!(denom % 1000 == 0);
            busy_wait(self.loops_per_tick as u64 * num / 1000 * TICK_HZ / (denom / 1000));
        }
    }

    /// Tick handler body: count the tick, charge it to the running thread,
    /// then release any sleepers that are due.
    pub fn timer_interrupt(&mut self) {
        self.ticks += 1;
        self.tick();
        self.wake(self.ticks);
    }

    pub fn print_timer_stats(&self) {
        info!("Timer: {} ticks", self.ticks());
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::{booted, interrupt};
    use crate::config::SYSTEM_CLOCK_HZ;
    use crate::thread::ThreadStatus;
    use proptest::prelude::*;

    /// A loop that runs `per_tick` iterations per tick, every time.
    struct FixedSpeed {
        per_tick: u32,
        probes: u32,
    }

    impl FixedSpeed {
        fn new(per_tick: u32) -> Self {
            Self { per_tick, probes: 0 }
        }
    }

    impl LoopProbe for FixedSpeed {
        fn too_many_loops(&mut self, loops: u32) -> bool {
            self.probes += 1;
            loops > self.per_tick
        }
    }

    #[test]
    fn test_divisor_rounds_to_nearest() {
        assert_eq!(timer_divisor(1_193_180, 100), 11932);
        assert_eq!(timer_divisor(SYSTEM_CLOCK_HZ, 100), 160_000);
        assert_eq!(timer_divisor(1000, 3), 333);
        assert_eq!(timer_divisor(1001, 2), 501);
    }

    #[test]
    fn test_calibration_exact_power_of_two() {
        let mut probe = FixedSpeed::new(1 << 20);
        assert_eq!(calibrate(&mut probe), 1 << 20);
    }

    #[test]
    fn test_calibration_at_lower_bound() {
        let mut probe = FixedSpeed::new(1024);
        assert_eq!(calibrate(&mut probe), 1024);
        assert_eq!(probe.probes, 1 + 9);
    }

    #[test]
    #[should_panic(expected = "overflowed")]
    fn test_calibration_overflow_is_fatal() {
        let mut probe = FixedSpeed::new(u32::MAX);
        calibrate(&mut probe);
    }

    proptest! {
        #[test]
        fn test_calibration_fits_one_tick(per_tick in 1024u32..(1u32 << 31)) {
            let mut probe = FixedSpeed::new(per_tick);
            let loops = calibrate(&mut probe);

            prop_assert!(loops <= per_tick);
            prop_assert!(loops as u64 * 2 > per_tick as u64);
            // Doubling phase is at most 21 probes, refinement exactly 9.
            prop_assert!(probe.probes <= 22 + 9);
        }
    }

    #[test]
    fn test_ticks_are_monotonic() {
        let mut sched = booted();
        let mut last = sched.ticks();
        for _ in 0..50 {
            interrupt(&mut sched);
            let now = sched.ticks();
            assert_eq!(now, last + 1);
            last = now;
        }
        assert_eq!(sched.elapsed(20), 30);
    }

    #[test]
    fn test_elapsed_from_the_future_is_zero() {
        let mut sched = booted();
        interrupt(&mut sched);
        assert_eq!(sched.elapsed(1), 0);
        assert_eq!(sched.elapsed(100), 0);
    }

    #[test]
    fn test_ticks_read_restores_level() {
        let sched = booted();
        sched.ticks();
        assert_eq!(sched.port().interrupt_level(), IntrLevel::On);
        sched.port().disable_interrupts();
        sched.ticks();
        assert_eq!(sched.port().interrupt_level(), IntrLevel::Off);
    }

    #[test]
    fn test_sleep_zero_returns_immediately() {
        let mut sched = booted();
        let main = sched.current();
        sched.sleep(0);
        assert_eq!(sched.current(), main);
        assert!(sched.sleepers.is_empty());
        assert_eq!(sched.port().switch_count(), 0);
    }

    #[test]
    #[should_panic(expected = "sleep with interrupts disabled")]
    fn test_sleep_with_interrupts_off_is_fatal() {
        let mut sched = booted();
        sched.port().disable_interrupts();
        sched.sleep(3);
    }

    #[test]
    fn test_sub_tick_sleep_spins_without_descheduling() {
        let mut sched = booted();
        let main = sched.current();
        sched.loops_per_tick = 1000;

        sched.msleep(1);
        sched.usleep(500);
        sched.nsleep(10_000);

        assert_eq!(sched.current(), main);
        assert_eq!(sched.port().switch_count(), 0);
        assert!(sched.sleepers.is_empty());
        assert_eq!(sched.port().interrupt_level(), IntrLevel::On);
    }

    #[test]
    fn test_msleep_of_a_tick_or_more_blocks() {
        let mut sched = booted();
        let main = sched.current();
        let idle = sched.idle.unwrap();

        // 20 ms at 100 Hz is two ticks.
        sched.msleep(20);
        assert_eq!(sched.current(), idle);
        assert_eq!(main.status(), ThreadStatus::Blocked);
        assert_eq!(main.get().wakeup_tick(), Some(2));

        interrupt(&mut sched);
        assert_eq!(main.status(), ThreadStatus::Blocked);
        interrupt(&mut sched);
        assert_eq!(main.status(), ThreadStatus::Ready);
        assert_eq!(main.get().wakeup_tick(), None);

        sched.port().disable_interrupts();
        sched.block();
        assert_eq!(sched.current(), main);
    }

    #[test]
    fn test_calibrated_count_scales_short_sleeps() {
        let mut sched = booted();
        sched.set_loops_per_tick(calibrate(&mut FixedSpeed::new(5000)));
        let loops = sched.loops_per_tick();
        assert!(loops <= 5000 && loops * 2 > 5000);

        sched.usleep(100);
        assert_eq!(sched.port().switch_count(), 0);
    }
}
