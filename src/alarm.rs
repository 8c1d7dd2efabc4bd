//! # Alarm Clock
//!
//! Sleeping threads are taken off the CPU until their wake tick instead of
//! polling the tick counter in a yield loop. They wait on the sleep queue,
//! earliest first, and the tick handler releases those that are due.

use crate::arch::{IntrLevel, Port};
use crate::palloc::PageAllocator;
use crate::scheduler::Scheduler;

impl<P: Port, A: PageAllocator> Scheduler<P, A> {
    /// Block the running thread until the tick counter reaches `wake_tick`.
    ///
    /// Interrupts must be off. The idle thread cannot sleep.
    pub fn sleep_until(&mut self, wake_tick: u64) {
        assert!(!self.port.in_interrupt(), "sleep in interrupt context");
        assert_eq!(
            self.port.interrupt_level(),
            IntrLevel::Off,
            "sleep_until with interrupts enabled"
        );
        let cur = self.current();
        assert!(!self.is_idle(cur), "idle thread cannot sleep");

        unsafe { cur.get_mut().wakeup_tick = Some(wake_tick) };
        self.sleepers.insert(cur);
        self.block();
    }

    /// Unblock every sleeper whose wake tick is at or before `now`, in wake
    /// order. Called once per tick from the timer interrupt.
    pub fn wake(&mut self, now: u64) {
        while let Some(t) = self.sleepers.pop_due(now) {
            unsafe { t.get_mut().wakeup_tick = None };
            self.unblock(t);
        }
    }

    /// Earliest pending wake tick.
    pub fn next_wakeup(&self) -> Option<u64> {
        self.sleepers.next_wakeup()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::arch::sim::{booted, interrupt, noop, TestScheduler};
    use crate::arch::Port;
    use crate::config::PRI_DEFAULT;
    use crate::thread::{ThreadRef, ThreadStatus};

    fn spawn(sched: &mut TestScheduler, name: &str) -> ThreadRef {
        let tid = sched.create(name, PRI_DEFAULT, noop, 0).unwrap();
        sched.ready.iter().find(|t| t.tid() == tid).unwrap()
    }

    fn statuses(threads: &[ThreadRef]) -> Vec<ThreadStatus> {
        threads.iter().map(|t| t.status()).collect()
    }

    #[test]
    fn test_sleepers_wake_in_tick_order() {
        use ThreadStatus::{Blocked, Ready};

        let mut sched = booted();
        let main = sched.current();
        let a = spawn(&mut sched, "five");
        let b = spawn(&mut sched, "three");
        let c = spawn(&mut sched, "seven");

        sched.yield_now();
        assert_eq!(sched.current(), a);
        sched.sleep(5);
        assert_eq!(sched.current(), b);
        sched.sleep(3);
        assert_eq!(sched.current(), c);
        sched.sleep(7);
        assert_eq!(sched.current(), main);

        let sleepers = [a, b, c];
        assert_eq!(statuses(&sleepers), vec![Blocked, Blocked, Blocked]);
        assert_eq!(sched.next_wakeup(), Some(3));

        let mut expected = vec![];
        for tick in 1..=8 {
            interrupt(&mut sched);
            match tick {
                3 => expected.push(b),
                5 => expected.push(a),
                7 => expected.push(c),
                _ => {}
            }
            let ready: Vec<ThreadRef> = sched.ready.iter().collect();
            assert_eq!(ready, expected, "tick {}", tick);
        }
        assert_eq!(statuses(&sleepers), vec![Ready, Ready, Ready]);
        assert!(sched.sleepers.is_empty());
        assert_eq!(sched.next_wakeup(), None);
        assert_eq!(sched.current(), main);
    }

    #[test]
    fn test_sleeper_is_never_ready_early() {
        let mut sched = booted();
        let main = sched.current();
        let a = spawn(&mut sched, "napper");
        sched.yield_now();

        for _ in 0..4 {
            interrupt(&mut sched);
        }
        // a goes to sleep at tick 4 for 6 ticks.
        let start = sched.ticks();
        sched.sleep(6);
        assert_eq!(sched.current(), main);

        while sched.ticks() < start + 6 {
            assert_eq!(a.status(), ThreadStatus::Blocked, "tick {}", sched.ticks());
            interrupt(&mut sched);
        }
        assert_eq!(sched.ticks(), 10);
        assert_eq!(a.status(), ThreadStatus::Ready);
    }

    #[test]
    fn test_equal_wake_ticks_keep_sleep_order() {
        let mut sched = booted();
        let main = sched.current();
        let a = spawn(&mut sched, "a");
        let b = spawn(&mut sched, "b");

        sched.yield_now();
        sched.sleep(2);
        sched.sleep(2);
        assert_eq!(sched.current(), main);

        interrupt(&mut sched);
        interrupt(&mut sched);
        let ready: Vec<ThreadRef> = sched.ready.iter().collect();
        assert_eq!(ready, vec![a, b]);
    }

    #[test]
    fn test_only_sleeper_hands_cpu_to_idle() {
        let mut sched = booted();
        let main = sched.current();
        sched.sleep(1);
        assert_eq!(sched.current(), sched.idle.unwrap());
        interrupt(&mut sched);
        assert_eq!(main.status(), ThreadStatus::Ready);
    }

    #[test]
    fn test_wake_releases_late_sleepers() {
        let mut sched = booted();
        let main = sched.current();
        sched.port().disable_interrupts();
        sched.sleep_until(3);
        sched.wake(10);
        assert_eq!(main.status(), ThreadStatus::Ready);
        assert_eq!(main.get().wakeup_tick(), None);
    }

    #[test]
    #[should_panic(expected = "idle thread cannot sleep")]
    fn test_idle_cannot_sleep() {
        let mut sched = booted();
        sched.port().disable_interrupts();
        sched.block();
        sched.sleep_until(5);
    }

    #[test]
    #[should_panic(expected = "sleep_until with interrupts enabled")]
    fn test_sleep_until_with_interrupts_on_is_fatal() {
        let mut sched = booted();
        sched.sleep_until(5);
    }
}
