//! # AlarmOS Example Firmware
//!
//! Exercises the scheduler with a handful of threads:
//!
//! | Thread | Behavior |
//! |--------|----------|
//! | `sleep-5`, `sleep-3`, `sleep-7` | Sleep for their tick count, log the wake-up, repeat |
//! | `spinner` | Burns CPU for a while without yielding, then exits |
//! | `main` | Prints timer and thread statistics once a second |
//!
//! ## Expected Output
//!
//! 1. The sleepers wake in tick order 3, 5, 7 within the first round, then
//!    keep their own periods.
//! 2. The spinner is preempted every `TIME_SLICE` ticks, so the sleepers
//!    still wake on time while it runs.
//! 3. Once the spinner exits, its block is reclaimed and the idle tick
//!    count starts climbing.

#![no_std]
#![no_main]

use cortex_m_rt::entry;
use log::{info, warn};
use panic_halt as _;

use alarmos::config::{PRI_DEFAULT, PRI_MIN};
use alarmos::kernel;
use alarmos::timer::busy_wait;

// ---------------------------------------------------------------------------
// Thread bodies
// ---------------------------------------------------------------------------

/// Sleep `period` ticks, forever.
fn sleeper(period: usize) {
    loop {
        kernel::sleep(period as u64);
        info!("{} woke at tick {}", kernel::name(), kernel::ticks());
    }
}

/// Spin through a few time slices, then return (and so exit).
fn spinner(rounds: usize) {
    let start = kernel::ticks();
    for _ in 0..rounds {
        busy_wait(100_000);
    }
    info!("spinner done after {} ticks", kernel::elapsed(start));
}

fn app() -> ! {
    for (name, period) in [("sleep-5", 5), ("sleep-3", 3), ("sleep-7", 7)] {
        if let Err(e) = kernel::create(name, PRI_DEFAULT, sleeper, period) {
            warn!("{}: {}", name, e);
        }
    }
    if let Err(e) = kernel::create("spinner", PRI_MIN, spinner, 200) {
        warn!("spinner: {}", e);
    }

    loop {
        kernel::msleep(1000);
        kernel::print_stats();
    }
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

/// Firmware entry point. Hands the CPU to the kernel; does not return.
#[entry]
fn main() -> ! {
    let cp = cortex_m::Peripherals::take().unwrap();
    kernel::boot(cp, app)
}
