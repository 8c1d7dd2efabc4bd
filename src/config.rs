//! # AlarmOS Configuration
//!
//! Compile-time constants governing the scheduler and the tick source.
//! All limits are fixed at compile time; nothing is sized at runtime.

use static_assertions::const_assert;

/// Timer interrupt frequency in Hz. One interrupt is one tick, the kernel's
/// unit of time accounting.
///
/// The divisor programmed into the timer is derived from this value, so
/// anything outside 19–1000 Hz is rejected at compile time.
pub const TICK_HZ: u64 = 100;

const_assert!(TICK_HZ >= 19);
const_assert!(TICK_HZ <= 1000);

/// Core clock feeding SysTick, in Hz (STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

/// Ticks a thread may run before the tick hook requests preemption.
pub const TIME_SLICE: u32 = 4;

/// Size of the block holding one thread: control block at the low end,
/// downward-growing stack above it. Blocks are aligned to their size so the
/// running thread can be found by rounding the stack pointer down.
pub const THREAD_BLOCK_SIZE: usize = 4096;

const_assert!(THREAD_BLOCK_SIZE.is_power_of_two());

/// Number of blocks in the static thread pool (the bootstrap thread has its
/// own block and does not count against this).
pub const MAX_THREADS: usize = 8;

/// Lowest thread priority.
pub const PRI_MIN: u8 = 0;

/// Priority given to the bootstrap thread.
pub const PRI_DEFAULT: u8 = 31;

/// Highest thread priority.
pub const PRI_MAX: u8 = 63;

/// Bytes reserved for a thread name, including the terminating NUL.
pub const THREAD_NAME_LEN: usize = 16;
