//! # AlarmOS
//!
//! The thread-scheduling core of a small teaching kernel for ARM Cortex-M4
//! microcontrollers: a single-CPU preemptive round-robin scheduler, the
//! thread lifecycle, a SysTick-driven tick source and an alarm clock that
//! lets threads sleep off the CPU instead of polling.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                  Application Threads                   │
//! ├────────────────────────────────────────────────────────┤
//! │                 Kernel API (kernel.rs)                 │
//! │   boot · create · yield_now · block · exit · sleep     │
//! ├──────────────┬───────────────────┬─────────────────────┤
//! │  Scheduler   │  Tick Source      │  Alarm Clock        │
//! │  scheduler.rs│  timer.rs         │  alarm.rs           │
//! │  ─ schedule()│  ─ ticks()        │  ─ sleep_until()    │
//! │  ─ block()   │  ─ calibrate()    │  ─ wake()           │
//! │  ─ yield()   │  ─ msleep()       │                     │
//! ├──────────────┴───────────────────┴─────────────────────┤
//! │  Threads (thread.rs)  ·  Queues (queue.rs)             │
//! │  TCB · ThreadBlock    ·  ready · sleep · destruction   │
//! ├────────────────────────────────────────────────────────┤
//! │  Blocks (palloc.rs)   ·  Critical sections (sync.rs)   │
//! ├────────────────────────────────────────────────────────┤
//! │           Arch Port (arch/mod.rs, cortex_m4.rs)        │
//! │    PRIMASK · SysTick · PendSV · context switch         │
//! ├────────────────────────────────────────────────────────┤
//! │          ARM Cortex-M4 Hardware (Thumb-2)              │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Thread Model
//!
//! - **One block per thread**: control block at the base of a 4 KiB,
//!   4 KiB-aligned block, stack above it. The running thread is found by
//!   rounding the stack pointer down.
//! - **One link per thread**: a thread is on the ready, sleep or
//!   destruction queue, or on none of them.
//! - **Strict FIFO**: priorities are recorded, never used for selection.
//! - **Deferred reclamation**: an exiting thread's block is freed by the
//!   next thread to pass through the scheduler.
//!
//! ## Memory Model
//!
//! - **No heap**: threads come from a fixed [`palloc::StaticPool`]
//! - **No `alloc`**: pure `core`
//! - **Critical sections**: PRIMASK, through [`arch::Port`]
//!
//! Everything above the port is plain Rust and is unit-tested on the host
//! against a simulated port.

#![cfg_attr(not(test), no_std)]

pub mod alarm;
pub mod arch;
pub mod config;
pub mod error;
pub mod palloc;
pub mod queue;
pub mod scheduler;
pub mod sync;
pub mod thread;
pub mod timer;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod kernel;
#[cfg(all(target_arch = "arm", target_os = "none"))]
mod logger;

pub use error::SpawnError;
pub use thread::{ThreadFn, ThreadRef, ThreadStatus, Tid};
