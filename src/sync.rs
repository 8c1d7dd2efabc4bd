//! # Synchronization Primitives
//!
//! On a single core the only source of concurrency is interrupt reentrancy,
//! so every piece of shared scheduler state is guarded by masking interrupts.
//! This module is that one system-wide, non-reentrant lock.

use crate::arch::Port;

/// Execute a closure with interrupts disabled, restoring the previous
/// interrupt level afterwards.
///
/// Nesting is fine: an inner section sees interrupts already off and leaves
/// them off on exit.
///
/// # Usage
/// ```ignore
/// let now = sync::critical_section(&port, || scheduler_ticks);
/// ```
#[inline]
pub fn critical_section<P, F, R>(port: &P, f: F) -> R
where
    P: Port + ?Sized,
    F: FnOnce() -> R,
{
    let old = port.disable_interrupts();
    let result = f();
    port.set_interrupt_level(old);
    result
}
