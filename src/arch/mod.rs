//! # Architecture Abstraction Layer
//!
//! Everything the scheduler needs from the CPU goes through the [`Port`]
//! trait: the interrupt mask, the "am I in a handler" predicate, the
//! yield-on-return request, and the context-switch primitive itself.
//! The Cortex-M4 port is the real one; `sim` is a host model used by the
//! unit tests.

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;

#[cfg(test)]
pub mod sim;

/// `CONTROL.nPRIV`: thread mode runs unprivileged.
pub const CONTROL_NPRIV: usize = 1 << 0;

/// `CONTROL.SPSEL`: thread mode uses the process stack pointer.
pub const CONTROL_SPSEL: usize = 1 << 1;

/// `xPSR.T`: Thumb execution state, must always be set.
pub const XPSR_THUMB: usize = 1 << 24;

/// `xPSR` execution-state bits that an interrupt can leave mid-flight: the
/// IT-block condition and the continuation state of an interrupted
/// multi-register load or store (ICI). Only an exception return restores
/// them.
pub const XPSR_ICI_IT: usize = 0x0600_fc00;

/// Whether an exception frame with stacked `xpsr` may be resumed from
/// Thread mode. A frame caught inside an IT block or a multi-register
/// transfer carries state that a plain branch back would lose.
#[inline]
pub const fn resumable_from_thread(xpsr: usize) -> bool {
    xpsr & XPSR_ICI_IT == 0
}

/// Global interrupt mask state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrLevel {
    /// Interrupts are delivered.
    On,
    /// Interrupts are masked.
    Off,
}

/// Saved execution context of a thread.
///
/// Fixed layout: the Cortex-M4 switch routine addresses these fields by
/// offset. `control` plays the role that segment selectors play on x86:
/// it carries privilege level and the active stack.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Context {
    /// General registers `r0`–`r12`.
    pub r: [usize; 13],
    /// Stack pointer.
    pub sp: usize,
    /// Link register.
    pub lr: usize,
    /// Instruction pointer the thread resumes at.
    pub pc: usize,
    /// Program status (condition flags, Thumb bit).
    pub xpsr: usize,
    /// `CONTROL` register (privilege, stack select).
    pub control: usize,
}

/// CPU services required by the scheduler.
///
/// Implementations are zero-sized on real hardware; every method acts on
/// the one CPU.
pub trait Port {
    /// Current interrupt mask state.
    fn interrupt_level(&self) -> IntrLevel;

    /// Mask interrupts, returning the previous level.
    fn disable_interrupts(&self) -> IntrLevel;

    /// Unmask interrupts.
    fn enable_interrupts(&self);

    /// Restore a level previously returned by `disable_interrupts`,
    /// returning the level that was in force.
    fn set_interrupt_level(&self, level: IntrLevel) -> IntrLevel {
        match level {
            IntrLevel::On => {
                let old = self.interrupt_level();
                self.enable_interrupts();
                old
            }
            IntrLevel::Off => self.disable_interrupts(),
        }
    }

    /// True while executing an interrupt handler.
    fn in_interrupt(&self) -> bool;

    /// Ask for the interrupted thread to yield as soon as the current
    /// handler returns.
    fn yield_on_return(&self);

    /// Stack pointer of the thread context (not the handler stack).
    fn stack_pointer(&self) -> usize;

    /// Atomically re-enable interrupts and sleep until the next one.
    fn wait_for_interrupt(&self);

    /// Fabricate the context a new thread is first dispatched with: it
    /// starts at `entry` with `arg0`/`arg1` in the first two argument
    /// registers and its stack pointer at `stack_top`.
    fn init_context(
        &self,
        ctx: &mut Context,
        entry: usize,
        arg0: usize,
        arg1: usize,
        stack_top: usize,
    );

    /// Save the full live register state into `from` and resume `to`.
    ///
    /// Returns only when some later switch resumes `from`.
    ///
    /// # Safety
    /// Interrupts must be disabled. Both pointers must reference live
    /// contexts, and `to` must hold a state produced by `init_context` or by
    /// an earlier `switch_context`.
    unsafe fn switch_context(&self, from: *mut Context, to: *const Context);
}
