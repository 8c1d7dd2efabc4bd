//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor:
//! the PRIMASK interrupt mask, SysTick as the tick source, the thread-mode
//! context switch, and PendSV-driven preemption.
//!
//! ## Context Switch Mechanism
//!
//! Threads run in Thread mode on the process stack (PSP). A switch is an
//! ordinary function call, [`switch_to`], made with interrupts masked: it
//! stores every register into the outgoing [`Context`] and loads the
//! incoming one, ending with a jump to its saved `pc`.
//!
//! ## Preemption
//!
//! Handlers never switch threads themselves. When the time slice runs out
//! the SysTick handler pends PendSV, which runs once every other handler has
//! finished. PendSV plants a second exception frame under the interrupted
//! one, so that the exception return lands in [`preempt_resume`] in Thread
//! mode:
//!
//! ```text
//!   before PendSV returns            after return, in preempt_resume
//!
//!   |  interrupted frame  | <- base   |  interrupted frame  | <- sp
//!   |---------------------|           |---------------------|
//!   |  planted frame      |           |  (popped)           |
//!   |  pc = preempt_resume| <- PSP
//! ```
//!
//! `preempt_resume` yields on the thread's behalf and then restores the
//! interrupted frame by hand, resuming exactly where the thread was cut off.
//!
//! A thread caught inside an IT block or a multi-register load/store is not
//! redirected: that state lives in `xPSR` bits only an exception return can
//! restore. PendSV leaves the frame alone and the next tick, still past the
//! slice, asks again.
//!
//! ## Interrupt Priorities
//!
//! - SysTick: 0x80, above PendSV so the tick is never delayed by a switch
//! - PendSV: 0xFF (lowest), runs only when no other handler is active

use core::arch::{asm, naked_asm};
use core::ptr;

use cortex_m::peripheral::scb::{SystemHandler, VectActive};
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{SCB, SYST};
use cortex_m::register;

use super::{resumable_from_thread, Context, IntrLevel, Port, CONTROL_SPSEL, XPSR_THUMB};
use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::timer::timer_divisor;

/// `xPSR` bit 9 in a stacked frame: the hardware inserted one padding word
/// above the frame to align it.
const XPSR_STACK_ALIGN: usize = 1 << 9;

/// Words in a basic (non-FPU) exception frame.
const FRAME_WORDS: usize = 8;

/// The processor. Zero-sized: all state lives in core registers.
#[derive(Debug, Clone, Copy, Default)]
pub struct CortexM4;

impl Port for CortexM4 {
    #[inline]
    fn interrupt_level(&self) -> IntrLevel {
        if register::primask::read().is_active() {
            IntrLevel::On
        } else {
            IntrLevel::Off
        }
    }

    #[inline]
    fn disable_interrupts(&self) -> IntrLevel {
        let old = self.interrupt_level();
        cortex_m::interrupt::disable();
        old
    }

    #[inline]
    fn enable_interrupts(&self) {
        // SAFETY: all scheduler state is only touched with PRIMASK set.
        unsafe { cortex_m::interrupt::enable() }
    }

    #[inline]
    fn in_interrupt(&self) -> bool {
        SCB::vect_active() != VectActive::ThreadMode
    }

    #[inline]
    fn yield_on_return(&self) {
        SCB::set_pendsv();
    }

    #[inline]
    fn stack_pointer(&self) -> usize {
        register::psp::read() as usize
    }

    fn wait_for_interrupt(&self) {
        // With PRIMASK set a pending interrupt still ends WFI; it is taken as
        // soon as the mask is lifted.
        cortex_m::asm::wfi();
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
        ctx.sp = stack_top & !7;
        ctx.lr = 0;
        ctx.pc = entry | 1;
        ctx.xpsr = XPSR_THUMB;
        ctx.control = CONTROL_SPSEL;
    }

    unsafe fn switch_context(&self, from: *mut Context, to: *const Context) {
        switch_to(from, to);
    }
}

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Program SysTick to interrupt at `TICK_HZ` from the core clock.
pub fn configure_systick(syst: &mut SYST) {
    let reload = timer_divisor(SYSTEM_CLOCK_HZ, TICK_HZ) - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// PendSV at the lowest priority, SysTick above it.
pub fn set_interrupt_priorities(scb: &mut SCB) {
    // SAFETY: neither handler relies on priority-based exclusion with any
    // other interrupt.
    unsafe {
        scb.set_priority(SystemHandler::PendSV, 0xff);
        scb.set_priority(SystemHandler::SysTick, 0x80);
    }
}

// ---------------------------------------------------------------------------
// Boot
// ---------------------------------------------------------------------------

/// Move from the reset context (MSP, privileged) onto the process stack at
/// `sp` and jump to `entry(arg)`. Handlers keep using MSP from here on.
///
/// # Safety
/// Interrupts must be masked and `sp` must be the top of a thread block.
pub unsafe fn enter_thread_mode(sp: usize, entry: extern "C" fn(usize) -> !, arg: usize) -> ! {
    asm!(
        "msr psp, r0",
        "msr control, r3",
        "isb",
        "mov r0, r2",
        "bx r1",
        in("r0") sp,
        in("r1") entry as usize,
        in("r2") arg,
        in("r3") CONTROL_SPSEL,
        options(noreturn)
    );
}

// ---------------------------------------------------------------------------
// Synchronous switch
// ---------------------------------------------------------------------------

/// Save the caller's registers into `*from`, restore `*to`.
///
/// `Context` offsets: `r0..r12` at 0, `sp` 52, `lr` 56, `pc` 60, `xpsr` 64,
/// `control` 68. The saved `pc` is local label `2`, so a resumed thread
/// simply returns to the caller of `switch_to`.
#[unsafe(naked)]
unsafe extern "C" fn switch_to(from: *mut Context, to: *const Context) {
    naked_asm!(
        // --- Save outgoing context ---
        "stmia r0, {{r0-r12}}",
        "str sp, [r0, #52]",
        "str lr, [r0, #56]",
        "adr r2, 2f",
        "orr r2, r2, #1",
        "str r2, [r0, #60]",
        "mrs r2, apsr",
        "str r2, [r0, #64]",
        "mrs r2, control",
        "str r2, [r0, #68]",
        // --- Load incoming context ---
        "ldr r2, [r1, #68]",
        "msr control, r2",
        "isb",
        "ldr sp, [r1, #52]",
        "ldr lr, [r1, #56]",
        "ldr r2, [r1, #60]",
        "push {{r2}}",
        "ldr r2, [r1, #64]",
        "msr apsr_nzcvqg, r2",
        "ldmia r1, {{r0-r12}}",
        "pop {{pc}}",
        "2:",
        "bx lr",
    )
}

// ---------------------------------------------------------------------------
// PendSV handler (preemption)
// ---------------------------------------------------------------------------

/// PendSV exception handler: redirect the interrupted thread into
/// [`preempt_resume`].
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "push {{r4, lr}}",
        "bl {inject}",
        "msr psp, r0",
        "pop {{r4, pc}}",
        inject = sym inject_preemption,
    )
}

/// Plant a frame under the interrupted one and return the new PSP, or
/// return `psp` unchanged when the thread cannot be resumed from Thread
/// mode yet.
///
/// The interrupted frame is first slid over its alignment padding, if any,
/// so that it ends exactly at the thread's stack pointer and can later be
/// unwound with plain pops.
unsafe extern "C" fn inject_preemption(psp: usize) -> usize {
    let frame = psp as *mut usize;
    let stacked_xpsr = *frame.add(7);
    if !resumable_from_thread(stacked_xpsr) {
        return psp;
    }

    let mut base = psp;
    if stacked_xpsr & XPSR_STACK_ALIGN != 0 {
        ptr::copy(frame, frame.add(1), FRAME_WORDS);
        base += 4;
    }

    // Exception frames are 8-byte aligned; bit 9 tells the return to drop
    // the extra word again.
    let (planted, xpsr) = if base % 8 == 0 {
        (base - FRAME_WORDS * 4, XPSR_THUMB)
    } else {
        (base - FRAME_WORDS * 4 - 4, XPSR_THUMB | XPSR_STACK_ALIGN)
    };
    let f = planted as *mut usize;
    for i in 0..6 {
        *f.add(i) = 0;
    }
    *f.add(6) = preempt_resume as usize & !1;
    *f.add(7) = xpsr;
    planted
}

/// Thread-mode landing pad for a planted frame. `sp` points at the
/// interrupted frame: `r0 r1 r2 r3 r12 lr pc xpsr`.
#[unsafe(naked)]
unsafe extern "C" fn preempt_resume() {
    naked_asm!(
        "mov r0, sp",
        "bic r1, r0, #7",
        "mov sp, r1",
        "push {{r0, r1}}",
        "bl {preempt}",
        "pop {{r0, r1}}",
        "mov sp, r0",
        // Put pc|1 in the xpsr slot so the last pop lands on it.
        "ldr r0, [sp, #28]",
        "ldr r1, [sp, #24]",
        "orr r1, r1, #1",
        "str r1, [sp, #28]",
        "msr apsr_nzcvqg, r0",
        "pop {{r0-r3, r12, lr}}",
        "add sp, sp, #4",
        "pop {{pc}}",
        preempt = sym crate::kernel::preempt,
    )
}
