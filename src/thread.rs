//! # Thread Control Block
//!
//! Defines the unit of scheduling for AlarmOS. Each thread lives in one
//! fixed-size block: the control block at the low end and the thread's
//! stack growing down from the top.
//!
//! ```text
//!  THREAD_BLOCK_SIZE +---------------------------------+
//!                    |          thread stack           |
//!                    |                |                |
//!                    |                V                |
//!                    |         grows downward          |
//!                    |                                 |
//!                    +---------------------------------+
//!                    |              magic              |
//!                    |             context             |
//!                    |           queue link            |
//!                    |     tid · status · name · ...   |
//!                  0 +---------------------------------+
//! ```
//!
//! The magic value sits at the top of the control block, right under the
//! stack, so a stack overflow clobbers it before anything else and the next
//! `current()` check catches it.

use core::cell::Cell;
use core::fmt;
use core::mem::size_of;
use core::ptr::{self, NonNull};

use intrusive_collections::LinkedListLink;
use static_assertions::const_assert_eq;

use crate::arch::{Context, CONTROL_NPRIV};
use crate::config::{PRI_MAX, PRI_MIN, THREAD_BLOCK_SIZE, THREAD_NAME_LEN};
use crate::queue::QueueKind;

/// Integrity tag written into every control block.
pub const THREAD_MAGIC: u32 = 0xcd6a_bf4b;

/// Thread body: runs with interrupts enabled and receives the argument
/// given to `create`. Returning is equivalent to calling `exit`.
pub type ThreadFn = fn(usize);

// ---------------------------------------------------------------------------
// Identity and state
// ---------------------------------------------------------------------------

/// Thread identifier. Allocated from 1 upwards, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(pub(crate) u32);

impl Tid {
    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution state of a thread.
///
/// ```text
///                create / unblock         dispatch
///   ┌─────────┐ ───────────────► ┌───────┐ ─────────► ┌─────────┐
///   │ Blocked │                  │ Ready │            │ Running │
///   └─────────┘ ◄──────┐         └───────┘ ◄───────── └─────────┘
///                      │                 yield / preempt   │  │
///                      └───────────────────────────────────┘  │ exit
///                                  block                      ▼
///                                                        ┌───────┐
///                                                        │ Dying │ ──► freed
///                                                        └───────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Executing on the CPU. Exactly one thread is in this state.
    Running,
    /// Waiting on the ready queue.
    Ready,
    /// Waiting for an `unblock`: sleeping, or held by a synchronization
    /// primitive.
    Blocked,
    /// Exited; its block is freed on the next scheduling step.
    Dying,
}

// ---------------------------------------------------------------------------
// Thread Control Block
// ---------------------------------------------------------------------------

/// Thread Control Block (TCB).
#[repr(C)]
pub struct Thread {
    pub(crate) tid: Tid,
    pub(crate) status: ThreadStatus,
    name: [u8; THREAD_NAME_LEN],
    pub(crate) priority: u8,

    /// Tick at which a sleeping thread becomes ready. `Some` only while the
    /// thread sits on the sleep queue.
    pub(crate) wakeup_tick: Option<u64>,

    /// Shared by the ready, sleep and destruction queues. `queue` records
    /// which one currently owns it.
    pub(crate) link: LinkedListLink,
    pub(crate) queue: Cell<QueueKind>,

    /// Saved registers. Only the context-switch engine reads or writes this.
    pub(crate) context: Context,

    magic: u32,
}

impl Thread {
    /// A blocked, unqueued thread named `name`.
    ///
    /// # Panics
    /// If `priority` is outside `PRI_MIN..=PRI_MAX`.
    fn new(name: &str, priority: u8) -> Self {
        assert!(
            (PRI_MIN..=PRI_MAX).contains(&priority),
            "priority {} out of range",
            priority
        );
        Self {
            tid: Tid(0),
            status: ThreadStatus::Blocked,
            name: encode_name(name),
            priority,
            wakeup_tick: None,
            link: LinkedListLink::new(),
            queue: Cell::new(QueueKind::Detached),
            context: Context::default(),
            magic: THREAD_MAGIC,
        }
    }

    #[inline]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    #[inline]
    pub fn status(&self) -> ThreadStatus {
        self.status
    }

    #[inline]
    pub fn priority(&self) -> u8 {
        self.priority
    }

    #[inline]
    pub fn wakeup_tick(&self) -> Option<u64> {
        self.wakeup_tick
    }

    /// Name as given to `create`, truncated to fit.
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(THREAD_NAME_LEN);
        // encode_name only ever stores whole UTF-8 sequences
        core::str::from_utf8(&self.name[..len]).unwrap_or("?")
    }

    /// True if the integrity tag is intact.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.magic == THREAD_MAGIC
    }

    /// True if the thread runs unprivileged (user code) in thread mode.
    #[inline]
    pub fn is_user(&self) -> bool {
        self.context.control & CONTROL_NPRIV != 0
    }

    #[cfg(test)]
    pub(crate) fn corrupt_magic(&mut self) {
        self.magic = !THREAD_MAGIC;
    }
}

/// Copy `name` into a NUL-terminated buffer, cutting on a char boundary.
fn encode_name(name: &str) -> [u8; THREAD_NAME_LEN] {
    let mut end = name.len().min(THREAD_NAME_LEN - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    let mut buf = [0u8; THREAD_NAME_LEN];
    buf[..end].copy_from_slice(&name.as_bytes()[..end]);
    buf
}

// ---------------------------------------------------------------------------
// Thread block
// ---------------------------------------------------------------------------

/// Bytes of stack left in a block after the control block.
pub const STACK_SIZE: usize = THREAD_BLOCK_SIZE - size_of::<Thread>();

/// One thread: control block plus stack, aligned to its own size.
#[repr(C, align(4096))]
pub struct ThreadBlock {
    thread: Thread,
    stack: [u8; STACK_SIZE],
}

const_assert_eq!(size_of::<ThreadBlock>(), THREAD_BLOCK_SIZE);
const_assert_eq!(core::mem::align_of::<ThreadBlock>(), THREAD_BLOCK_SIZE);

impl ThreadBlock {
    /// Block containing the stack address `sp`.
    #[inline]
    pub fn containing(sp: usize) -> NonNull<ThreadBlock> {
        let base = sp & !(THREAD_BLOCK_SIZE - 1);
        match NonNull::new(base as *mut ThreadBlock) {
            Some(block) => block,
            None => panic!("stack pointer {:#x} outside any thread block", sp),
        }
    }

    /// Initial stack pointer for a thread in `block`: just under the top,
    /// 8-byte aligned, still inside the block.
    #[inline]
    pub fn initial_sp(block: NonNull<ThreadBlock>) -> usize {
        (block.as_ptr() as usize + THREAD_BLOCK_SIZE - 8) & !7
    }

    /// Write a fresh control block at the low end of `block`.
    ///
    /// # Safety
    /// `block` must be valid for writes and must not hold a thread that is
    /// queued anywhere. The stack part is left untouched, so this may be
    /// used on the block the caller is currently running on.
    pub unsafe fn init_thread(block: NonNull<ThreadBlock>, name: &str, priority: u8) -> ThreadRef {
        let thread = ptr::addr_of_mut!((*block.as_ptr()).thread);
        ptr::write(thread, Thread::new(name, priority));
        ThreadRef(NonNull::new_unchecked(thread))
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle to a thread control block.
///
/// Handles stay valid until the thread's block is reclaimed, which happens
/// only after the thread has exited and been switched away from. Fields are
/// only mutated with interrupts masked.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ThreadRef(pub(crate) NonNull<Thread>);

impl ThreadRef {
    /// Shared view of the control block.
    #[inline]
    pub fn get(&self) -> &Thread {
        // SAFETY: see the type-level invariant.
        unsafe { self.0.as_ref() }
    }

    /// Mutable view of the control block.
    ///
    /// # Safety
    /// Interrupts must be masked and no other reference to this thread may
    /// be live.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn get_mut(&self) -> &mut Thread {
        &mut *self.0.as_ptr()
    }

    #[inline]
    pub fn tid(&self) -> Tid {
        self.get().tid
    }

    #[inline]
    pub fn status(&self) -> ThreadStatus {
        self.get().status
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut Thread {
        self.0.as_ptr()
    }

    /// The block this thread lives in.
    #[inline]
    pub fn block(&self) -> NonNull<ThreadBlock> {
        self.0.cast()
    }
}

impl fmt::Debug for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.get();
        write!(f, "Thread({} \"{}\" {:?})", t.tid, t.name(), t.status)
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::MaybeUninit;

    fn block() -> NonNull<ThreadBlock> {
        let b: &'static mut MaybeUninit<ThreadBlock> = Box::leak(Box::new(MaybeUninit::zeroed()));
        NonNull::new(b.as_mut_ptr()).unwrap()
    }

    #[test]
    fn test_thread_initialization() {
        let b = block();
        let t = unsafe { ThreadBlock::init_thread(b, "worker", 7) };
        assert!(t.get().is_valid());
        assert_eq!(t.status(), ThreadStatus::Blocked);
        assert_eq!(t.get().name(), "worker");
        assert_eq!(t.get().priority(), 7);
        assert_eq!(t.get().wakeup_tick(), None);
        assert_eq!(t.get().queue.get(), QueueKind::Detached);
        assert!(!t.get().link.is_linked());
        assert_eq!(t.block(), b);
    }

    #[test]
    fn test_name_truncated_on_char_boundary() {
        let b = block();
        let t = unsafe { ThreadBlock::init_thread(b, "a-very-long-thread-name", PRI_MIN) };
        assert_eq!(t.get().name(), "a-very-long-thr");

        // 'é' is two bytes; byte 15 falls inside the eighth one
        let t = unsafe { ThreadBlock::init_thread(b, "éééééééé", PRI_MIN) };
        assert_eq!(t.get().name(), "ééééééé");
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_priority_range_checked() {
        let b = block();
        unsafe { ThreadBlock::init_thread(b, "bad", PRI_MAX + 1) };
    }

    #[test]
    fn test_block_lookup_from_stack_pointer() {
        let b = block();
        let sp = ThreadBlock::initial_sp(b);
        assert_eq!(sp % 8, 0);
        assert!(sp > b.as_ptr() as usize + size_of::<Thread>());
        assert_eq!(ThreadBlock::containing(sp), b);
        assert_eq!(ThreadBlock::containing(b.as_ptr() as usize + 100), b);
    }

    #[test]
    fn test_magic_detects_corruption() {
        let b = block();
        let t = unsafe { ThreadBlock::init_thread(b, "victim", PRI_MIN) };
        unsafe { t.get_mut().corrupt_magic() };
        assert!(!t.get().is_valid());
    }

    #[test]
    fn test_user_mode_from_control() {
        let b = block();
        let t = unsafe { ThreadBlock::init_thread(b, "u", PRI_MIN) };
        assert!(!t.get().is_user());
        unsafe { t.get_mut().context.control |= CONTROL_NPRIV };
        assert!(t.get().is_user());
    }
}
