//! # Thread Queues
//!
//! The ready, sleep and destruction queues all thread through the single
//! intrusive link embedded in each control block. A thread may sit on at
//! most one of them; the control block's `queue` tag names the owner and is
//! checked on every enqueue and dequeue, so a thread that ends up on two
//! queues halts the kernel instead of corrupting a list.

use core::ptr::NonNull;

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListLink, UnsafeRef};

use crate::thread::{Thread, ThreadRef};

intrusive_adapter!(pub ThreadAdapter = UnsafeRef<Thread>: Thread { link: LinkedListLink });

/// Which queue currently owns a thread's link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Detached,
    Ready,
    Sleep,
    Destruction,
}

// ---------------------------------------------------------------------------
// FIFO queue
// ---------------------------------------------------------------------------

/// FIFO of threads. Used for the ready and destruction queues.
pub struct ThreadQueue {
    kind: QueueKind,
    list: LinkedList<ThreadAdapter>,
    len: usize,
}

impl ThreadQueue {
    pub fn new(kind: QueueKind) -> Self {
        Self {
            kind,
            list: LinkedList::new(ThreadAdapter::new()),
            len: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Append `t` at the tail.
    pub fn push_back(&mut self, t: ThreadRef) {
        self.claim(t);
        // SAFETY: thread blocks outlive their queue membership.
        self.list.push_back(unsafe { UnsafeRef::from_raw(t.as_ptr()) });
        self.len += 1;
    }

    /// Remove and return the head.
    pub fn pop_front(&mut self) -> Option<ThreadRef> {
        let t = self.list.pop_front().map(into_ref)?;
        self.release(t);
        Some(t)
    }

    /// Head of the queue, left in place.
    pub fn front(&self) -> Option<ThreadRef> {
        self.list.front().get().map(|t| ThreadRef(NonNull::from(t)))
    }

    /// Threads from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = ThreadRef> + '_ {
        self.list.iter().map(|t| ThreadRef(NonNull::from(t)))
    }

    /// Insert `t` before the first thread for which `goes_after` is false,
    /// i.e. after every thread that should stay ahead of it.
    fn insert_ordered(&mut self, t: ThreadRef, mut goes_after: impl FnMut(&Thread) -> bool) {
        self.claim(t);
        let mut cursor = self.list.front_mut();
        while let Some(queued) = cursor.get() {
            if !goes_after(queued) {
                break;
            }
            cursor.move_next();
        }
        // On the null cursor this appends at the tail.
        cursor.insert_before(unsafe { UnsafeRef::from_raw(t.as_ptr()) });
        self.len += 1;
    }

    fn claim(&self, t: ThreadRef) {
        let owner = t.get().queue.get();
        assert!(
            owner == QueueKind::Detached,
            "thread {} pushed onto {:?} queue while on {:?} queue",
            t.tid(),
            self.kind,
            owner
        );
        t.get().queue.set(self.kind);
    }

    fn release(&mut self, t: ThreadRef) {
        let owner = t.get().queue.get();
        assert!(
            owner == self.kind,
            "thread {} popped from {:?} queue but tagged {:?}",
            t.tid(),
            self.kind,
            owner
        );
        t.get().queue.set(QueueKind::Detached);
        self.len -= 1;
    }
}

fn into_ref(r: UnsafeRef<Thread>) -> ThreadRef {
    let raw = UnsafeRef::into_raw(r);
    // SAFETY: pointers in the list came from live ThreadRefs.
    ThreadRef(unsafe { NonNull::new_unchecked(raw) })
}

// ---------------------------------------------------------------------------
// Sleep queue
// ---------------------------------------------------------------------------

/// Threads waiting for a tick, ordered by ascending wake tick. Threads with
/// the same wake tick keep their insertion order.
pub struct SleepQueue {
    queue: ThreadQueue,
}

impl SleepQueue {
    pub fn new() -> Self {
        Self {
            queue: ThreadQueue::new(QueueKind::Sleep),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Queue `t` by its wake tick.
    ///
    /// # Panics
    /// If `t` has no wake tick set.
    pub fn insert(&mut self, t: ThreadRef) {
        let wake = match t.get().wakeup_tick {
            Some(tick) => tick,
            None => panic!("thread {} queued to sleep without a wake tick", t.tid()),
        };
        self.queue
            .insert_ordered(t, |queued| queued.wakeup_tick.map_or(true, |w| w <= wake));
    }

    /// Earliest wake tick in the queue.
    pub fn next_wakeup(&self) -> Option<u64> {
        self.queue.front().and_then(|t| t.get().wakeup_tick)
    }

    /// Pop the head if it is due at `now`.
    pub fn pop_due(&mut self, now: u64) -> Option<ThreadRef> {
        match self.next_wakeup() {
            Some(wake) if wake <= now => self.queue.pop_front(),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = ThreadRef> + '_ {
        self.queue.iter()
    }
}

impl Default for SleepQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
