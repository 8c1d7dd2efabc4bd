//! # Thread Block Allocator
//!
//! Thread blocks come from a page allocator. The scheduler only needs two
//! operations from it: hand out one zeroed, size-aligned block, and take one
//! back. [`StaticPool`] is the allocator used on the board: a fixed array
//! of blocks in `.bss` with a busy flag per slot.

use core::mem::MaybeUninit;
use core::ptr::{self, NonNull};

use crate::config::THREAD_BLOCK_SIZE;
use crate::thread::ThreadBlock;

/// Source of thread blocks.
pub trait PageAllocator {
    /// One zeroed block, or `None` when exhausted.
    fn alloc_zeroed(&mut self) -> Option<NonNull<ThreadBlock>>;

    /// Return a block obtained from `alloc_zeroed`.
    ///
    /// # Safety
    /// `block` must come from this allocator and nothing may use it after
    /// the call.
    unsafe fn free(&mut self, block: NonNull<ThreadBlock>);
}

impl<T: PageAllocator + ?Sized> PageAllocator for &mut T {
    fn alloc_zeroed(&mut self) -> Option<NonNull<ThreadBlock>> {
        (**self).alloc_zeroed()
    }

    unsafe fn free(&mut self, block: NonNull<ThreadBlock>) {
        (**self).free(block)
    }
}

/// Fixed pool of `N` thread blocks.
pub struct StaticPool<const N: usize> {
    blocks: [MaybeUninit<ThreadBlock>; N],
    in_use: [bool; N],
    allocs: usize,
    frees: usize,
}

impl<const N: usize> StaticPool<N> {
    pub const fn new() -> Self {
        Self {
            blocks: [const { MaybeUninit::zeroed() }; N],
            in_use: [false; N],
            allocs: 0,
            frees: 0,
        }
    }

    /// Blocks currently handed out.
    pub fn in_use(&self) -> usize {
        self.in_use.iter().filter(|&&b| b).count()
    }

    /// Total `(allocations, frees)` since creation.
    pub fn counters(&self) -> (usize, usize) {
        (self.allocs, self.frees)
    }

    fn slot_of(&self, block: NonNull<ThreadBlock>) -> usize {
        let base = self.blocks.as_ptr() as usize;
        let addr = block.as_ptr() as usize;
        let offset = addr.wrapping_sub(base);
        assert!(
            offset < N * THREAD_BLOCK_SIZE && offset % THREAD_BLOCK_SIZE == 0,
            "block {:#x} not from this pool",
            addr
        );
        offset / THREAD_BLOCK_SIZE
    }
}

impl<const N: usize> Default for StaticPool<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> PageAllocator for StaticPool<N> {
    fn alloc_zeroed(&mut self) -> Option<NonNull<ThreadBlock>> {
        let slot = self.in_use.iter().position(|&b| !b)?;
        self.in_use[slot] = true;
        self.allocs += 1;

        let block = self.blocks[slot].as_mut_ptr();
        // Freed blocks keep their old contents; callers expect zeroes. Zero
        // in place: a block-sized temporary would not fit on a thread stack.
        // SAFETY: the slot is in bounds and now exclusively ours.
        unsafe { ptr::write_bytes(block, 0, 1) };
        NonNull::new(block)
    }

    unsafe fn free(&mut self, block: NonNull<ThreadBlock>) {
        let slot = self.slot_of(block);
        assert!(
            self.in_use[slot],
            "double free of thread block {:#x}",
            block.as_ptr() as usize
        );
        self.in_use[slot] = false;
        self.frees += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool<const N: usize>() -> &'static mut StaticPool<N> {
        Box::leak(Box::new(StaticPool::new()))
    }

    #[test]
    fn test_hands_out_distinct_aligned_blocks() {
        let p = pool::<3>();
        let a = p.alloc_zeroed().unwrap();
        let b = p.alloc_zeroed().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_ptr() as usize % THREAD_BLOCK_SIZE, 0);
        assert_eq!(b.as_ptr() as usize % THREAD_BLOCK_SIZE, 0);
        assert_eq!(p.in_use(), 2);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let p = pool::<2>();
        assert!(p.alloc_zeroed().is_some());
        assert!(p.alloc_zeroed().is_some());
        assert!(p.alloc_zeroed().is_none());
    }

    #[test]
    fn test_freed_block_is_reused_and_zeroed() {
        let p = pool::<1>();
        let a = p.alloc_zeroed().unwrap();
        unsafe { (a.as_ptr() as *mut u8).add(100).write(0xaa) };
        unsafe { p.free(a) };
        let b = p.alloc_zeroed().unwrap();
        assert_eq!(a, b);
        assert_eq!(unsafe { (b.as_ptr() as *const u8).add(100).read() }, 0);
        assert_eq!(p.counters(), (2, 1));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_is_fatal() {
        let p = pool::<1>();
        let a = p.alloc_zeroed().unwrap();
        unsafe {
            p.free(a);
            p.free(a);
        }
    }

    #[test]
    #[should_panic(expected = "not from this pool")]
    fn test_foreign_block_is_rejected() {
        let p = pool::<1>();
        let q = pool::<1>();
        let foreign = q.alloc_zeroed().unwrap();
        unsafe { p.free(foreign) };
    }

    #[test]
    fn test_reuse_zeroes_the_whole_block() {
        let p = pool::<1>();
        let a = p.alloc_zeroed().unwrap();
        unsafe { ptr::write_bytes(a.as_ptr() as *mut u8, 0x5a, THREAD_BLOCK_SIZE) };
        unsafe { p.free(a) };
        let b = p.alloc_zeroed().unwrap();
        let bytes =
            unsafe { core::slice::from_raw_parts(b.as_ptr() as *const u8, THREAD_BLOCK_SIZE) };
        assert!(bytes.iter().all(|&x| x == 0));
    }
}
