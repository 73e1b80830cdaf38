//! Memory Management Subsystem
//!
//! Provides the kernel's only dynamic memory: a fixed, page-aligned arena
//! managed by a first-fit block allocator, plus the region-size codec that
//! turns a byte size into the power-of-two encoding and alignment the MPU
//! requires.
//!
//! Task stacks and per-task heaps are both carved out of the arena with an
//! alignment chosen by [`region::alignment_for`], so every allocation can be
//! handed to the MPU as a single region.

use core::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::config::{ARENA_ALIGN, HEAP_SIZE};

pub mod allocator;
pub mod region;

pub use allocator::{AllocationStats, BlockAllocator, BlockInfo, BlockState};
pub use region::{alignment_for, region_encoding};

/// Allocator errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// Alignment is not a power of two
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),
    /// No free block satisfies the request
    #[error("out of memory")]
    OutOfMemory,
    /// Arena is too small or misaligned to hold a block
    #[error("arena cannot hold a block")]
    InvalidArena,
    /// Pointer was not returned by this allocator
    #[error("pointer {0:#010x} does not name an allocation")]
    InvalidPointer(usize),
    /// Block is already free
    #[error("block at {0:#010x} freed twice")]
    DoubleFree(usize),
}

/// Result type for allocator operations
pub type AllocResult<T> = Result<T, AllocError>;

#[repr(C, align(4096))]
struct Arena([u8; HEAP_SIZE]);

static_assertions::const_assert_eq!(core::mem::align_of::<Arena>(), ARENA_ALIGN);

static mut ARENA: Arena = Arena([0; HEAP_SIZE]);
static ARENA_TAKEN: AtomicBool = AtomicBool::new(false);

/// Hand out the statically reserved arena.
///
/// Returns `Some` exactly once; later calls return `None`.
pub fn take_arena() -> Option<&'static mut [u8]> {
    if ARENA_TAKEN.swap(true, Ordering::AcqRel) {
        return None;
    }
    // SAFETY: the flag above guarantees this is the only reference ever
    // created to `ARENA`.
    Some(unsafe { &mut (*core::ptr::addr_of_mut!(ARENA)).0 })
}

/// A page-aligned arena of `len` bytes for host tests, leaked for `'static`.
#[cfg(test)]
pub(crate) fn leaked_arena(len: usize) -> &'static mut [u8] {
    #[derive(Clone)]
    #[repr(C, align(4096))]
    struct Page([u8; ARENA_ALIGN]);

    let pages = (len + ARENA_ALIGN - 1) / ARENA_ALIGN;
    let pages: &'static mut [Page] = Box::leak(vec![Page([0; ARENA_ALIGN]); pages].into_boxed_slice());
    // SAFETY: `Page` is plain bytes with no padding; the slice is contiguous.
    unsafe { core::slice::from_raw_parts_mut(pages.as_mut_ptr().cast::<u8>(), len) }
}
