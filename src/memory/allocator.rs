//! Block Allocator
//!
//! A first-fit allocator over a single fixed arena. The arena is carved
//! into a doubly-linked list of blocks ordered by address; each block starts
//! with a [`BlockHeader`] and the list always covers the whole arena with no
//! gaps.
//!
//! ```text
//! ┌────────┬──────────┬────────┬─────────┬────────┬──────────────────┐
//! │ header │ padding  │ header │ payload │ header │ free remainder   │
//! └────────┴──────────┴────────┴─────────┴────────┴──────────────────┘
//!   Padding block        Used block          Free block
//! ```
//!
//! # Alignment
//!
//! An aligned request whose natural data start is not aligned needs a gap
//! in front of the payload. The gap becomes its own *padding* block, which
//! is never handed out, never freed and never merged. A gap too small to
//! hold a header plus the minimum payload cannot be represented, so that
//! candidate is skipped and the scan moves on: first fit with an
//! alignment-feasibility filter, not best fit.
//!
//! # Coalescing
//!
//! `free` merges the released block with both neighbours when they are
//! free, so no two adjacent blocks are ever free at the same time.
//!
//! # Concurrency
//!
//! The allocator itself holds no lock. It lives inside the kernel context,
//! which is only reachable from inside a critical section.

use core::marker::PhantomData;
use core::mem;
use core::ptr::NonNull;

use static_assertions::const_assert;

use super::{AllocError, AllocResult};

/// Smallest alignment handed out. Requests for 1, 2 or 4 are raised to this.
pub const MIN_ALIGN: usize = 8;

/// Smallest payload a split-off block may have.
const MIN_PAYLOAD: usize = 8;

/// State of a block in the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockState {
    /// Available for allocation.
    Free,
    /// Handed out to a caller.
    Used,
    /// Alignment gap in front of a used block. Permanently unavailable.
    Padding,
}

/// Header embedded at the start of every block.
#[repr(C, align(8))]
struct BlockHeader {
    /// Payload bytes following the header.
    size: usize,
    prev: Option<NonNull<BlockHeader>>,
    next: Option<NonNull<BlockHeader>>,
    state: BlockState,
}

/// Size of the per-block header in bytes.
pub const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

const_assert!(HEADER_SIZE % MIN_ALIGN == 0);

/// Snapshot of one block, as yielded by [`BlockAllocator::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Address of the block header.
    pub header: usize,
    /// Address of the payload.
    pub data: usize,
    /// Payload size in bytes.
    pub size: usize,
    /// Block state.
    pub state: BlockState,
}

/// Allocation statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocationStats {
    /// Successful allocations
    pub total_allocations: u32,
    /// Successful frees
    pub total_frees: u32,
    /// Requests that found no suitable block
    pub failed_allocations: u32,
    /// Payload bytes currently handed out
    pub bytes_in_use: usize,
    /// High-water mark of `bytes_in_use`
    pub peak_bytes_in_use: usize,
}

/// First-fit block allocator over a fixed arena.
pub struct BlockAllocator {
    base: *mut u8,
    len: usize,
    head: Option<NonNull<BlockHeader>>,
    stats: AllocationStats,
}

// SAFETY: the allocator owns its arena exclusively (it was handed a
// `&'static mut [u8]`) and only touches it through `&mut self`.
unsafe impl Send for BlockAllocator {}

impl Default for BlockAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockAllocator {
    /// Create an allocator with no arena. Every request fails until
    /// [`init`](Self::init) is called.
    pub const fn new() -> Self {
        Self {
            base: core::ptr::null_mut(),
            len: 0,
            head: None,
            stats: AllocationStats {
                total_allocations: 0,
                total_frees: 0,
                failed_allocations: 0,
                bytes_in_use: 0,
                peak_bytes_in_use: 0,
            },
        }
    }

    /// Format `arena` as a single free block spanning all of it.
    ///
    /// Trailing bytes beyond a multiple of 8 are left unused.
    pub fn init(&mut self, arena: &'static mut [u8]) -> AllocResult<()> {
        let base = arena.as_mut_ptr();
        let len = arena.len() & !(MIN_ALIGN - 1);
        if (base as usize) % MIN_ALIGN != 0 || len < HEADER_SIZE + MIN_PAYLOAD {
            return Err(AllocError::InvalidArena);
        }

        let head = base.cast::<BlockHeader>();
        // SAFETY: `arena` is exclusively ours, 8-aligned and large enough
        // for one header.
        unsafe {
            head.write(BlockHeader {
                size: len - HEADER_SIZE,
                prev: None,
                next: None,
                state: BlockState::Free,
            });
        }

        self.base = base;
        self.len = len;
        self.head = NonNull::new(head);
        self.stats = AllocationStats::default();

        log::info!(
            "heap arena {:#010x}..{:#010x} ({} bytes, header {} bytes)",
            base as usize,
            base as usize + len,
            len,
            HEADER_SIZE
        );
        Ok(())
    }

    /// Address range covered by the arena.
    pub fn arena_range(&self) -> core::ops::Range<usize> {
        let start = self.base as usize;
        start..start + self.len
    }

    /// Allocate `size` bytes with the minimum alignment.
    pub fn alloc(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        self.alloc_aligned(size, MIN_ALIGN)
    }

    /// Allocate `size` bytes whose address is a multiple of `alignment`.
    ///
    /// `alignment` must be a power of two; values below 8 are raised to 8.
    /// `size` is rounded up to a multiple of 8 (a zero-byte request takes
    /// 8 bytes). Out-of-memory is reported, never retried.
    pub fn alloc_aligned(&mut self, size: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
        if !alignment.is_power_of_two() {
            return Err(AllocError::InvalidAlignment(alignment));
        }
        let alignment = alignment.max(MIN_ALIGN);
        let size = match size.max(1).checked_add(MIN_ALIGN - 1) {
            Some(rounded) => rounded & !(MIN_ALIGN - 1),
            None => return self.fail(size, alignment),
        };

        let mut cursor = self.head;
        while let Some(block) = cursor {
            // SAFETY: every link in the list points at a live header inside
            // the arena.
            let (state, block_size, next) = unsafe {
                let header = block.as_ref();
                (header.state, header.size, header.next)
            };
            cursor = next;

            if state != BlockState::Free || block_size < size {
                continue;
            }

            let data = block.as_ptr() as usize + HEADER_SIZE;
            let aligned = (data + alignment - 1) & !(alignment - 1);
            let padding = aligned - data;
            if block_size < size + padding {
                continue;
            }

            let chosen = if padding == 0 {
                block
            } else if padding >= HEADER_SIZE + MIN_PAYLOAD {
                // SAFETY: `block` is free and holds `padding + size` bytes.
                unsafe { self.split_padding(block, padding) }
            } else {
                log::trace!("skip block {:#010x}: padding {} too small", block.as_ptr() as usize, padding);
                continue;
            };

            // SAFETY: `chosen` is a free block of at least `size` bytes.
            let ptr = unsafe { self.carve(chosen, size) };
            // SAFETY: `chosen` is still a valid header after carving.
            let granted = unsafe { chosen.as_ref().size };

            self.stats.total_allocations += 1;
            self.stats.bytes_in_use += granted;
            self.stats.peak_bytes_in_use = self.stats.peak_bytes_in_use.max(self.stats.bytes_in_use);
            log::trace!("alloc {} bytes @ {:#010x} (align {})", size, ptr.as_ptr() as usize, alignment);
            return Ok(ptr);
        }

        self.fail(size, alignment)
    }

    fn fail(&mut self, size: usize, alignment: usize) -> AllocResult<NonNull<u8>> {
        self.stats.failed_allocations += 1;
        log::warn!("out of memory: {} bytes aligned to {}", size, alignment);
        Err(AllocError::OutOfMemory)
    }

    /// Turn the first `padding` bytes of `block` into a padding block and
    /// return the free block that follows it.
    unsafe fn split_padding(&mut self, block: NonNull<BlockHeader>, padding: usize) -> NonNull<BlockHeader> {
        let b = block.as_ptr();
        let aligned = NonNull::new_unchecked(b.cast::<u8>().add(padding).cast::<BlockHeader>());

        aligned.as_ptr().write(BlockHeader {
            size: (*b).size - padding,
            prev: Some(block),
            next: (*b).next,
            state: BlockState::Free,
        });
        if let Some(next) = (*b).next {
            (*next.as_ptr()).prev = Some(aligned);
        }

        (*b).size = padding - HEADER_SIZE;
        (*b).state = BlockState::Padding;
        (*b).next = Some(aligned);
        aligned
    }

    /// Mark `block` used, splitting off a free tail when the remainder can
    /// hold a header plus the minimum payload.
    unsafe fn carve(&mut self, block: NonNull<BlockHeader>, size: usize) -> NonNull<u8> {
        let b = block.as_ptr();
        if (*b).size > size + HEADER_SIZE + MIN_PAYLOAD {
            let tail = NonNull::new_unchecked(b.cast::<u8>().add(HEADER_SIZE + size).cast::<BlockHeader>());
            tail.as_ptr().write(BlockHeader {
                size: (*b).size - size - HEADER_SIZE,
                prev: Some(block),
                next: (*b).next,
                state: BlockState::Free,
            });
            if let Some(next) = (*b).next {
                (*next.as_ptr()).prev = Some(tail);
            }
            (*b).size = size;
            (*b).next = Some(tail);
        }
        (*b).state = BlockState::Used;
        NonNull::new_unchecked(b.cast::<u8>().add(HEADER_SIZE))
    }

    /// Release an allocation and merge it with free neighbours.
    ///
    /// A null pointer is a no-op. Pointers that do not name a used block
    /// are rejected and leave the list untouched.
    pub fn free(&mut self, ptr: *mut u8) -> AllocResult<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let block = self.find_used(ptr as usize)?;

        // SAFETY: `block` and its neighbours are live headers in the list.
        unsafe {
            let b = block.as_ptr();
            (*b).state = BlockState::Free;
            self.stats.total_frees += 1;
            self.stats.bytes_in_use -= (*b).size;

            if let Some(next) = (*b).next {
                if (*next.as_ptr()).state == BlockState::Free {
                    Self::absorb(block, next);
                }
            }
            if let Some(prev) = (*b).prev {
                if (*prev.as_ptr()).state == BlockState::Free {
                    Self::absorb(prev, block);
                }
            }
        }
        log::trace!("free @ {:#010x}", ptr as usize);
        Ok(())
    }

    /// Merge `second` (the block right after `first`) into `first`.
    unsafe fn absorb(first: NonNull<BlockHeader>, second: NonNull<BlockHeader>) {
        let f = first.as_ptr();
        let s = second.as_ptr();
        (*f).size += HEADER_SIZE + (*s).size;
        (*f).next = (*s).next;
        if let Some(next) = (*s).next {
            (*next.as_ptr()).prev = Some(first);
        }
    }

    fn find_used(&self, addr: usize) -> AllocResult<NonNull<BlockHeader>> {
        let range = self.arena_range();
        if addr < range.start + HEADER_SIZE || addr >= range.end {
            return Err(AllocError::InvalidPointer(addr));
        }

        let mut cursor = self.head;
        while let Some(block) = cursor {
            let data = block.as_ptr() as usize + HEADER_SIZE;
            if data > addr {
                break;
            }
            // SAFETY: list links always point at live headers.
            let header = unsafe { block.as_ref() };
            if data == addr {
                return match header.state {
                    BlockState::Used => Ok(block),
                    BlockState::Free => Err(AllocError::DoubleFree(addr)),
                    BlockState::Padding => Err(AllocError::InvalidPointer(addr)),
                };
            }
            cursor = header.next;
        }
        Err(AllocError::InvalidPointer(addr))
    }

    /// Iterate over every block in address order.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            cursor: self.head,
            _allocator: PhantomData,
        }
    }

    /// Total payload bytes in free blocks.
    pub fn free_bytes(&self) -> usize {
        self.blocks()
            .filter(|b| b.state == BlockState::Free)
            .map(|b| b.size)
            .sum()
    }

    /// Payload size of the largest free block, 0 when none.
    pub fn largest_free_block(&self) -> usize {
        self.blocks()
            .filter(|b| b.state == BlockState::Free)
            .map(|b| b.size)
            .max()
            .unwrap_or(0)
    }

    /// Allocation statistics since `init`.
    pub fn stats(&self) -> AllocationStats {
        self.stats
    }
}

/// Iterator over the block list. See [`BlockAllocator::blocks`].
pub struct Blocks<'a> {
    cursor: Option<NonNull<BlockHeader>>,
    _allocator: PhantomData<&'a BlockAllocator>,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let block = self.cursor?;
        // SAFETY: the allocator is borrowed for `'a`, so the list cannot
        // change underneath the iterator.
        let header = unsafe { block.as_ref() };
        self.cursor = header.next;
        let addr = block.as_ptr() as usize;
        Some(BlockInfo {
            header: addr,
            data: addr + HEADER_SIZE,
            size: header.size,
            state: header.state,
        })
    }
}
