//! A first-fit allocator with an explicit free list and boundary tag coalescing
//!
//! # Features
//!
//! - Manages a single contiguous region of memory that grows on demand, like the program break,
//!   through any [`HeapSource`]
//!
//! - Constant time `dealloc`: neighbors are found through boundary tags and merged eagerly
//!
//! - No splinters: a free block is only split when the remainder can stand on its own
//!
//! - Every returned pointer is aligned to [`ALIGN_SIZE`] (8) bytes
//!
//! - A consistency checker that can audit the whole heap between any two operations
//!
//! # Example
//!
//! ``` ignore
//! #![no_std]
//!
//! use tagalloc::{Allocator, StaticHeap};
//!
//! #[repr(align(8))]
//! struct Aligned<T>(T);
//!
//! static mut MEMORY: Aligned<[u8; 4 * tagalloc::CHUNK_SIZE]> =
//!     Aligned([0; 4 * tagalloc::CHUNK_SIZE]);
//!
//! fn main() {
//!     // NOTE(unsafe) `MEMORY` is only ever borrowed here
//!     let source = StaticHeap::new(unsafe { &mut MEMORY.0 });
//!     let mut heap = Allocator::init(source).unwrap();
//!
//!     let x = heap.alloc(100).unwrap();
//!     let x = unsafe { heap.realloc(x, 200) }.unwrap();
//!     unsafe { heap.dealloc(x) };
//!
//!     assert!(heap.check_heap(false).is_consistent());
//! }
//! ```
//!
//! # Heap layout
//!
//! Every block has a one-word header and a one-word footer that hold its size and whether it's
//! allocated (see the *boundary tags* below). A free block reuses the first two words of its body
//! to store the links of the free list.
//!
//! ``` text
//!  begin                                                                         end
//!  heap                                                                         heap
//!  +----------+---------------------+-----------------------------+----------+
//!  | hdr(8:a) | hdr(32:a) .. ftr    | zero or more user blocks    | hdr(0:a) |
//!  +----------+---------------------+-----------------------------+----------+
//!  | prologue | free list sentinel  |                             | epilogue |
//! ```
//!
//! The prologue, the sentinel and the epilogue are always allocated, which removes all the edge
//! cases from coalescing. The sentinel anchors the free list; freed blocks are linked right after
//! it so the list is ordered most recently freed first.
//!
//! Boundary tags are 64-bit little endian words:
//!
//! ``` text
//!  63          32 31                1   0
//! +--------------+-------------------+-----+
//! |    unused    |    block size     | a/f |
//! +--------------+-------------------+-----+
//! ```
//!
//! # Cargo features
//!
//! - `sbrk`: enables the [`Sbrk`] heap source, which grows the heap by moving the program break
//!   with `sbrk(2)` (unix only)
//!
//! - `ufmt`: implements `ufmt::uDebug` for the allocator and the diagnostic types
//!
//! # Limitations
//!
//! - Not thread safe. All operations take `&mut self`; wrap the allocator in a lock (e.g.
//!   `spin::Mutex`) to share it.
//!
//! - Memory is never given back to the heap source; the heap only grows.
//!
//! - The heap can't grow past [`MAX_HEAP_SIZE`] bytes. Free list links are stored as 32-bit
//!   offsets from the start of the heap, and block sizes must fit in the 31-bit size field.
//!
//! - [`Allocator.realloc`] always moves the allocation.
//!
//! [`Allocator.realloc`]: struct.Allocator.html#method.realloc

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]
#![deny(rust_2018_compatibility)]
#![deny(rust_2018_idioms)]

use core::{cmp, fmt, marker::PhantomData, num::NonZeroU32, ptr, ptr::NonNull};

#[cfg(feature = "ufmt")]
use ufmt::derive::uDebug;

pub use crate::check::{Anomaly, HeapReport};
pub use crate::consts::{
    ALIGN_SIZE, CHUNK_SIZE, MAX_BLOCK_SIZE, MAX_HEAP_SIZE, MIN_BLOCK_SIZE, OVERHEAD, WORD_SIZE,
};
#[cfg(all(feature = "sbrk", unix))]
pub use crate::heap::Sbrk;
pub use crate::heap::{HeapSource, StaticHeap};
use crate::{
    block::{Block, Tag},
    free_block::FreeBlock,
};

#[macro_use]
mod macros;
mod block;
mod check;
mod consts;
mod free_block;
mod heap;
mod util;

/// Byte offset of a block header from the start of the heap
type Offset = NonZeroU32;

const SENTINEL: Offset = unsafe { Offset::new_unchecked(consts::SENTINEL_OFFSET) };

/// Errors reported by the allocator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "ufmt", derive(uDebug))]
pub enum Error {
    /// The heap source couldn't provide the initial heap
    InitFailed,
    /// The heap source couldn't grow the heap enough to satisfy a request
    OutOfMemory,
    /// A reallocation to zero bytes was requested
    ZeroSize,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InitFailed => f.write_str("the initial heap request could not be satisfied"),
            Error::OutOfMemory => f.write_str("out of memory"),
            Error::ZeroSize => f.write_str("zero-sized reallocation"),
        }
    }
}

/// A block as seen from outside the allocator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "ufmt", derive(uDebug))]
pub struct BlockSpan {
    /// Offset of the block header from the start of the heap
    pub offset: usize,
    /// Size of the block, header and footer included
    pub size: usize,
    /// Whether the block is allocated
    pub allocated: bool,
}

/// First-fit, explicit free list allocator over a growable region of memory
pub struct Allocator<S> {
    source: S,
    start: NonNull<u8>,
    size: usize,
}

impl<S> Allocator<S>
where
    S: HeapSource,
{
    /* Constructors */
    /// Requests the initial heap from `source` and lays it out
    ///
    /// After this call the heap holds the prologue, the free list sentinel, a single free block
    /// and the epilogue. Returns `Error::InitFailed` if `source` can't provide `CHUNK_SIZE` bytes.
    pub fn init(mut source: S) -> Result<Self, Error> {
        let start = if let Some(start) = source.sbrk(consts::CHUNK_SIZE) {
            start
        } else {
            log::warn!("initial heap request of {} bytes failed", consts::CHUNK_SIZE);
            return Err(Error::InitFailed);
        };

        if start.as_ptr() as usize % consts::ALIGN_SIZE != 0 {
            log::warn!("heap source returned a misaligned region at {:p}", start);
            return Err(Error::InitFailed);
        }

        let mut heap = Allocator {
            source,
            start,
            size: consts::CHUNK_SIZE,
        };

        unsafe {
            util::write_word(
                start.as_ptr(),
                Tag::new(consts::PROLOGUE_SIZE, true).to_bits(),
            );

            let mut sentinel = heap.node(SENTINEL);
            sentinel.set_tags(consts::MIN_BLOCK_SIZE, true);
            sentinel.set_next_free(None);
            sentinel.set_prev_free(None);

            let mut first = sentinel.next_neighbor();
            first.set_tags(
                consts::CHUNK_SIZE
                    - consts::PROLOGUE_SIZE
                    - consts::MIN_BLOCK_SIZE
                    - consts::EPILOGUE_SIZE,
                false,
            );

            heap.write_epilogue();
            heap.insert(FreeBlock::new_unchecked(first));
        }

        log::debug!("heap initialized at {:p} with {} bytes", start, heap.size);

        Ok(heap)
    }

    /* Public API */
    /// Allocates a block with room for at least `size` bytes
    ///
    /// Returns `None` if `size` is zero, which is not an error, or if the heap source can't
    /// provide the memory. The returned pointer is aligned to `ALIGN_SIZE` bytes.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        // ignore spurious requests
        if size == 0 {
            return None;
        }

        let asize = if let Some(asize) = util::adjust_size(size) {
            asize
        } else {
            log::warn!("alloc({}) -> exceeds the maximum block size", size);
            return None;
        };

        unsafe {
            let fb = if let Some(fb) = self.find_fit(asize) {
                fb
            } else if let Some(fb) = self.extend_heap(cmp::max(asize, consts::CHUNK_SIZE)) {
                fb
            } else {
                log::warn!("alloc({}) -> out of memory", size);
                return None;
            };

            let ptr = self.place(fb, asize);
            log::trace!("alloc({}) -> {:p}", size, ptr);

            Some(ptr)
        }
    }

    /// Like `alloc` but the first `size` bytes of the returned block are zeroed
    pub fn alloc_zeroed(&mut self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.alloc(size)?;
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Some(ptr)
    }

    /// Gives the block referenced by `ptr` back to the allocator
    ///
    /// The block is merged with its free neighbors right away.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator and not been deallocated since.
    pub unsafe fn dealloc(&mut self, ptr: NonNull<u8>) {
        let mut block = Block::from_payload(ptr.as_ptr());
        debug_assert!(block.is_allocated());

        let size = block.size();
        block.set_tags(size, false);
        self.coalesce(block);

        log::trace!("dealloc({:p}) size={}", ptr, size);
    }

    /// Moves the allocation referenced by `ptr` into a new block with room for `new_size` bytes
    ///
    /// The first `min(usable_size(ptr), new_size)` bytes are copied over and the old block is
    /// deallocated. On failure the old block is left untouched and still owned by the caller:
    /// `Error::ZeroSize` if `new_size` is zero, `Error::OutOfMemory` if the new block can't be
    /// allocated.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator and not been deallocated since.
    pub unsafe fn realloc(&mut self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, Error> {
        if new_size == 0 {
            return Err(Error::ZeroSize);
        }

        let new_ptr = if let Some(new_ptr) = self.alloc(new_size) {
            new_ptr
        } else {
            log::warn!("realloc({:p}, {}) -> out of memory", ptr, new_size);
            return Err(Error::OutOfMemory);
        };

        let old_size = self.usable_size(ptr);
        ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), cmp::min(old_size, new_size));
        self.dealloc(ptr);

        log::trace!("realloc({:p}, {}) -> {:p}", ptr, new_size, new_ptr);

        Ok(new_ptr)
    }

    /* Private API */
    unsafe fn find_fit(&self, asize: usize) -> Option<FreeBlock> {
        // first fit; the sentinel itself is never a candidate
        let mut next = self.sentinel().next_free();

        while let Some(offset) = next {
            let fb = self.node(offset);
            debug_assert!(!fb.is_allocated(), "{:?}", fb);

            if fb.size() >= asize {
                return Some(fb);
            }

            next = fb.next_free();
        }

        None
    }

    /// Grows the heap by `size` bytes and returns the new free block, merged with the previous one
    /// if that one was free
    unsafe fn extend_heap(&mut self, size: usize) -> Option<FreeBlock> {
        let (size, _) = util::round_up(size, consts::ALIGN_SIZE);
        if size == 0 || size > consts::MAX_HEAP_SIZE - self.size {
            return None;
        }

        let region = self.source.sbrk(size)?;
        if region.as_ptr() != self.end() {
            log::warn!(
                "heap source returned {:p} but the heap ends at {:p}",
                region,
                self.end()
            );
            return None;
        }

        // the old epilogue header becomes the header of the new free block
        let mut block = Block::from_header(self.end().sub(consts::EPILOGUE_SIZE));
        self.size += size;
        block.set_tags(size, false);
        self.write_epilogue();

        log::debug!("heap grown by {} bytes to {} bytes", size, self.size);

        Some(self.coalesce(block))
    }

    /// Allocates `asize` bytes at the start of the free block `fb`
    ///
    /// The rest of `fb` becomes a new free block unless it'd be smaller than `MIN_BLOCK_SIZE`, in
    /// which case it's handed out as part of the allocation
    unsafe fn place(&mut self, mut fb: FreeBlock, asize: usize) -> NonNull<u8> {
        let size = fb.size();
        debug_assert!(size >= asize);

        self.unlink(&mut fb);

        let mut block = fb.block();
        let remainder = size - asize;
        if remainder >= consts::MIN_BLOCK_SIZE {
            block.set_tags(asize, true);

            let mut rest = block.next_neighbor();
            rest.set_tags(remainder, false);
            self.insert(FreeBlock::new_unchecked(rest));
        } else {
            block.set_tags(size, true);
        }

        NonNull::new_unchecked(block.payload())
    }
}

impl<S> Allocator<S> {
    /* Getters */
    /// Number of bytes obtained from the heap source so far
    pub fn heap_size(&self) -> usize {
        self.size
    }

    /// Address of the first byte of the heap
    ///
    /// `BlockSpan` offsets are relative to this address.
    pub fn heap_start(&self) -> NonNull<u8> {
        self.start
    }

    /// Number of payload bytes the block referenced by `ptr` can hold
    ///
    /// This can be more than what was requested from `alloc` because of rounding.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator and not been deallocated since.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        Block::from_payload(ptr.as_ptr()).usable_size()
    }

    /// Iterates over every block in address order, from the free list sentinel to the last block
    /// before the epilogue
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            start: self.start,
            cursor: consts::SENTINEL_OFFSET as usize,
            end: self.size - consts::EPILOGUE_SIZE,
            _marker: PhantomData,
        }
    }

    /// Iterates over the free list, most recently freed block first
    pub fn free_blocks(&self) -> FreeBlocks<'_> {
        unsafe {
            FreeBlocks {
                start: self.start,
                end: self.size - consts::EPILOGUE_SIZE,
                next: self.sentinel().next_free(),
                remaining: self.size / consts::MIN_BLOCK_SIZE,
                _marker: PhantomData,
            }
        }
    }

    /* Free list */
    /// Links `fb` right after the sentinel
    unsafe fn insert(&mut self, mut fb: FreeBlock) {
        let mut sentinel = self.sentinel();
        let offset = self.offset(&fb);

        let next = sentinel.next_free();
        if let Some(next) = next {
            self.node(next).set_prev_free(Some(offset));
        }

        fb.set_next_free(next);
        fb.set_prev_free(Some(SENTINEL));
        sentinel.set_next_free(Some(offset));
    }

    /// Removes `fb` from the free list
    unsafe fn unlink(&mut self, fb: &mut FreeBlock) {
        let next = fb.next_free();
        // every node has a predecessor, if only the sentinel
        let prev = fb.prev_free().unwrap_or_else(|| assume_unreachable!());

        self.node(prev).set_next_free(next);
        if let Some(next) = next {
            self.node(next).set_prev_free(Some(prev));
        }

        fb.set_next_free(None);
        fb.set_prev_free(None);
    }

    /* Coalescing */
    /// Merges the free `block` with its free neighbors and puts the result in the free list
    unsafe fn coalesce(&mut self, mut block: Block) -> FreeBlock {
        debug_assert!(!block.is_allocated());

        let prev_allocated = block.prev_footer_tag().is_allocated();
        let next = block.next_neighbor();
        let next_allocated = next.is_allocated();

        // free neighbors leave the list before their tags get overwritten
        let merged = match (prev_allocated, next_allocated) {
            (true, true) => block,
            (true, false) => {
                let mut next = FreeBlock::new_unchecked(next);
                self.unlink(&mut next);

                let size = block.size() + next.size();
                block.set_tags(size, false);
                block
            }
            (false, true) => {
                let mut prev = FreeBlock::new_unchecked(block.prev_neighbor());
                self.unlink(&mut prev);

                let size = prev.size() + block.size();
                prev.set_tags(size, false);
                prev.block()
            }
            (false, false) => {
                let mut prev = FreeBlock::new_unchecked(block.prev_neighbor());
                let mut next = FreeBlock::new_unchecked(next);
                self.unlink(&mut prev);
                self.unlink(&mut next);

                let size = prev.size() + block.size() + next.size();
                prev.set_tags(size, false);
                prev.block()
            }
        };

        let fb = FreeBlock::new_unchecked(merged);
        self.insert(fb);
        fb
    }

    /* Miscellaneous */
    fn end(&self) -> *mut u8 {
        self.start.as_ptr().wrapping_add(self.size)
    }

    unsafe fn write_epilogue(&mut self) {
        util::write_word(
            self.end().sub(consts::EPILOGUE_SIZE),
            Tag::new(0, true).to_bits(),
        );
    }

    unsafe fn sentinel(&self) -> FreeBlock {
        self.node(SENTINEL)
    }

    unsafe fn node(&self, offset: Offset) -> FreeBlock {
        FreeBlock::new_unchecked(Block::from_header(
            self.start.as_ptr().add(offset.get() as usize),
        ))
    }

    fn offset(&self, block: &Block) -> Offset {
        let offset = block.header() as usize - self.start.as_ptr() as usize;
        debug_assert!(offset < self.size);

        Offset::new(offset as u32).unwrap_or_else(|| assume_unreachable!())
    }
}

/// Iterator over the blocks of the heap in address order
///
/// See [`Allocator.blocks`](struct.Allocator.html#method.blocks)
pub struct Blocks<'a> {
    start: NonNull<u8>,
    cursor: usize,
    end: usize,
    // freeze the `Allocator`
    _marker: PhantomData<&'a ()>,
}

impl Iterator for Blocks<'_> {
    type Item = BlockSpan;

    fn next(&mut self) -> Option<BlockSpan> {
        if self.cursor >= self.end {
            return None;
        }

        let tag = unsafe { Tag::from_bits(util::read_word(self.start.as_ptr().add(self.cursor))) };
        let size = tag.size();

        // stop at the epilogue, or at a size that would leave the heap
        if size == 0 || size % consts::ALIGN_SIZE != 0 || size > self.end - self.cursor {
            self.cursor = self.end;
            return None;
        }

        let span = BlockSpan {
            offset: self.cursor,
            size,
            allocated: tag.is_allocated(),
        };
        self.cursor += size;

        Some(span)
    }
}

/// Iterator over the free list, most recently freed block first
///
/// See [`Allocator.free_blocks`](struct.Allocator.html#method.free_blocks)
pub struct FreeBlocks<'a> {
    start: NonNull<u8>,
    end: usize,
    next: Option<Offset>,
    // bounds the walk if the links form a cycle
    remaining: usize,
    // freeze the `Allocator`
    _marker: PhantomData<&'a ()>,
}

impl Iterator for FreeBlocks<'_> {
    type Item = BlockSpan;

    fn next(&mut self) -> Option<BlockSpan> {
        let offset = self.next?;
        let at = offset.get() as usize;

        if self.remaining == 0 || at % consts::ALIGN_SIZE != 0 || at + consts::MIN_BLOCK_SIZE > self.end
        {
            self.next = None;
            return None;
        }
        self.remaining -= 1;

        unsafe {
            let fb = FreeBlock::new_unchecked(Block::from_header(self.start.as_ptr().add(at)));
            let tag = fb.tag();
            self.next = fb.next_free();

            Some(BlockSpan {
                offset: at,
                size: tag.size(),
                allocated: tag.is_allocated(),
            })
        }
    }
}

struct FreeList<'a, S>(&'a Allocator<S>);

impl<S> fmt::Debug for FreeList<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.free_blocks()).finish()
    }
}

#[cfg(feature = "ufmt")]
impl<S> ufmt::uDebug for FreeList<'_, S> {
    fn fmt<W>(&self, f: &mut ufmt::Formatter<'_, W>) -> Result<(), W::Error>
    where
        W: ufmt::uWrite,
    {
        f.debug_list()?.entries(self.0.free_blocks())?.finish()
    }
}

impl<S> fmt::Debug for Allocator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("start", &self.start)
            .field("heap_size", &self.size)
            .field("free_blocks", &FreeList(self))
            .finish()
    }
}

#[cfg(feature = "ufmt")]
impl<S> ufmt::uDebug for Allocator<S> {
    fn fmt<W>(&self, f: &mut ufmt::Formatter<'_, W>) -> Result<(), W::Error>
    where
        W: ufmt::uWrite,
    {
        f.debug_struct("Allocator")?
            .field("start", &(self.start.as_ptr() as usize))?
            .field("heap_size", &self.size)?
            .field("free_blocks", &FreeList(self))?
            .finish()
    }
}
