use core::{fmt, num::NonZeroU32, ops};

use crate::{block::Block, consts, util, Offset};

/// A free list node: a free block, or the sentinel that anchors the list
///
/// The first two words of the body hold the links to the neighboring nodes as byte offsets from
/// the start of the heap. Offset 0 is the prologue, which is never a node, so a stored 0 means
/// "no link"
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct FreeBlock {
    block: Block,
}

impl FreeBlock {
    const NEXT_FREE: usize = 0;
    const PREV_FREE: usize = consts::WORD_SIZE;

    /* Constructors */
    // NOTE(safety) the block must span at least `MIN_BLOCK_SIZE` bytes of the heap, or the links
    // land in the next block
    pub unsafe fn new_unchecked(block: Block) -> Self {
        FreeBlock { block }
    }

    /* Getters */
    pub fn block(&self) -> Block {
        self.block
    }

    pub unsafe fn next_free(&self) -> Option<Offset> {
        self.link(Self::NEXT_FREE)
    }

    pub unsafe fn prev_free(&self) -> Option<Offset> {
        self.link(Self::PREV_FREE)
    }

    /* Setters */
    pub unsafe fn set_next_free(&mut self, next_free: Option<Offset>) {
        self.set_link(Self::NEXT_FREE, next_free)
    }

    pub unsafe fn set_prev_free(&mut self, prev_free: Option<Offset>) {
        self.set_link(Self::PREV_FREE, prev_free)
    }

    /* Miscellaneous */
    unsafe fn link(&self, slot: usize) -> Option<Offset> {
        // links never exceed `MAX_HEAP_SIZE` so the upper half of the word is always zero
        NonZeroU32::new(util::read_word(self.block.payload().add(slot)) as u32)
    }

    unsafe fn set_link(&mut self, slot: usize, link: Option<Offset>) {
        let word = link.map(|offset| u64::from(offset.get())).unwrap_or(0);
        util::write_word(self.block.payload().add(slot), word)
    }
}

impl ops::Deref for FreeBlock {
    type Target = Block;

    fn deref(&self) -> &Block {
        &self.block
    }
}

impl ops::DerefMut for FreeBlock {
    fn deref_mut(&mut self) -> &mut Block {
        &mut self.block
    }
}

impl fmt::Debug for FreeBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        unsafe {
            f.debug_struct("FreeBlock")
                .field("header", &self.header())
                .field("tag", &self.tag())
                .field("next_free", &self.next_free())
                .field("prev_free", &self.prev_free())
                .finish()
        }
    }
}
