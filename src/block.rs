use core::fmt;

use crate::{consts, util};

/// A boundary tag: the header or footer word of a block
///
/// ``` text
///  63          32 31                1   0
/// +--------------+-------------------+-----+
/// |    unused    |    block size     | a/f |
/// +--------------+-------------------+-----+
/// ```
///
/// `a/f` is 1 iff the block is allocated. The size is stored shifted one bit to the left
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Tag(u64);

impl Tag {
    const ALLOCATED_BIT: u64 = 1 << 0;
    const SIZE_SHIFT: u32 = 1;
    const SIZE_MASK: u64 = 0x7fff_ffff << Self::SIZE_SHIFT;

    /* Constructors */
    pub fn new(size: usize, allocated: bool) -> Self {
        debug_assert_eq!(size % consts::ALIGN_SIZE, 0);
        debug_assert!(size <= consts::MAX_BLOCK_SIZE);

        let mut bits = ((size as u64) << Self::SIZE_SHIFT) & Self::SIZE_MASK;
        if allocated {
            bits |= Self::ALLOCATED_BIT;
        }

        Tag(bits)
    }

    pub fn from_bits(bits: u64) -> Self {
        Tag(bits)
    }

    /* Getters */
    pub fn to_bits(self) -> u64 {
        self.0
    }

    pub fn size(self) -> usize {
        ((self.0 & Self::SIZE_MASK) >> Self::SIZE_SHIFT) as usize
    }

    pub fn is_allocated(self) -> bool {
        self.0 & Self::ALLOCATED_BIT != 0
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}:{}]",
            self.size(),
            if self.is_allocated() { 'a' } else { 'f' }
        )
    }
}

/// Handle to a block in the managed heap
///
/// A block is identified by the address of its header. The body (payload of an allocated block,
/// free list links of a free one) starts one word after the header and the footer is the last word
/// of the block.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Block {
    header: *mut u8,
}

impl Block {
    /* Constructors */
    pub unsafe fn from_header(header: *mut u8) -> Self {
        debug_assert_eq!(header as usize % consts::ALIGN_SIZE, 0);

        Block { header }
    }

    pub unsafe fn from_payload(ptr: *mut u8) -> Self {
        Block::from_header(ptr.sub(consts::WORD_SIZE))
    }

    /* Getters */
    pub fn header(&self) -> *mut u8 {
        self.header
    }

    pub fn payload(&self) -> *mut u8 {
        self.header.wrapping_add(consts::WORD_SIZE)
    }

    pub unsafe fn tag(&self) -> Tag {
        Tag::from_bits(util::read_word(self.header))
    }

    pub unsafe fn size(&self) -> usize {
        self.tag().size()
    }

    pub unsafe fn is_allocated(&self) -> bool {
        self.tag().is_allocated()
    }

    // NOTE(safety) the footer location is derived from the size in the header; a corrupt header
    // yields a bogus footer address
    pub unsafe fn footer(&self) -> *mut u8 {
        debug_assert!(self.size() >= consts::WORD_SIZE);

        self.header.add(self.size() - consts::WORD_SIZE)
    }

    pub unsafe fn footer_tag(&self) -> Tag {
        Tag::from_bits(util::read_word(self.footer()))
    }

    /// Payload bytes available to the owner of this block
    pub unsafe fn usable_size(&self) -> usize {
        self.size() - consts::OVERHEAD
    }

    /* Setters */
    /// Writes the header and the matching footer
    pub unsafe fn set_tags(&mut self, size: usize, allocated: bool) {
        let tag = Tag::new(size, allocated);
        util::write_word(self.header, tag.to_bits());
        util::write_word(self.footer(), tag.to_bits());
    }

    /* Neighbors */
    // NOTE(safety) the epilogue has no next neighbor
    pub unsafe fn next_neighbor(&self) -> Block {
        debug_assert_ne!(self.size(), 0);

        Block::from_header(self.header.add(self.size()))
    }

    /// The footer of the block right before this one
    ///
    /// For the block right after the prologue this is the prologue header
    pub unsafe fn prev_footer_tag(&self) -> Tag {
        Tag::from_bits(util::read_word(self.header.sub(consts::WORD_SIZE)))
    }

    pub unsafe fn prev_neighbor(&self) -> Block {
        let size = self.prev_footer_tag().size();
        debug_assert_ne!(size, 0);

        Block::from_header(self.header.sub(size))
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = unsafe { self.tag() };
        let mut s = f.debug_struct("Block");
        s.field("header", &self.header).field("tag", &tag);
        if tag.size() != 0 {
            s.field("footer", &unsafe { self.footer_tag() });
        }
        s.finish()
    }
}
