/// Size of a header or footer word, in bytes
pub const WORD_SIZE: usize = 8;

// All blocks start 8-byte aligned and their sizes are always multiple of 8
pub const ALIGN_SIZE_LOG2: u32 = 3;
/// All block sizes are multiple of this number; this number is also the alignment of every
/// pointer returned by the allocator
pub const ALIGN_SIZE: usize = 1 << ALIGN_SIZE_LOG2;

/// Per-block cost of the header and the footer
pub const OVERHEAD: usize = 2 * WORD_SIZE;

/// Smallest block the allocator will create
///
/// A free block must hold its header, its footer and the two free list links. That adds up to 32
/// bytes on 64-bit words.
pub const MIN_BLOCK_SIZE: usize = 32;

/// Amount of memory requested from the heap source on initialization, and the minimum amount
/// requested every time the heap has to grow
pub const CHUNK_SIZE: usize = 1 << 16;

/// The managed heap never grows past this many bytes
///
/// This keeps every block size inside the 31 bits of the size field and every link offset inside
/// a `u32`.
pub const MAX_HEAP_SIZE: usize = 1 << 31;

/// Maximum size of any individual block
pub const MAX_BLOCK_SIZE: usize = MAX_HEAP_SIZE - ALIGN_SIZE;

// The prologue is a lone header: its header doubles as its footer
pub const PROLOGUE_SIZE: usize = WORD_SIZE;

pub const EPILOGUE_SIZE: usize = WORD_SIZE;

/// Offset of the free list sentinel from the start of the heap
pub const SENTINEL_OFFSET: u32 = PROLOGUE_SIZE as u32;

// NOTE the first free block must fit after the prologue, the sentinel and the epilogue
#[allow(dead_code)]
const ASSERT0: [(); 0 - !(CHUNK_SIZE >= PROLOGUE_SIZE + 2 * MIN_BLOCK_SIZE + EPILOGUE_SIZE)
    as usize] = [];

// NOTE `CHUNK_SIZE` is handed to the heap source as is so it must keep the heap aligned
#[allow(dead_code)]
const ASSERT1: [(); 0 - !(CHUNK_SIZE % ALIGN_SIZE == 0) as usize] = [];
