use core::{
    cmp, mem,
    ops::{Add, Rem, Sub},
};

use crate::consts;

pub fn round_up<T>(x: T, multiple: T) -> (/* x */ T, /* rem */ T)
where
    T: Add<T, Output = T> + Copy + Rem<T, Output = T> + PartialEq + Sub<T, Output = T>,
{
    let zero = unsafe { mem::zeroed() };
    let rem = x % multiple;
    if rem == zero {
        (x, zero)
    } else {
        (x + (multiple - rem), rem)
    }
}

/// Turns a request of `size` payload bytes into a block size
///
/// Adds room for the header and the footer, rounds up to `ALIGN_SIZE` and raises the result to
/// `MIN_BLOCK_SIZE` so that the block can hold the free list links once it's freed. Returns `None`
/// if the block would be bigger than `MAX_BLOCK_SIZE`
pub fn adjust_size(size: usize) -> Option<usize> {
    debug_assert_ne!(size, 0);

    // `MAX_BLOCK_SIZE` is far below `usize::MAX` on any target we care about so checking the
    // request first rules out overflow in the arithmetic below
    if size > consts::MAX_BLOCK_SIZE - consts::OVERHEAD {
        return None;
    }

    let asize = round_up(size + consts::OVERHEAD, consts::ALIGN_SIZE).0;
    let asize = cmp::max(asize, consts::MIN_BLOCK_SIZE);

    if asize > consts::MAX_BLOCK_SIZE {
        None
    } else {
        Some(asize)
    }
}

// All metadata words are stored little endian regardless of the target
pub unsafe fn read_word(ptr: *const u8) -> u64 {
    debug_assert_eq!(ptr as usize % consts::WORD_SIZE, 0);

    u64::from_le((ptr as *const u64).read())
}

pub unsafe fn write_word(ptr: *mut u8, word: u64) {
    debug_assert_eq!(ptr as usize % consts::WORD_SIZE, 0);

    (ptr as *mut u64).write(word.to_le())
}
