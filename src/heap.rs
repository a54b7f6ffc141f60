//! Sources of raw memory for the managed heap

#[cfg(all(feature = "sbrk", unix))]
use core::convert::TryFrom;
use core::{ptr, ptr::NonNull};

use crate::{consts, util};

/// A contiguous region of memory that can only grow, like the program break
///
/// # Safety
///
/// Implementors must uphold the following guarantees, which the allocator relies on:
///
/// - A successful call to `sbrk(size)` returns a pointer to `size` writable, zero-initialized
///   bytes that nothing else uses.
/// - The region returned by each call starts exactly where the region returned by the previous
///   successful call ends.
/// - The first region starts at an address that's a multiple of `ALIGN_SIZE`.
/// - Memory handed out stays valid for as long as the source is alive.
pub unsafe trait HeapSource {
    /// Extends the region by `size` bytes and returns a pointer to the first new byte, or `None`
    /// if the region can't grow
    fn sbrk(&mut self, size: usize) -> Option<NonNull<u8>>;
}

/// A heap source that carves growth out of a fixed memory buffer
///
/// Growing past the end of the buffer fails, like hitting the maximum heap size of a simulated
/// program break.
pub struct StaticHeap {
    start: NonNull<u8>,
    capacity: usize,
    brk: usize,
}

impl StaticHeap {
    /// Creates a heap source backed by `memory`
    ///
    /// The start of `memory` is rounded up to `ALIGN_SIZE`; the skipped bytes are not usable.
    pub fn new(memory: &'static mut [u8]) -> Self {
        let len = memory.len();
        let ptr = memory.as_mut_ptr();

        let (_, rem) = util::round_up(ptr as usize, consts::ALIGN_SIZE);
        let padding = if rem == 0 {
            0
        } else {
            consts::ALIGN_SIZE - rem
        };

        let (start, capacity) = if padding <= len {
            (ptr.wrapping_add(padding), len - padding)
        } else {
            (ptr, 0)
        };

        StaticHeap {
            start: NonNull::new(start).unwrap_or_else(|| assume_unreachable!()),
            capacity,
            brk: 0,
        }
    }

    /// Total number of bytes this source can hand out
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bytes handed out so far
    pub fn used(&self) -> usize {
        self.brk
    }
}

unsafe impl HeapSource for StaticHeap {
    fn sbrk(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size > self.capacity - self.brk {
            return None;
        }

        unsafe {
            let old_brk = self.start.as_ptr().add(self.brk);
            ptr::write_bytes(old_brk, 0, size);
            self.brk += size;

            Some(NonNull::new_unchecked(old_brk))
        }
    }
}

/// A heap source that moves the program break with `sbrk(2)`
///
/// The region must stay contiguous: if something else in the process moves the break between two
/// requests the growth is refused
#[cfg(all(feature = "sbrk", unix))]
pub struct Sbrk {
    end: Option<NonNull<u8>>,
}

#[cfg(all(feature = "sbrk", unix))]
impl Sbrk {
    /// Creates a heap source that starts at the current program break
    pub const fn new() -> Self {
        Sbrk { end: None }
    }

    fn raw_sbrk(increment: usize) -> Option<*mut u8> {
        let increment = libc::intptr_t::try_from(increment).ok()?;
        let ptr = unsafe { libc::sbrk(increment) };

        if ptr as isize == -1 {
            None
        } else {
            Some(ptr as *mut u8)
        }
    }
}

#[cfg(all(feature = "sbrk", unix))]
impl Default for Sbrk {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(feature = "sbrk", unix))]
unsafe impl HeapSource for Sbrk {
    fn sbrk(&mut self, size: usize) -> Option<NonNull<u8>> {
        let ptr = match self.end {
            Some(end) => {
                let ptr = Self::raw_sbrk(size)?;
                if ptr != end.as_ptr() {
                    log::warn!(
                        "program break moved from {:p} to {:p}; refusing non-contiguous growth",
                        end.as_ptr(),
                        ptr
                    );
                    return None;
                }
                ptr
            }
            None => {
                // align the first region
                let brk = Self::raw_sbrk(0)?;
                let (_, rem) = util::round_up(brk as usize, consts::ALIGN_SIZE);
                let padding = if rem == 0 {
                    0
                } else {
                    consts::ALIGN_SIZE - rem
                };

                let ptr = Self::raw_sbrk(padding + size)?;
                if ptr != brk {
                    log::warn!("program break moved from {:p} to {:p} during setup", brk, ptr);
                    return None;
                }
                ptr.wrapping_add(padding)
            }
        };

        let start = NonNull::new(ptr)?;
        self.end = NonNull::new(ptr.wrapping_add(size));

        // pages given back by an earlier shrink of the break may still hold old data
        unsafe { ptr::write_bytes(ptr, 0, size) };

        Some(start)
    }
}
