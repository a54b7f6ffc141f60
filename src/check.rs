//! Heap consistency checker

use core::fmt;

#[cfg(feature = "ufmt")]
use ufmt::derive::uDebug;

use crate::{
    block::{Block, Tag},
    consts, util, Allocator, Offset, SENTINEL,
};

/// A broken heap invariant found by `Allocator.check_heap`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "ufmt", derive(uDebug))]
pub enum Anomaly {
    /// The prologue is not an allocated 8-byte block
    BadPrologue,
    /// The free list sentinel is not an allocated `MIN_BLOCK_SIZE` block without predecessor
    BadSentinel,
    /// The heap walk didn't end on a zero-sized allocated epilogue at the end of the heap
    BadEpilogue {
        /// Where the walk ended
        offset: usize,
    },
    /// A block extends past the end of the heap
    OutOfBounds {
        /// Offset of the block header
        offset: usize,
    },
    /// The body of a block is not aligned to `ALIGN_SIZE`
    Misaligned {
        /// Offset of the block header
        offset: usize,
    },
    /// A block size is not a multiple of `ALIGN_SIZE` or is below `MIN_BLOCK_SIZE`
    BadSize {
        /// Offset of the block header
        offset: usize,
        /// The size found in the header
        size: usize,
    },
    /// Header and footer disagree
    TagMismatch {
        /// Offset of the block header
        offset: usize,
    },
    /// A free block follows another free block
    AdjacentFree {
        /// Offset of the second block header
        offset: usize,
    },
    /// A free list node is marked as allocated
    AllocatedInFreeList {
        /// Offset of the node
        offset: usize,
    },
    /// A free list link points outside the heap, doesn't point back, or the list never ends
    BrokenLink {
        /// Offset of the node holding the bad link
        offset: usize,
    },
    /// The free list and the heap disagree on the number of free blocks
    FreeListMismatch {
        /// Nodes reachable from the sentinel
        listed: usize,
        /// Free blocks found by the heap walk
        free: usize,
    },
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Anomaly::BadPrologue => f.write_str("bad prologue header"),
            Anomaly::BadSentinel => f.write_str("bad free list sentinel"),
            Anomaly::BadEpilogue { offset } => write!(f, "bad epilogue header at {:#x}", offset),
            Anomaly::OutOfBounds { offset } => {
                write!(f, "block at {:#x} extends past the end of the heap", offset)
            }
            Anomaly::Misaligned { offset } => {
                write!(f, "payload for block at {:#x} is not aligned", offset)
            }
            Anomaly::BadSize { offset, size } => {
                write!(f, "block at {:#x} has invalid size {}", offset, size)
            }
            Anomaly::TagMismatch { offset } => {
                write!(f, "header does not match footer for block at {:#x}", offset)
            }
            Anomaly::AdjacentFree { offset } => {
                write!(f, "free block at {:#x} follows a free block", offset)
            }
            Anomaly::AllocatedInFreeList { offset } => {
                write!(f, "allocated block at {:#x} is in the free list", offset)
            }
            Anomaly::BrokenLink { offset } => {
                write!(f, "broken free list link at {:#x}", offset)
            }
            Anomaly::FreeListMismatch { listed, free } => write!(
                f,
                "free list holds {} blocks but the heap has {} free blocks",
                listed, free
            ),
        }
    }
}

/// Outcome of `Allocator.check_heap`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "ufmt", derive(uDebug))]
pub struct HeapReport {
    /// Blocks between the prologue and the epilogue, the sentinel included
    pub blocks: usize,
    /// Free blocks found by the heap walk
    pub free_blocks: usize,
    /// Bytes held by free blocks, tags included
    pub free_bytes: usize,
    /// Nodes reachable from the free list sentinel
    pub listed: usize,
    /// Number of broken invariants
    pub anomalies: usize,
    /// The first broken invariant
    pub first_anomaly: Option<Anomaly>,
}

impl HeapReport {
    /// Whether the check found no anomalies
    pub fn is_consistent(&self) -> bool {
        self.anomalies == 0
    }

    fn record(&mut self, anomaly: Anomaly, verbose: bool) {
        if verbose {
            log::warn!("{}", anomaly);
        }

        self.anomalies += 1;
        if self.first_anomaly.is_none() {
            self.first_anomaly = Some(anomaly);
        }
    }
}

impl<S> Allocator<S> {
    /// Checks the heap for consistency
    ///
    /// Walks every block from the sentinel to the epilogue, then the free list, and reports what
    /// doesn't add up. Validation always runs; with `verbose` every block and every anomaly is
    /// also logged. The check never modifies the heap.
    pub fn check_heap(&self, verbose: bool) -> HeapReport {
        let mut report = HeapReport::default();
        let start = self.start.as_ptr();
        let epilogue = self.size - consts::EPILOGUE_SIZE;

        if verbose {
            log::debug!("heap ({:p}, {} bytes):", start, self.size);
        }

        unsafe {
            let prologue = Tag::from_bits(util::read_word(start));
            if prologue != Tag::new(consts::PROLOGUE_SIZE, true) {
                report.record(Anomaly::BadPrologue, verbose);
            }

            let sentinel = self.sentinel();
            if sentinel.tag() != Tag::new(consts::MIN_BLOCK_SIZE, true)
                || sentinel.prev_free().is_some()
            {
                report.record(Anomaly::BadSentinel, verbose);
            }

            // walk the heap
            let mut offset = consts::SENTINEL_OFFSET as usize;
            let mut prev_free = false;
            while offset < epilogue {
                let block = Block::from_header(start.add(offset));
                let tag = block.tag();
                let size = tag.size();

                if size == 0 {
                    // premature epilogue; reported below
                    break;
                }

                if size % consts::ALIGN_SIZE != 0 {
                    // can't find the next header from here
                    report.record(Anomaly::BadSize { offset, size }, verbose);
                    break;
                }

                if size > epilogue - offset {
                    report.record(Anomaly::OutOfBounds { offset }, verbose);
                    break;
                }

                report.blocks += 1;

                let footer = block.footer_tag();
                if verbose {
                    log::debug!("{:#x}: header: {:?} footer: {:?}", offset, tag, footer);
                }

                if size < consts::MIN_BLOCK_SIZE {
                    report.record(Anomaly::BadSize { offset, size }, verbose);
                }

                if block.payload() as usize % consts::ALIGN_SIZE != 0 {
                    report.record(Anomaly::Misaligned { offset }, verbose);
                }

                if footer != tag {
                    report.record(Anomaly::TagMismatch { offset }, verbose);
                }

                let free = !tag.is_allocated();
                if free {
                    report.free_blocks += 1;
                    report.free_bytes += size;

                    if prev_free {
                        report.record(Anomaly::AdjacentFree { offset }, verbose);
                    }
                }
                prev_free = free;

                offset += size;
            }

            if verbose && offset == epilogue {
                log::debug!("{:#x}: EOL", offset);
            }

            if offset != epilogue
                || Tag::from_bits(util::read_word(start.add(epilogue))) != Tag::new(0, true)
            {
                report.record(Anomaly::BadEpilogue { offset }, verbose);
            }

            // walk the free list
            let limit = self.size / consts::MIN_BLOCK_SIZE;
            let mut prev: Offset = SENTINEL;
            let mut next = sentinel.next_free();
            while let Some(node) = next {
                let at = node.get() as usize;
                if at % consts::ALIGN_SIZE != 0
                    || at + consts::MIN_BLOCK_SIZE > epilogue
                    || report.listed >= limit
                {
                    report.record(
                        Anomaly::BrokenLink {
                            offset: prev.get() as usize,
                        },
                        verbose,
                    );
                    break;
                }

                let fb = self.node(node);
                report.listed += 1;

                if fb.is_allocated() {
                    report.record(Anomaly::AllocatedInFreeList { offset: at }, verbose);
                }

                if fb.prev_free() != Some(prev) {
                    report.record(Anomaly::BrokenLink { offset: at }, verbose);
                }

                prev = node;
                next = fb.next_free();
            }

            if report.listed != report.free_blocks {
                report.record(
                    Anomaly::FreeListMismatch {
                        listed: report.listed,
                        free: report.free_blocks,
                    },
                    verbose,
                );
            }
        }

        report
    }
}
