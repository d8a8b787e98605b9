//! Shared heap behind the tables.
//!
//! Blocks are addressed by their offset from the start of the heap so every
//! participant can resolve them in its own mapping. Allocation bumps a shared
//! top pointer; only the most recent block can be given back.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{ArenaError, ArenaResult};

const ALIGN: u64 = 16;
/// Offset zero is kept free so that a zero root means "unset".
const RESERVED: u64 = ALIGN;

/// A block carved out of a [`ShmPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShmBlock {
    pub offset: u64,
    pub len: usize,
}

/// Allocation interface over world-shared memory.
pub trait ShmPool {
    fn alloc(&self, len: usize) -> ArenaResult<ShmBlock>;

    /// Gives `block` back; returns whether the space became reusable.
    fn free(&self, block: ShmBlock) -> bool;

    fn capacity(&self) -> usize;

    fn used(&self) -> usize;
}

/// Bump allocator over the heap area of an arena.
#[derive(Clone, Copy)]
pub struct SharedHeap<'a> {
    pub(crate) top: &'a AtomicU64,
    pub(crate) capacity: usize,
}

fn place(top: u64) -> u64 {
    (top.max(RESERVED) + ALIGN - 1) & !(ALIGN - 1)
}

impl ShmPool for SharedHeap<'_> {
    fn alloc(&self, len: usize) -> ArenaResult<ShmBlock> {
        if len == 0 {
            return Err(ArenaError::Invalid("zero-sized allocation"));
        }
        let capacity = self.capacity as u64;
        self.top
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |top| {
                place(top)
                    .checked_add(len as u64)
                    .filter(|end| *end <= capacity)
            })
            .map(|previous| ShmBlock {
                offset: place(previous),
                len,
            })
            .map_err(|top| ArenaError::HeapExhausted {
                requested: len,
                available: capacity.saturating_sub(place(top)) as usize,
            })
    }

    fn free(&self, block: ShmBlock) -> bool {
        let end = block.offset + block.len as u64;
        self.top
            .compare_exchange(end, block.offset, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn used(&self) -> usize {
        self.top.load(Ordering::Acquire).max(RESERVED) as usize
    }
}
