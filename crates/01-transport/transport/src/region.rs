//! Memory regions shared between the participants of a world.
//!
//! A region is either an anonymous mapping (single-process worlds, rings) or
//! a mapping of a file on a tmpfs-like mount, which is how unrelated processes
//! end up looking at the same bytes. Heap allocation is the fallback when an
//! anonymous mapping cannot honour the requested alignment.

use crate::{TransportError, TransportResult};
use std::alloc::{alloc, alloc_zeroed, dealloc, Layout};
use std::fs::File;
use std::ptr::{self, NonNull};

/// Specifies how memory in a [`SharedRegion`] should be initialised.
#[derive(Clone, Copy, Debug)]
pub enum RegionInit {
    /// Zero the entire region after allocation.
    Zeroed,
    /// Leave the region uninitialised.
    Uninitialized,
}

#[derive(Debug)]
enum Backing {
    Mapped(memmap2::MmapMut),
    Owned { ptr: NonNull<u8>, layout: Layout },
}

impl Backing {
    fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            Backing::Mapped(map) => map.as_mut_ptr(),
            Backing::Owned { ptr, .. } => ptr.as_ptr(),
        }
    }

    fn as_ptr(&self) -> *const u8 {
        match self {
            Backing::Mapped(map) => map.as_ptr(),
            Backing::Owned { ptr, .. } => ptr.as_ptr(),
        }
    }
}

/// Contiguous, aligned memory that may be visible to other processes.
#[derive(Debug)]
pub struct SharedRegion {
    len: usize,
    alignment: usize,
    file_backed: bool,
    backing: Backing,
}

// SAFETY: the region owns its mapping/allocation; concurrent access to the
// bytes is coordinated by the structures placed inside it (atomics, locks).
unsafe impl Send for SharedRegion {}
// SAFETY: as above, shared references only hand out raw pointers.
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Allocates a private region of `len` bytes aligned to `alignment`.
    ///
    /// An anonymous mapping is tried first. If its address is not suitably
    /// aligned the heap is used instead.
    pub fn anonymous(len: usize, alignment: usize, init: RegionInit) -> TransportResult<Self> {
        if alignment == 0 || !alignment.is_power_of_two() || len == 0 {
            return Err(TransportError::AllocationFailed {
                size: len,
                alignment,
            });
        }

        if let Some(backing) = Self::mmap_backed(len, alignment, init)? {
            return Ok(Self {
                len,
                alignment,
                file_backed: false,
                backing,
            });
        }

        Self::heap_backed(len, alignment, init)
    }

    /// Maps the first `len` bytes of `file` read-write and shared.
    ///
    /// The file must already be at least `len` bytes long.
    pub fn map_file(file: &File, len: usize) -> TransportResult<Self> {
        // SAFETY: the mapping is shared with other processes by design; every
        // structure placed inside it is accessed through atomics or raw
        // pointers, never through long-lived Rust references to plain data.
        let map = unsafe { memmap2::MmapOptions::new().len(len).map_mut(file)? };
        Ok(Self {
            len,
            alignment: page_size(),
            file_backed: true,
            backing: Backing::Mapped(map),
        })
    }

    fn heap_backed(len: usize, alignment: usize, init: RegionInit) -> TransportResult<Self> {
        let layout = Layout::from_size_align(len, alignment).map_err(|_| {
            TransportError::AllocationFailed {
                size: len,
                alignment,
            }
        })?;

        // SAFETY: layout has a non-zero size (checked by the caller).
        let ptr = unsafe {
            match init {
                RegionInit::Zeroed => alloc_zeroed(layout),
                RegionInit::Uninitialized => alloc(layout),
            }
        };

        let ptr = NonNull::new(ptr).ok_or(TransportError::AllocationFailed {
            size: len,
            alignment,
        })?;
        Ok(Self {
            len,
            alignment,
            file_backed: false,
            backing: Backing::Owned { ptr, layout },
        })
    }

    fn mmap_backed(
        len: usize,
        alignment: usize,
        init: RegionInit,
    ) -> TransportResult<Option<Backing>> {
        let mut map = memmap2::MmapOptions::new()
            .len(len)
            .map_anon()
            .map_err(|_| TransportError::AllocationFailed {
                size: len,
                alignment,
            })?;

        let ptr = map.as_mut_ptr();
        if ptr as usize % alignment != 0 {
            return Ok(None);
        }

        if matches!(init, RegionInit::Zeroed) {
            // SAFETY: the anonymous mapping exposes `len` writable bytes.
            unsafe { ptr::write_bytes(ptr, 0, len) };
        }

        Ok(Some(Backing::Mapped(map)))
    }

    /// Total number of bytes managed by this region.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true when the region has zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the alignment the region was allocated with.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// True when the bytes live in a file other processes can map.
    pub fn is_file_backed(&self) -> bool {
        self.file_backed
    }

    /// Borrow the region as a const pointer.
    pub fn as_ptr(&self) -> *const u8 {
        self.backing.as_ptr()
    }

    /// Borrow the region as a mut pointer.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.backing.as_mut_ptr()
    }

    /// View the full region as an immutable slice.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the backing covers `len` initialised bytes for `&self`.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    /// View the full region as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: unique borrow of the backing for the returned lifetime.
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), self.len) }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Backing::Owned { ptr, layout } = &self.backing {
            // SAFETY: allocated in `heap_backed` with exactly this layout.
            unsafe {
                dealloc(ptr.as_ptr(), *layout);
            }
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}
