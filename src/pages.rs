//! Sources of page-granular memory for the allocator.

use core::fmt;
use core::ptr::{null_mut, NonNull};

use errno::Errno;

use crate::blocklist::ALIGNMENT;

pub trait PageProvider {
    type Err: fmt::Display;

    /// The granularity of every mapping, in bytes.
    fn page_size(&self) -> usize;

    /// Map `len` fresh bytes of read/write memory.
    ///
    /// # Safety
    ///
    /// `len` must be a non-zero multiple of `page_size()`.
    ///
    /// On success, the returned memory is `ALIGNMENT`-aligned, at least `len`
    /// bytes long, and untracked by any other Rust code, including the
    /// allocator itself. It is never unmapped while the provider is alive.
    unsafe fn map_pages(&mut self, len: usize) -> Result<NonNull<u8>, Self::Err>;
}

/// MmapPages uses anonymous private mappings from the OS.
#[derive(Debug)]
pub struct MmapPages {
    page_size: usize,
    // Just for tracking, not really needed
    pages: usize,
    growths: usize,
}

impl Default for MmapPages {
    fn default() -> Self {
        Self::new()
    }
}

impl MmapPages {
    /// Queries the page size from the OS, once.
    pub fn new() -> Self {
        MmapPages {
            page_size: sysconf::page::pagesize(),
            pages: 0,
            growths: 0,
        }
    }

    /// Number of pages mapped so far.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Number of successful mappings so far.
    pub fn growths(&self) -> usize {
        self.growths
    }
}

impl PageProvider for MmapPages {
    type Err = Errno;

    fn page_size(&self) -> usize {
        self.page_size
    }

    unsafe fn map_pages(&mut self, len: usize) -> Result<NonNull<u8>, Errno> {
        let ptr = libc::mmap(
            // Address we want the memory at. We don't care, so null it is.
            null_mut(),
            len,
            libc::PROT_WRITE | libc::PROT_READ,
            // MAP_ANON: no file behind it. MAP_PRIVATE: not shared with any
            // other process.
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return Err(errno::errno());
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or(Errno(libc::ENOMEM))?;

        self.pages += len / self.page_size;
        self.growths += 1;
        log::debug!("Mapped {} bytes at {:?}", len, ptr);

        Ok(ptr)
    }
}

/// A fixed arena that can pretend to be the OS, handing out "pages" from one
/// buffer. It is mainly useful for testing.
///
/// Consecutive mappings are contiguous, which the OS never promises; the
/// allocator must not rely on it either way.
pub struct ToyHeap {
    page_size: usize,
    size: usize,
    // u64 storage keeps the base aligned, and the heap allocation keeps
    // handed-out pointers stable when the ToyHeap itself moves.
    heap: Vec<u64>,
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap::new(256, 256 * 1024)
    }
}

impl ToyHeap {
    /// A heap of `capacity` bytes, handed out in multiples of `page_size`.
    pub fn new(page_size: usize, capacity: usize) -> Self {
        assert!(
            page_size > 0 && page_size % ALIGNMENT == 0,
            "page size {} must be a positive multiple of {}",
            page_size,
            ALIGNMENT
        );
        ToyHeap {
            page_size,
            size: 0,
            heap: vec![0; (capacity + 7) / 8],
        }
    }

    /// Bytes handed out so far.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.heap.len() * 8
    }

    /// Address of the first byte of the arena.
    pub fn base(&self) -> *const u8 {
        self.heap.as_ptr() as *const u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToyHeapExhausted {
    pub requested: usize,
    pub available: usize,
}

impl fmt::Display for ToyHeapExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "toy heap exhausted: {} bytes requested, {} available",
            self.requested, self.available
        )
    }
}

impl std::error::Error for ToyHeapExhausted {}

impl PageProvider for ToyHeap {
    type Err = ToyHeapExhausted;

    fn page_size(&self) -> usize {
        self.page_size
    }

    unsafe fn map_pages(&mut self, len: usize) -> Result<NonNull<u8>, Self::Err> {
        let available = self.capacity() - self.size;
        if len > available {
            return Err(ToyHeapExhausted {
                requested: len,
                available,
            });
        }

        let ptr = (self.heap.as_mut_ptr() as *mut u8).add(self.size);
        self.size += len;
        Ok(NonNull::new_unchecked(ptr))
    }
}
