//! The allocation engine.
//!
//! ## [`Allocator`](struct.Allocator.html)
//!
//! An `Allocator` owns a chain of blocks over memory obtained from a
//! [`PageProvider`](../pages/trait.PageProvider.html), and serves
//! `allocate` / `release` requests from it under a placement
//! [`Strategy`](../search/enum.Strategy.html).
//!
//! It is single-threaded: every call runs to completion and nothing inside is
//! synchronized. [`global`](../global/index.html) wraps one instance in a lock
//! for the process-wide `t_*` functions.
//!
//! Memory is never returned to the provider: the managed space only grows.

use core::fmt;
use core::ptr::NonNull;
use std::collections::BTreeSet;

use crate::blocklist::{Block, BlockList, ALIGNMENT, HEADER_SIZE};
#[cfg(feature = "gc")]
use crate::collector::CollectorPhase;
use crate::pages::PageProvider;
use crate::search::Strategy;
use crate::stats::{Stats, Validity};

// Round up value to the nearest multiple of increment. None if that multiple
// does not fit in a usize.
pub(crate) fn round_up(value: usize, increment: usize) -> Option<usize> {
    Some(value.checked_add(increment - 1)? / increment * increment)
}

/// Why `allocate` could not hand out memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError<E> {
    /// The request, once aligned and given a header, does not fit in the
    /// address space.
    TooLarge(usize),
    /// The provider could not map more pages.
    Pages(E),
}

impl<E> From<E> for AllocError<E> {
    fn from(err: E) -> Self {
        AllocError::Pages(err)
    }
}

impl<E: fmt::Display> fmt::Display for AllocError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::TooLarge(size) => write!(f, "request of {} bytes is too large", size),
            AllocError::Pages(err) => write!(f, "could not map pages: {}", err),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for AllocError<E> {}

/// A caller misused `release`. The allocator is left exactly as it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseError {
    /// The address is not the start of any block this allocator handed out.
    /// This includes free blocks that were never allocated, such as the
    /// remainder of a split.
    NotOwned(usize),
    /// The address was handed out and released, and has not been handed out
    /// again since.
    DoubleFree(usize),
}

impl fmt::Display for ReleaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseError::NotOwned(addr) => {
                write!(f, "pointer {:#x} not owned by this allocator", addr)
            }
            ReleaseError::DoubleFree(addr) => write!(f, "pointer {:#x} released twice", addr),
        }
    }
}

impl std::error::Error for ReleaseError {}

/// A block-list allocator over page-granular memory.
pub struct Allocator<P> {
    provider: P,
    pub(crate) blocks: BlockList,
    strategy: Strategy,
    page_size: usize,
    // Usable bytes of every used block.
    pub(crate) requested_size: usize,
    // Every byte obtained from the provider.
    total_size: usize,
    // Bytes taken by headers.
    pub(crate) overhead: usize,
    // Data addresses released since they were last handed out.
    pub(crate) released: BTreeSet<usize>,
    #[cfg(feature = "gc")]
    pub(crate) phase: CollectorPhase,
}

// Everything the chain points to is owned by the allocator, so it can move
// between threads as long as its provider can.
unsafe impl<P: Send> Send for Allocator<P> {}

impl<P: PageProvider> Allocator<P> {
    /// Create an allocator, mapping its first page and seeding the chain with
    /// one free block spanning it.
    ///
    /// # Panics
    ///
    /// Panics if the provider's page size is not a multiple of `ALIGNMENT`,
    /// or too small to hold a header and a minimal block.
    pub fn new(strategy: Strategy, provider: P) -> Result<Self, P::Err> {
        let page_size = provider.page_size();
        assert!(
            page_size % ALIGNMENT == 0 && page_size >= HEADER_SIZE + ALIGNMENT,
            "Unusable page size {}",
            page_size
        );

        let mut allocator = Allocator {
            provider,
            blocks: BlockList::default(),
            strategy,
            page_size,
            requested_size: 0,
            total_size: 0,
            overhead: 0,
            released: BTreeSet::new(),
            #[cfg(feature = "gc")]
            phase: CollectorPhase::Idle,
        };
        allocator.map_region(page_size)?;
        log::debug!(
            "Initialized {} allocator with {} byte pages",
            strategy,
            page_size
        );

        Ok(allocator)
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// The chain of blocks, in chain order.
    pub fn blocks(&self) -> &BlockList {
        &self.blocks
    }

    // Map `len` bytes and append them to the chain as one free block.
    fn map_region(&mut self, len: usize) -> Result<Block, P::Err> {
        let ptr = unsafe { self.provider.map_pages(len)? };
        let block = unsafe { self.blocks.push_region(ptr, len) };
        self.total_size += len;
        self.overhead += HEADER_SIZE;
        Ok(block)
    }

    // The usable size for a request, and the whole pages a new region would
    // need to hold it.
    fn request_sizes(&self, size: usize) -> Option<(usize, usize)> {
        let aligned_size = round_up(size, ALIGNMENT)?;
        let len = round_up(aligned_size.checked_add(HEADER_SIZE)?, self.page_size)?;
        Some((aligned_size, len))
    }

    /// Grow the managed space by `len` bytes to hold a block of
    /// `aligned_size` usable bytes, returning that new free block.
    fn grow(&mut self, aligned_size: usize, len: usize) -> Result<Block, P::Err> {
        log::debug!("Growing by {} bytes for a {} byte block", len, aligned_size);

        let block = self.map_region(len)?;
        debug_assert!(block.size() >= aligned_size);
        Ok(block)
    }

    /// Allocate at least `size` bytes, aligned to `ALIGNMENT`.
    ///
    /// Returns `Ok(None)` for a zero-byte request, without touching anything.
    /// If no free block fits, the managed space grows; a failure to map that
    /// memory is returned as the provider's error. Requests too large to
    /// round up are rejected before anything is searched or mapped.
    ///
    /// The contents of the returned memory are unspecified.
    pub fn allocate(&mut self, size: usize) -> Result<Option<NonNull<u8>>, AllocError<P::Err>> {
        if size == 0 {
            return Ok(None);
        }
        let (aligned_size, len) = self
            .request_sizes(size)
            .ok_or(AllocError::TooLarge(size))?;

        let block = match self.blocks.find_free_block(aligned_size, self.strategy) {
            Some(block) => block,
            None => self.grow(aligned_size, len)?,
        };

        // Only split when the rest can stand alone as a free block; otherwise
        // the slack stays inside this allocation.
        if self.blocks.split(block, aligned_size).is_some() {
            self.overhead += HEADER_SIZE;
        }

        block.set_free(false);
        self.requested_size += block.size();
        self.forget_released(block);
        log::trace!("Allocated {:?} for {} bytes", block, size);

        Ok(Some(block.data()))
    }

    /// Release memory previously returned by `allocate`. A null pointer is
    /// ignored.
    ///
    /// The freed block is merged with its free neighbors. Pointers that were
    /// never handed out, or were already released, are rejected without
    /// changing anything.
    pub fn release(&mut self, ptr: *mut u8) -> Result<(), ReleaseError> {
        if ptr.is_null() {
            return Ok(());
        }

        let addr = ptr as usize;
        // Released memory may have been merged into a neighbor since, so
        // the address is looked up rather than the block.
        let block = match self.blocks.find_data(ptr) {
            Some(block) if !block.is_free() => block,
            _ if self.released.contains(&addr) => return Err(ReleaseError::DoubleFree(addr)),
            _ => return Err(ReleaseError::NotOwned(addr)),
        };

        block.set_free(true);
        self.requested_size -= block.size();
        self.released.insert(addr);

        let (merged, merges) = self.blocks.coalesce(block);
        self.overhead -= merges * HEADER_SIZE;
        log::trace!("Released {:?} into {:?}", ptr, merged);

        Ok(())
    }

    // Addresses inside a block that is handed out again are no longer stale.
    fn forget_released(&mut self, block: Block) {
        let stale: Vec<usize> = self
            .released
            .range(block.as_range())
            .copied()
            .collect();
        for addr in stale {
            self.released.remove(&addr);
        }
    }

    /// Current counters, plus a validation of the whole chain.
    pub fn stats(&self) -> (Validity, Stats) {
        let (mut validity, survey) = self.blocks.survey();

        let stats = Stats {
            page_size: self.page_size,
            total_size: self.total_size,
            requested_size: self.requested_size,
            overhead: self.overhead,
            blocks: survey.blocks,
            free_blocks: survey.free_blocks,
            free_size: survey.free_size,
        };

        if survey.spanned != self.total_size {
            validity.accounting_errors += 1;
        }
        if survey.used_size != self.requested_size {
            validity.accounting_errors += 1;
        }
        if survey.blocks * HEADER_SIZE != self.overhead {
            validity.accounting_errors += 1;
        }
        if self.requested_size > self.total_size {
            validity.accounting_errors += 1;
        }

        (validity, stats)
    }

    /// Percentage of mapped memory handed out to callers.
    pub fn usage(&self) -> f64 {
        self.requested_size as f64 / self.total_size as f64 * 100.0
    }

    /// Percentage of mapped memory taken by headers.
    pub fn overhead_usage(&self) -> f64 {
        self.overhead as f64 / self.total_size as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use core::ptr::null_mut;

    use test_log::test;

    use crate::pages::{MmapPages, ToyHeap, ToyHeapExhausted};

    fn toy(strategy: Strategy) -> Allocator<ToyHeap> {
        Allocator::new(strategy, ToyHeap::new(256, 64 * 1024)).unwrap()
    }

    fn check(allocator: &Allocator<ToyHeap>) -> Stats {
        let (validity, stats) = allocator.stats();
        log::info!("Blocks: {}", allocator.blocks());
        assert!(validity.is_valid(), "{:?}", validity);
        stats
    }

    fn alloc(allocator: &mut Allocator<ToyHeap>, size: usize) -> *mut u8 {
        allocator.allocate(size).unwrap().unwrap().as_ptr()
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 4), Some(0));
        assert_eq!(round_up(1, 4), Some(4));
        assert_eq!(round_up(4, 4), Some(4));
        assert_eq!(round_up(4097, 4096), Some(8192));
        assert_eq!(round_up(usize::MAX - 3, 4), Some(usize::MAX - 3));
        assert_eq!(round_up(usize::MAX - 2, 4), None);
        assert_eq!(round_up(usize::MAX, 4096), None);
    }

    #[test]
    fn test_init() {
        let allocator = toy(Strategy::FirstFit);
        let stats = check(&allocator);
        assert_eq!(stats.total_size, 256);
        assert_eq!(stats.requested_size, 0);
        assert_eq!(stats.overhead, HEADER_SIZE);
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.free_size, 256 - HEADER_SIZE);
        assert_eq!(allocator.usage(), 0.0);
    }

    #[test]
    fn test_zero_size() {
        let mut allocator = toy(Strategy::BestFit);
        assert_eq!(allocator.allocate(0).unwrap(), None);
        let stats = check(&allocator);
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.requested_size, 0);
    }

    #[test]
    fn test_alignment_and_capacity() {
        let mut allocator = toy(Strategy::FirstFit);
        let base = allocator.provider().base() as usize;

        let mut pointers = Vec::new();
        for size in 1..=40 {
            let ptr = alloc(&mut allocator, size);
            assert_eq!((ptr as usize - base) % ALIGNMENT, 0);
            // Fill every requested byte; no header may be disturbed.
            unsafe { core::ptr::write_bytes(ptr, 0xA5, size) };
            pointers.push((ptr, size));
            check(&allocator);
        }

        for &(ptr, size) in &pointers {
            let bytes = unsafe { core::slice::from_raw_parts(ptr, size) };
            assert!(bytes.iter().all(|&b| b == 0xA5));
        }
    }

    #[test]
    fn test_split_and_slack() {
        let mut allocator = toy(Strategy::FirstFit);

        let a = alloc(&mut allocator, 10);
        let block = allocator.blocks().find_data(a).unwrap();
        assert_eq!(block.size(), 12);
        let stats = check(&allocator);
        assert_eq!(stats.blocks, 2);
        assert_eq!(stats.requested_size, 12);

        // Leave a remainder too small to hold a header plus the minimum
        // block: it is absorbed instead of split off.
        let rest = allocator.blocks().tail().unwrap().size();
        let b = alloc(&mut allocator, rest - HEADER_SIZE);
        let block = allocator.blocks().find_data(b).unwrap();
        assert_eq!(block.size(), rest);
        let stats = check(&allocator);
        assert_eq!(stats.blocks, 2);
        assert_eq!(stats.free_blocks, 0);
        assert_eq!(stats.requested_size, 12 + rest);
    }

    #[test]
    fn test_growth() {
        let mut allocator = toy(Strategy::FirstFit);

        // Bigger than a page: the new region is rounded up to whole pages.
        let big = alloc(&mut allocator, 600);
        let stats = check(&allocator);
        assert_eq!(stats.total_size, 256 + round_up(600 + HEADER_SIZE, 256).unwrap());
        let block = allocator.blocks().find_data(big).unwrap();
        assert!(block.is_region_start());
        assert_eq!(block.prev(), allocator.blocks().head());

        // The first page is still used for small requests.
        let small = alloc(&mut allocator, 16);
        assert_eq!(Some(allocator.blocks().find_data(small).unwrap()), allocator.blocks().head());
        check(&allocator);
    }

    #[test]
    fn test_exhaustion() {
        let mut allocator = Allocator::new(Strategy::FirstFit, ToyHeap::new(256, 512)).unwrap();
        let err = allocator.allocate(1024).unwrap_err();
        assert_eq!(
            err,
            AllocError::Pages(ToyHeapExhausted {
                requested: round_up(1024 + HEADER_SIZE, 256).unwrap(),
                available: 256,
            })
        );
        // A failed growth changes nothing.
        let stats = check(&allocator);
        assert_eq!(stats.total_size, 256);
        assert_eq!(stats.blocks, 1);
    }

    #[test]
    fn test_coalescing() {
        let mut allocator = toy(Strategy::FirstFit);
        let a = alloc(&mut allocator, 32);
        let b = alloc(&mut allocator, 32);
        let c = alloc(&mut allocator, 32);
        let block_a = allocator.blocks().find_data(a).unwrap();
        let block_c = allocator.blocks().find_data(c).unwrap();

        allocator.release(b).unwrap();
        check(&allocator);
        allocator.release(a).unwrap();
        check(&allocator);

        // A and B are now one free block, right before C.
        let merged = allocator.blocks().head().unwrap();
        assert_eq!(merged, block_a);
        assert!(merged.is_free());
        assert_eq!(merged.size(), 32 + HEADER_SIZE + 32);
        assert_eq!(merged.next(), Some(block_c));
        assert_eq!(block_c.prev(), Some(merged));

        // Releasing C merges on both sides, back to a single block.
        allocator.release(c).unwrap();
        let stats = check(&allocator);
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.overhead, HEADER_SIZE);
        assert_eq!(stats.requested_size, 0);
    }

    #[test]
    fn test_no_merge_across_regions() {
        let mut allocator = toy(Strategy::FirstFit);
        let first_page = allocator.blocks().head().unwrap().size();
        let a = alloc(&mut allocator, first_page);
        // ToyHeap maps the next region right after the first.
        let b = alloc(&mut allocator, 100);

        allocator.release(b).unwrap();
        allocator.release(a).unwrap();
        let stats = check(&allocator);
        assert_eq!(stats.blocks, 2);
        assert_eq!(stats.free_blocks, 2);
    }

    #[test]
    fn test_release_errors() {
        let mut allocator = toy(Strategy::FirstFit);
        let a = alloc(&mut allocator, 16);
        let b = alloc(&mut allocator, 16);
        let _c = alloc(&mut allocator, 16);

        assert_eq!(allocator.release(null_mut()), Ok(()));

        let mut local = 0u8;
        let foreign = &mut local as *mut u8;
        assert_eq!(
            allocator.release(foreign),
            Err(ReleaseError::NotOwned(foreign as usize))
        );
        let interior = unsafe { a.add(4) };
        assert_eq!(
            allocator.release(interior),
            Err(ReleaseError::NotOwned(interior as usize))
        );

        allocator.release(a).unwrap();
        let (_, before) = allocator.stats();
        let chain_before = allocator.blocks().to_string();

        assert_eq!(allocator.release(a), Err(ReleaseError::DoubleFree(a as usize)));
        let (validity, after) = allocator.stats();
        assert!(validity.is_valid());
        assert_eq!(before, after);
        assert_eq!(chain_before, allocator.blocks().to_string());

        // B merges into A's block; B's address now points inside free memory.
        allocator.release(b).unwrap();
        assert_eq!(allocator.release(b), Err(ReleaseError::DoubleFree(b as usize)));
        check(&allocator);
    }

    #[test]
    fn test_oversized_requests() {
        let mut allocator = toy(Strategy::FirstFit);
        let (_, before) = allocator.stats();

        for &size in &[usize::MAX, usize::MAX - 2, usize::MAX - 8, usize::MAX - 255] {
            assert_eq!(allocator.allocate(size), Err(AllocError::TooLarge(size)));
        }
        let err = allocator.allocate(usize::MAX).unwrap_err();
        assert!(err.to_string().contains("too large"), "{}", err);

        // Nothing was searched, split or mapped.
        let after = check(&allocator);
        assert_eq!(before, after);
        assert_eq!(allocator.provider().size(), 256);
    }

    #[test]
    fn test_unallocated_free_block_is_not_owned() {
        let mut allocator = toy(Strategy::FirstFit);
        let a = alloc(&mut allocator, 16);
        // The remainder split off after A has never been handed out.
        let rest = allocator.blocks().tail().unwrap();
        assert!(rest.is_free());
        let rest_ptr = rest.data().as_ptr();
        assert_eq!(
            allocator.release(rest_ptr),
            Err(ReleaseError::NotOwned(rest_ptr as usize))
        );

        // Once released, A's address is a double free until handed out again.
        allocator.release(a).unwrap();
        assert_eq!(allocator.release(a), Err(ReleaseError::DoubleFree(a as usize)));
        let again = alloc(&mut allocator, 16);
        assert_eq!(again, a);
        allocator.release(again).unwrap();

        // Reusing the space at a different layout forgets old addresses
        // inside the new block, and they are foreign while it is in use.
        let b = alloc(&mut allocator, 8);
        let c = alloc(&mut allocator, 8);
        allocator.release(c).unwrap();
        allocator.release(b).unwrap();
        let big = alloc(&mut allocator, 64);
        assert_eq!(big, b);
        assert_eq!(allocator.release(c), Err(ReleaseError::NotOwned(c as usize)));
        allocator.release(big).unwrap();
        assert_eq!(allocator.release(c), Err(ReleaseError::NotOwned(c as usize)));
        assert_eq!(allocator.release(big), Err(ReleaseError::DoubleFree(big as usize)));
        check(&allocator);
    }

    #[test]
    fn test_strategies_pick_different_blocks() {
        for &strategy in &[Strategy::FirstFit, Strategy::BestFit, Strategy::WorstFit] {
            let mut allocator = toy(strategy);
            let large = alloc(&mut allocator, 40);
            let _sep1 = alloc(&mut allocator, 4);
            let small = alloc(&mut allocator, 12);
            let _sep2 = alloc(&mut allocator, 4);
            // Fill the rest of the first page so growth is the only other option.
            let rest = allocator.blocks().tail().unwrap().size();
            let _rest = alloc(&mut allocator, rest);

            allocator.release(large).unwrap();
            allocator.release(small).unwrap();
            let stats = check(&allocator);
            assert_eq!(stats.free_blocks, 2);

            let expected = match strategy {
                Strategy::FirstFit => large,
                Strategy::BestFit => small,
                Strategy::WorstFit => large,
            };
            assert_eq!(alloc(&mut allocator, 10), expected, "{}", strategy);
            let stats = check(&allocator);
            assert_eq!(stats.total_size, 256);
        }
    }

    #[test]
    fn test_mmap_allocator() {
        let mut allocator = Allocator::new(Strategy::BestFit, MmapPages::new()).unwrap();
        let page_size = allocator.page_size();

        let small = allocator.allocate(20).unwrap().unwrap();
        unsafe { core::ptr::copy_nonoverlapping(b"Hello, World!\0".as_ptr(), small.as_ptr(), 14) };
        let big = allocator.allocate(3 * page_size).unwrap().unwrap();
        unsafe { core::ptr::write_bytes(big.as_ptr(), 0xFF, 3 * page_size) };

        let (validity, stats) = allocator.stats();
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(
            stats.total_size,
            page_size + round_up(3 * page_size + HEADER_SIZE, page_size).unwrap()
        );
        assert_eq!(allocator.provider().growths(), 2);

        let greeting = unsafe { core::slice::from_raw_parts(small.as_ptr(), 13) };
        assert_eq!(greeting, b"Hello, World!");

        allocator.release(big.as_ptr()).unwrap();
        allocator.release(small.as_ptr()).unwrap();
        let (validity, stats) = allocator.stats();
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(stats.requested_size, 0);
        // Pages are never given back.
        assert_eq!(stats.blocks, 2);
    }
}
