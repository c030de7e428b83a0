//! A conservative mark-and-sweep collector over the block chain.
//!
//! Any word that happens to hold an address inside the usable memory of a
//! used block keeps that block alive. Roots are supplied by the caller as a
//! plain sequence of words, or read from the current thread's stack with
//! [`stack_roots`]. Blocks kept alive are scanned in turn, so memory reachable
//! only through other managed memory survives as well.
//!
//! This over-approximates: integers that alias a block keep it alive too. It
//! never reclaims a block reachable from the roots.

use core::mem;
use core::ops::Range;
use core::ptr;

use crate::allocators::Allocator;
use crate::blocklist::{Block, ALIGNMENT, HEADER_SIZE};
use crate::pages::PageProvider;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CollectorPhase {
    Idle,
    Marking,
    Sweeping,
}

/// What one collection did.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CollectReport {
    /// Root words examined.
    pub roots: usize,
    /// Used blocks found reachable.
    pub marked: usize,
    /// Used blocks freed.
    pub reclaimed: usize,
    /// Usable bytes freed.
    pub reclaimed_bytes: usize,
}

// Used blocks sorted by data address, for looking up candidate pointers.
struct Spans {
    spans: Vec<(Range<usize>, Block)>,
}

impl Spans {
    fn of_used<I: Iterator<Item = Block>>(blocks: I) -> Spans {
        let mut spans: Vec<_> = blocks
            .filter(|block| !block.is_free())
            .map(|block| (block.data_range(), block))
            .collect();
        // Regions may have been mapped anywhere, so chain order is not
        // address order.
        spans.sort_unstable_by_key(|(range, _)| range.start);
        Spans { spans }
    }

    fn find(&self, word: usize) -> Option<Block> {
        let idx = self.spans.partition_point(|(range, _)| range.start <= word);
        let (range, block) = self.spans.get(idx.checked_sub(1)?)?;
        if range.contains(&word) {
            Some(*block)
        } else {
            None
        }
    }
}

impl<P: PageProvider> Allocator<P> {
    pub fn phase(&self) -> CollectorPhase {
        self.phase
    }

    /// Run a full collection treating each word of `roots` as a possible
    /// pointer. Every used block that is not reachable is freed, then the
    /// whole chain is coalesced.
    pub fn collect_with<I: IntoIterator<Item = usize>>(&mut self, roots: I) -> CollectReport {
        let mut report = CollectReport::default();

        self.phase = CollectorPhase::Marking;
        let spans = Spans::of_used(self.blocks().iter());
        let mut pending: Vec<Block> = Vec::new();
        let mark = |word: usize, report: &mut CollectReport, pending: &mut Vec<Block>| {
            if let Some(block) = spans.find(word) {
                if !block.is_marked() {
                    block.set_marked(true);
                    report.marked += 1;
                    pending.push(block);
                }
            }
        };

        for word in roots {
            report.roots += 1;
            mark(word, &mut report, &mut pending);
        }
        while let Some(block) = pending.pop() {
            for word in contents(block) {
                mark(word, &mut report, &mut pending);
            }
        }

        self.phase = CollectorPhase::Sweeping;
        let mut freed = 0;
        for block in self.blocks.iter() {
            if block.is_free() {
                continue;
            }
            if block.is_marked() {
                block.set_marked(false);
            } else {
                block.set_free(true);
                self.released.insert(block.data_range().start);
                report.reclaimed += 1;
                freed += block.size();
            }
        }
        report.reclaimed_bytes = freed;
        self.requested_size -= freed;

        let merges = self.blocks.coalesce_all();
        self.overhead -= merges * HEADER_SIZE;
        self.phase = CollectorPhase::Idle;

        log::debug!(
            "Collected: {} roots, {} live blocks, {} blocks ({} bytes) reclaimed, {} merges",
            report.roots,
            report.marked,
            report.reclaimed,
            report.reclaimed_bytes,
            merges
        );
        report
    }

    /// Run a full collection with the current thread's stack as the roots.
    ///
    /// Returns `None`, without collecting anything, if the bounds of the
    /// stack cannot be determined.
    #[cfg(target_os = "linux")]
    #[inline(never)]
    pub fn collect(&mut self) -> Option<CollectReport> {
        let roots = stack_roots()?;
        Some(self.collect_with(roots))
    }
}

// Every ALIGNMENT-aligned word inside a used block's usable memory.
fn contents(block: Block) -> impl Iterator<Item = usize> {
    let range = block.data_range();
    let word = mem::size_of::<usize>();
    let last = range.end.saturating_sub(word);
    (range.start..=last)
        .step_by(ALIGNMENT)
        // Used blocks lie in mapped memory owned by the allocator.
        .map(|addr| unsafe { ptr::read_unaligned(addr as *const usize) })
}

/// Every word between this call's frame and the top of the current thread's
/// stack.
#[cfg(target_os = "linux")]
#[inline(never)]
pub fn stack_roots() -> Option<Vec<usize>> {
    let marker = 0usize;
    let low = &marker as *const usize as usize;
    let high = stack_top()?;
    if high <= low {
        log::warn!("Stack top {:#x} is below the current frame {:#x}", high, low);
        return None;
    }

    let word = mem::size_of::<usize>();
    let mut roots = Vec::with_capacity((high - low) / word);
    let mut addr = low;
    while addr + word <= high {
        // Everything from the current frame to the top of the stack is mapped.
        roots.push(unsafe { ptr::read_volatile(addr as *const usize) });
        addr += word;
    }
    Some(roots)
}

#[cfg(target_os = "linux")]
fn stack_top() -> Option<usize> {
    unsafe {
        let mut attr: libc::pthread_attr_t = mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            log::warn!("pthread_getattr_np failed: {}", errno::errno());
            return None;
        }

        let mut addr: *mut libc::c_void = ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 {
            log::warn!("pthread_attr_getstack failed: {}", rc);
            return None;
        }

        Some(addr as usize + size)
    }
}
