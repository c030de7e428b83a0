use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ops::Range;
use core::ptr::{self, NonNull};

use static_assertions::const_assert;

/// Minimum alignment of every block address and every block size.
pub const ALIGNMENT: usize = 4;

/// The header prefixed to every block, free or used.
///
/// `size` is the usable size of the block: it never includes the header
/// itself. Headers live at 4-byte aligned addresses, which may be less than
/// the natural alignment of `Header`, so they are only ever read and written
/// as whole values through [`Block`].
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct Header {
    pub size: usize,
    pub next: Option<Block>,
    pub prev: Option<Block>,
    pub is_free: bool,
    /// Only ever set while a collection is in progress.
    pub is_marked: bool,
    /// Set on the first block of each mapped region. Nothing is ever merged
    /// into its predecessor across such a block.
    pub region_start: bool,
}

/// Space taken by a header in front of each block.
pub const HEADER_SIZE: usize = mem::size_of::<Header>();
const_assert!(HEADER_SIZE % ALIGNMENT == 0);

/// Smallest usable size worth splitting off as a new free block.
pub const MIN_SPLIT_REMAINDER: usize = ALIGNMENT;

/// An enum for easy comparison of blocks and their order
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Relation {
    Before,
    AdjacentBefore,
    Overlapping,
    AdjacentAfter,
    After,
}

/// A view of one block in managed memory.
///
/// All address arithmetic between headers and data happens here; the rest of
/// the crate only deals in `Block`s.
///
/// A `Block` is a plain pointer and is `Copy`. It stays meaningful as long as
/// the block it points to is part of a [`BlockList`]; once merged into a
/// neighbor, its header is just bytes inside another block.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Block {
    header: NonNull<Header>,
}

impl Block {
    /// Write `header` at `ptr` and return a view of the new block.
    ///
    /// # Safety
    ///
    /// `ptr` must be `ALIGNMENT`-aligned and point to at least
    /// `HEADER_SIZE + header.size` bytes owned by the allocator and not in use
    /// by any program logic.
    pub unsafe fn write(ptr: NonNull<u8>, header: Header) -> Block {
        debug_assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);
        let header_ptr: NonNull<Header> = ptr.cast();
        ptr::write_unaligned(header_ptr.as_ptr(), header);
        Block { header: header_ptr }
    }

    /// A copy of this block's header.
    pub fn header(&self) -> Header {
        // Blocks are only handed out by a BlockList, which keeps every header
        // it links to initialized.
        unsafe { ptr::read_unaligned(self.header.as_ptr()) }
    }

    fn update<F: FnOnce(&mut Header)>(&self, f: F) {
        let mut header = self.header();
        f(&mut header);
        unsafe { ptr::write_unaligned(self.header.as_ptr(), header) }
    }

    /// Address of the header.
    pub fn addr(&self) -> usize {
        self.header.as_ptr() as usize
    }

    /// The usable size of the block, in bytes.
    pub fn size(&self) -> usize {
        self.header().size
    }

    pub fn is_free(&self) -> bool {
        self.header().is_free
    }

    pub fn is_marked(&self) -> bool {
        self.header().is_marked
    }

    pub fn is_region_start(&self) -> bool {
        self.header().region_start
    }

    pub fn next(&self) -> Option<Block> {
        self.header().next
    }

    pub fn prev(&self) -> Option<Block> {
        self.header().prev
    }

    /// Pointer to the usable memory just past the header.
    pub fn data(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked((self.header.as_ptr() as *mut u8).add(HEADER_SIZE)) }
    }

    /// Address range of the usable memory.
    pub fn data_range(&self) -> Range<usize> {
        let start = self.addr() + HEADER_SIZE;
        start..start + self.size()
    }

    /// Address one past the last usable byte; where a following header would
    /// sit if the next block is contiguous.
    pub fn end(&self) -> usize {
        self.data_range().end
    }

    /// The whole span of this block, header included.
    pub fn as_range(&self) -> Range<usize> {
        self.addr()..self.end()
    }

    /// Whether `other` starts exactly where this block ends, inside the same
    /// region.
    pub fn is_adjacent_before(&self, other: &Block) -> bool {
        self.end() == other.addr() && !other.is_region_start()
    }

    /// Compare two blocks to see how they are ordered.
    pub fn relation(&self, other: &Block) -> Relation {
        let self_range = self.as_range();
        let other_range = other.as_range();

        if self_range.end < other_range.start {
            Relation::Before
        } else if self_range.end == other_range.start {
            Relation::AdjacentBefore
        } else if self_range.start < other_range.end {
            Relation::Overlapping
        } else if self_range.start == other_range.end {
            Relation::AdjacentAfter
        } else {
            Relation::After
        }
    }

    pub(crate) fn set_size(&self, size: usize) {
        self.update(|h| h.size = size)
    }

    pub(crate) fn set_free(&self, is_free: bool) {
        self.update(|h| h.is_free = is_free)
    }

    pub(crate) fn set_marked(&self, is_marked: bool) {
        self.update(|h| h.is_marked = is_marked)
    }

    fn set_next(&self, next: Option<Block>) {
        self.update(|h| h.next = next)
    }

    fn set_prev(&self, prev: Option<Block>) {
        self.update(|h| h.prev = prev)
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_free() { "free" } else { "used" };
        write!(f, "Block({:?}, {}, {})", self.header, self.size(), state)
    }
}

// The chain is only ever touched by one owner at a time; moving that owner
// across threads moves the whole chain with it.
unsafe impl Send for Block {}

/// A `BlockList` is the address-ordered chain of every block in managed
/// memory, free and used alike.
///
/// It maintains a few internal invariants:
///
/// - Each block links to the next, and back to the previous, with the ends
///   linking to nothing.
/// - Within a region, blocks are contiguous and in ascending address order.
///   Regions follow each other in the order they were mapped.
/// - No two adjacent free blocks of the same region survive a public call
///   on the allocator; they are merged as they appear.
#[derive(Default)]
pub struct BlockList {
    head: Option<Block>,
    tail: Option<Block>,
}

pub struct BlockIter<'list> {
    next: Option<Block>,
    _list: PhantomData<&'list BlockList>,
}

impl<'list> Iterator for BlockIter<'list> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.next.take()?;
        self.next = next.next();
        Some(next)
    }
}

impl<'list> IntoIterator for &'list BlockList {
    type Item = Block;
    type IntoIter = BlockIter<'list>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for BlockList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockList(")?;
        let mut start = true;
        for block in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "{:?}", block)?;
        }

        write!(f, ")")
    }
}

impl BlockList {
    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            next: self.head,
            _list: PhantomData,
        }
    }

    pub fn head(&self) -> Option<Block> {
        self.head
    }

    pub fn tail(&self) -> Option<Block> {
        self.tail
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Format a freshly mapped region of `len` bytes as one free block and
    /// append it to the tail of the chain.
    ///
    /// # Safety
    ///
    /// `ptr` must be `ALIGNMENT`-aligned and point to `len` bytes of memory
    /// that nothing else uses, and ownership of that memory passes to the
    /// list. `len` must be at least `HEADER_SIZE + ALIGNMENT` and a multiple of
    /// `ALIGNMENT`.
    pub unsafe fn push_region(&mut self, ptr: NonNull<u8>, len: usize) -> Block {
        assert!(
            len >= HEADER_SIZE + ALIGNMENT,
            "Can't format a region of {} bytes - need {} for a header",
            len,
            HEADER_SIZE,
        );
        let block = Block::write(
            ptr,
            Header {
                size: len - HEADER_SIZE,
                next: None,
                prev: self.tail,
                is_free: true,
                is_marked: false,
                region_start: true,
            },
        );

        match self.tail {
            Some(tail) => tail.set_next(Some(block)),
            None => self.head = Some(block),
        }
        self.tail = Some(block);
        block
    }

    /// Shrink `block` to `size` usable bytes and carve the rest into a new
    /// free block linked right after it.
    ///
    /// Returns `None`, leaving the block untouched, when the remainder would
    /// be too small to hold a header plus `MIN_SPLIT_REMAINDER` bytes.
    pub fn split(&mut self, block: Block, size: usize) -> Option<Block> {
        debug_assert_eq!(size % ALIGNMENT, 0);
        let total = block.size();
        if total < size + HEADER_SIZE + MIN_SPLIT_REMAINDER {
            return None;
        }

        let rest = unsafe {
            let ptr = NonNull::new_unchecked(block.data().as_ptr().add(size));
            Block::write(
                ptr,
                Header {
                    size: total - size - HEADER_SIZE,
                    next: block.next(),
                    prev: Some(block),
                    is_free: true,
                    is_marked: false,
                    region_start: false,
                },
            )
        };

        match block.next() {
            Some(next) => next.set_prev(Some(rest)),
            None => self.tail = Some(rest),
        }
        block.set_size(size);
        block.set_next(Some(rest));
        log::trace!("Split {:?} off {:?}", rest, block);

        Some(rest)
    }

    /// Attempt to merge `block` with the next.
    ///
    /// The merge happens only if both are free and the next block starts
    /// exactly where this one ends, within the same region. The next block's
    /// header and usable size are absorbed, and it leaves the chain.
    pub fn try_merge_next(&mut self, block: Block) -> bool {
        let next = match block.next() {
            None => return false,
            Some(next) => next,
        };
        if !block.is_free() || !next.is_free() || !block.is_adjacent_before(&next) {
            return false;
        }

        let after = next.next();
        block.update(|h| {
            h.size += HEADER_SIZE + next.size();
            h.next = after;
        });
        match after {
            Some(after) => after.set_prev(Some(block)),
            None => self.tail = Some(block),
        }

        true
    }

    /// Merge a just-freed block with its free neighbors: forward first, then
    /// into its predecessor.
    ///
    /// Returns the block now covering `block`, and the number of merges.
    pub fn coalesce(&mut self, block: Block) -> (Block, usize) {
        let mut merges = 0;
        if self.try_merge_next(block) {
            merges += 1;
        }

        match block.prev() {
            Some(prev) if self.try_merge_next(prev) => (prev, merges + 1),
            _ => (block, merges),
        }
    }

    /// Merge every pair of adjacent free blocks in the chain. Returns the
    /// number of merges.
    pub fn coalesce_all(&mut self) -> usize {
        let mut merges = 0;
        let mut current = self.head;
        while let Some(block) = current {
            if self.try_merge_next(block) {
                // The block grew; it may now reach the next free block too.
                merges += 1;
                continue;
            }
            current = block.next();
        }
        merges
    }

    /// Find the block whose usable memory starts at `ptr`.
    pub fn find_data(&self, ptr: *const u8) -> Option<Block> {
        let addr = ptr as usize;
        self.iter().find(|block| block.addr() + HEADER_SIZE == addr)
    }

    /// Find the block whose usable memory contains `ptr`.
    pub fn find_containing(&self, ptr: *const u8) -> Option<Block> {
        let addr = ptr as usize;
        self.iter().find(|block| block.data_range().contains(&addr))
    }
}
