//! A page-backed block-list allocator.
//!
//! Memory comes from the OS in whole pages and is carved into blocks, each
//! prefixed by a header and linked into one chain. Requests are served from
//! free blocks chosen by a placement [`Strategy`] (first-fit, best-fit or
//! worst-fit), splitting off whatever is left over; released blocks are merged
//! with free neighbors right away. With the `gc` feature, a conservative
//! mark-and-sweep pass can also reclaim blocks nothing points to any more.
//!
//! ## Basic Types
//!
//! ### [`Allocator`](allocators/struct.Allocator.html)
//!
//! A single-threaded allocator over one [`PageProvider`]. Create as many as
//! you like; each owns its own memory.
//!
//! ### [`PageProvider`](pages/trait.PageProvider.html)
//!
//! A simple trait interface meant to abstract over the calls to the OS to map
//! more memory. [`MmapPages`] uses anonymous mappings; [`ToyHeap`] hands out
//! pages from a fixed buffer and is mainly useful for testing.
//!
//! ### The `t_*` functions
//!
//! [`t_init`], [`t_malloc`], [`t_free`], [`t_gcollect`], [`t_display_stats`]
//! and [`t_get_usage`] drive one process-wide allocator over OS pages, for
//! drivers written against that interface.
//!
//! ```
//! use placement_alloc::{Allocator, Strategy, ToyHeap};
//!
//! let mut allocator = Allocator::new(Strategy::BestFit, ToyHeap::default()).unwrap();
//! let ptr = allocator.allocate(20).unwrap().unwrap();
//! allocator.release(ptr.as_ptr()).unwrap();
//!
//! let (validity, stats) = allocator.stats();
//! assert!(validity.is_valid());
//! assert_eq!(stats.requested_size, 0);
//! ```

pub mod allocators;
pub mod blocklist;
#[cfg(feature = "gc")]
pub mod collector;
pub mod global;
pub mod pages;
pub mod search;
pub mod stats;

pub use crate::allocators::{AllocError, Allocator, ReleaseError};
pub use crate::blocklist::{Block, BlockList, ALIGNMENT, HEADER_SIZE};
#[cfg(feature = "gc")]
pub use crate::collector::{CollectReport, CollectorPhase};
pub use crate::global::{
    t_display_stats, t_free, t_gcollect, t_get_usage, t_init, t_malloc, t_stats,
};
pub use crate::pages::{MmapPages, PageProvider, ToyHeap, ToyHeapExhausted};
pub use crate::search::{Strategy, UnknownStrategy};
pub use crate::stats::{Stats, Validity};
