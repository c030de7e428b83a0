//! The process-wide allocator behind the fixed-name `t_*` entry points.
//!
//! [`t_init`] creates the single allocator over OS pages; every other
//! function works on it. It is never torn down: its pages are released only
//! when the process exits.
//!
//! Failure to obtain memory from the OS is fatal here. The error is logged,
//! printed to stderr, and the process exits with status 1.

use core::fmt;
use core::ptr::null_mut;

use spin::Mutex;

use crate::allocators::Allocator;
use crate::pages::MmapPages;
use crate::search::Strategy;
use crate::stats::Stats;

static ALLOCATOR: Mutex<Option<Allocator<MmapPages>>> = Mutex::new(None);

fn fatal(context: &str, err: impl fmt::Display) -> ! {
    log::error!("{}: {}", context, err);
    eprintln!("Error: {}: {}", context, err);
    std::process::exit(1)
}

fn with_allocator<R, F: FnOnce(&mut Allocator<MmapPages>) -> R>(f: F) -> R {
    let mut guard = ALLOCATOR.lock();
    let allocator = guard
        .as_mut()
        .expect("t_init must be called before any other t_* function");
    f(allocator)
}

/// Initialize the process-wide allocator with the given placement strategy.
///
/// Maps the first page; exits the process if that fails.
///
/// # Panics
///
/// Must be called exactly once. A second call would have to discard mapped
/// memory that may still be in use, so it panics instead.
pub fn t_init(strategy: Strategy) {
    let mut guard = ALLOCATOR.lock();
    assert!(
        guard.is_none(),
        "t_init called twice; the allocator is never torn down"
    );

    match Allocator::new(strategy, MmapPages::new()) {
        Ok(allocator) => *guard = Some(allocator),
        Err(err) => fatal("failed to initialize allocator", err),
    }
}

/// Allocate `size` bytes. Returns null exactly when `size` is 0.
///
/// Exits the process if the OS cannot supply more memory.
///
/// # Panics
///
/// Panics if `t_init` has not been called.
pub fn t_malloc(size: usize) -> *mut u8 {
    match with_allocator(|allocator| allocator.allocate(size)) {
        Ok(Some(ptr)) => ptr.as_ptr(),
        Ok(None) => null_mut(),
        Err(err) => fatal("failed to allocate memory", err),
    }
}

/// Release memory returned by `t_malloc`. Null is ignored; foreign pointers
/// and double frees are logged and otherwise ignored.
///
/// # Panics
///
/// Panics if `t_init` has not been called.
pub fn t_free(ptr: *mut u8) {
    if let Err(err) = with_allocator(|allocator| allocator.release(ptr)) {
        log::warn!("t_free: {}", err);
    }
}

/// Reclaim every block not reachable from the calling thread's stack.
///
/// Does nothing without the `gc` feature, or where the stack cannot be
/// scanned.
///
/// # Panics
///
/// Panics if `t_init` has not been called.
#[inline(never)]
pub fn t_gcollect() {
    #[cfg(all(feature = "gc", target_os = "linux"))]
    {
        if with_allocator(|allocator| allocator.collect()).is_none() {
            log::warn!("t_gcollect: stack bounds unavailable, nothing collected");
        }
    }

    #[cfg(not(all(feature = "gc", target_os = "linux")))]
    with_allocator(|_| ());
}

/// A snapshot of the process-wide allocator's counters.
///
/// # Panics
///
/// Panics if `t_init` has not been called.
pub fn t_stats() -> Stats {
    let (_, stats) = with_allocator(|allocator| allocator.stats());
    stats
}

/// Print page size, mapped bytes, bytes in use, overhead and utilization to
/// stdout.
///
/// # Panics
///
/// Panics if `t_init` has not been called.
pub fn t_display_stats() {
    println!("{}", t_stats());
}

/// Percentage of mapped memory currently handed out, from 0 to 100.
///
/// # Panics
///
/// Panics if `t_init` has not been called.
pub fn t_get_usage() -> f64 {
    with_allocator(|allocator| allocator.usage())
}
