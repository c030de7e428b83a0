//! Counters and chain validation.

use core::fmt;

use crate::blocklist::{BlockList, Relation, ALIGNMENT, HEADER_SIZE};

/// Validity contains a representation of all invalid states found in a
/// block chain.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    /// Number of blocks overlapping the previous one.
    ///
    /// This likely indicates corruption.
    pub overlaps: usize,
    /// Number of free blocks directly followed, in the same region, by
    /// another free block. This shouldn't happen, but isn't totally corrupt.
    pub adjacent_free: usize,
    /// Number of blocks inside a region that do not start where the previous
    /// block ends, leaving unaccounted memory in between.
    pub gaps: usize,
    /// Number of blocks inside a region that lie below the previous block.
    pub out_of_orders: usize,
    /// Number of links whose back-link does not point back.
    pub broken_links: usize,
    /// Number of blocks still marked outside of a collection.
    pub stray_marks: usize,
    /// Number of blocks whose address or size is not a multiple of
    /// `ALIGNMENT`.
    pub misaligned: usize,
    /// Number of counters that disagree with the chain.
    pub accounting_errors: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        *self == Validity::default()
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

/// A snapshot of the allocator's counters.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub page_size: usize,
    /// Every byte obtained from the OS.
    pub total_size: usize,
    /// Usable bytes of blocks in use.
    pub requested_size: usize,
    /// Bytes taken by headers.
    pub overhead: usize,
    pub blocks: usize,
    pub free_blocks: usize,
    /// Usable bytes of free blocks.
    pub free_size: usize,
}

impl Stats {
    /// Percentage of mapped memory handed out to callers.
    pub fn usage_percent(&self) -> f64 {
        percent(self.requested_size, self.total_size)
    }

    /// Percentage of mapped memory taken by headers.
    pub fn overhead_percent(&self) -> f64 {
        percent(self.overhead, self.total_size)
    }
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 / whole as f64 * 100.0
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Page size: {} bytes", self.page_size)?;
        writeln!(f, "Total bytes requested from sys: {} bytes", self.total_size)?;
        writeln!(f, "Bytes in use: {} bytes", self.requested_size)?;
        writeln!(
            f,
            "Data structure overhead: {} bytes ({:.5}%)",
            self.overhead,
            self.overhead_percent()
        )?;
        writeln!(f, "Memory utilization: {:.2}%", self.usage_percent())?;
        write!(
            f,
            "Blocks: {} ({} free, {} free bytes)",
            self.blocks, self.free_blocks, self.free_size
        )
    }
}

/// Totals gathered from one walk of the chain.
#[derive(Default, Debug)]
pub(crate) struct Survey {
    pub blocks: usize,
    pub free_blocks: usize,
    pub free_size: usize,
    pub used_size: usize,
    /// Headers plus usable sizes of every block.
    pub spanned: usize,
}

impl BlockList {
    /// Walk the chain once, checking its structure and adding up sizes.
    pub(crate) fn survey(&self) -> (Validity, Survey) {
        let mut validity = Validity::default();
        let mut survey = Survey::default();

        if let Some(head) = self.head() {
            if head.prev().is_some() {
                validity.broken_links += 1;
            }
        }

        let mut previous = None;
        for block in self.iter() {
            if let Some(prev) = previous {
                if block.prev() != Some(prev) {
                    validity.broken_links += 1;
                }

                let relation: Relation = prev.relation(&block);
                match relation {
                    // Regions may lie anywhere relative to each other.
                    _ if block.is_region_start() => {
                        if let Relation::Overlapping = relation {
                            validity.overlaps += 1;
                        }
                    }
                    Relation::AdjacentBefore => {
                        if prev.is_free() && block.is_free() {
                            validity.adjacent_free += 1;
                        }
                    }
                    Relation::Before => validity.gaps += 1,
                    Relation::Overlapping => validity.overlaps += 1,
                    Relation::AdjacentAfter | Relation::After => validity.out_of_orders += 1,
                }
            }

            if block.addr() % ALIGNMENT != 0 || block.size() % ALIGNMENT != 0 {
                validity.misaligned += 1;
            }
            if block.is_marked() {
                validity.stray_marks += 1;
            }

            survey.blocks += 1;
            survey.spanned += HEADER_SIZE + block.size();
            if block.is_free() {
                survey.free_blocks += 1;
                survey.free_size += block.size();
            } else {
                survey.used_size += block.size();
            }
            previous = Some(block);
        }

        if previous != self.tail() {
            validity.broken_links += 1;
        }

        (validity, survey)
    }
}
