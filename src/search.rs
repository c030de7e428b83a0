//! Placement strategies over the block chain.

use core::fmt;
use core::str::FromStr;

use crate::blocklist::{Block, BlockList};

/// The rule used to choose which free block satisfies a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// The first free block, in chain order, that is large enough.
    FirstFit,
    /// The smallest free block that is large enough.
    BestFit,
    /// The largest free block.
    WorstFit,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::FirstFit
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::FirstFit => "first-fit",
            Strategy::BestFit => "best-fit",
            Strategy::WorstFit => "worst-fit",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStrategy(pub String);

impl fmt::Display for UnknownStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown placement strategy {:?} (expected first-fit, best-fit or worst-fit)",
            self.0
        )
    }
}

impl std::error::Error for UnknownStrategy {}

impl FromStr for Strategy {
    type Err = UnknownStrategy;

    /// Accepts `first-fit`, `first_fit`, `FIRST_FIT`, `firstfit`, `first` and
    /// the same spellings of best and worst.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();

        match normalized.as_str() {
            "firstfit" | "first" => Ok(Strategy::FirstFit),
            "bestfit" | "best" => Ok(Strategy::BestFit),
            "worstfit" | "worst" => Ok(Strategy::WorstFit),
            _ => Err(UnknownStrategy(s.to_owned())),
        }
    }
}

impl BlockList {
    /// Find a free block with at least `min_size` usable bytes.
    ///
    /// The chain is scanned from head to tail. First-fit stops at the first
    /// match; best-fit and worst-fit scan everything and keep the earliest
    /// block on ties.
    pub fn find_free_block(&self, min_size: usize, strategy: Strategy) -> Option<Block> {
        let mut candidates = self
            .iter()
            .filter(|block| block.is_free() && block.size() >= min_size);

        match strategy {
            Strategy::FirstFit => candidates.next(),
            Strategy::BestFit => candidates.fold(None, |best: Option<Block>, block| match best {
                Some(b) if b.size() <= block.size() => Some(b),
                _ => Some(block),
            }),
            Strategy::WorstFit => candidates.fold(None, |worst: Option<Block>, block| match worst {
                Some(w) if w.size() >= block.size() => Some(w),
                _ => Some(block),
            }),
        }
    }
}
