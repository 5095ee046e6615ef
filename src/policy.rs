//! Strategies for choosing which free block satisfies a request.
//!
//! All three policies make a single forward scan from the heap root,
//! remembering the last block they visited; on a miss the engine extends
//! the heap right after that block.

use std::fmt;

use thiserror::Error;

use crate::blocklist::{BlockDirectory, BlockRef};

/// The strategy for picking among free blocks that could satisfy a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FitPolicy {
    /// Take the first free block that is large enough and stop scanning.
    FirstFit,
    /// Scan everything; take the qualifying block with the least slack.
    BestFit,
    /// Scan everything; take the largest qualifying block.
    WorstFit,
}

/// An unrecognized numeric policy selector.
///
/// Selection itself cannot fail this way; the error exists at the
/// configuration boundary, where an untyped selector value first becomes a
/// [`FitPolicy`]. It is reported rather than silently defaulted.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
#[error("unknown fit policy selector: {0}")]
pub struct UnknownPolicy(pub u8);

/// Result of one policy scan: the chosen block, if any, and the last block
/// visited (the extension point when nothing qualified).
pub(crate) struct Selection {
    pub hit: Option<BlockRef>,
    pub last: Option<BlockRef>,
}

impl FitPolicy {
    /// Parse the conventional numeric selector: 0 first-fit, 1 best-fit,
    /// 2 worst-fit.
    pub fn from_selector(selector: u8) -> Result<FitPolicy, UnknownPolicy> {
        match selector {
            0 => Ok(FitPolicy::FirstFit),
            1 => Ok(FitPolicy::BestFit),
            2 => Ok(FitPolicy::WorstFit),
            other => Err(UnknownPolicy(other)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FitPolicy::FirstFit => "first-fit",
            FitPolicy::BestFit => "best-fit",
            FitPolicy::WorstFit => "worst-fit",
        }
    }

    /// Scan the directory for a free block of at least `size` bytes.
    ///
    /// Ties in best-fit and worst-fit go to the earliest block: a later
    /// candidate only replaces the tracked one on a strict improvement.
    pub(crate) fn select(&self, directory: &BlockDirectory, size: usize) -> Selection {
        match self {
            FitPolicy::FirstFit => {
                let mut last = None;
                let mut cursor = directory.head();
                while let Some(block) = cursor {
                    if block.is_free() && block.size() >= size {
                        return Selection {
                            hit: Some(block),
                            last,
                        };
                    }
                    last = Some(block);
                    cursor = block.next();
                }
                Selection { hit: None, last }
            }

            FitPolicy::BestFit => {
                let mut best: Option<(BlockRef, usize)> = None;
                let mut last = None;
                let mut cursor = directory.head();
                while let Some(block) = cursor {
                    if block.is_free() {
                        if block.size() == size {
                            return Selection {
                                hit: Some(block),
                                last,
                            };
                        }
                        if block.size() > size {
                            let slack = block.size() - size;
                            if best.map_or(true, |(_, tracked)| slack < tracked) {
                                best = Some((block, slack));
                            }
                        }
                    }
                    last = Some(block);
                    cursor = block.next();
                }
                Selection {
                    hit: best.map(|(block, _)| block),
                    last,
                }
            }

            FitPolicy::WorstFit => {
                let mut worst: Option<BlockRef> = None;
                let mut last = None;
                let mut cursor = directory.head();
                while let Some(block) = cursor {
                    if block.is_free() && block.size() >= size {
                        if worst.map_or(true, |tracked| block.size() > tracked.size()) {
                            worst = Some(block);
                        }
                    }
                    last = Some(block);
                    cursor = block.next();
                }
                Selection { hit: worst, last }
            }
        }
    }
}

impl Default for FitPolicy {
    fn default() -> Self {
        FitPolicy::FirstFit
    }
}

impl fmt::Display for FitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocklist::testutil::TestHeap;

    use test_env_log::test;

    // Three free candidates of 56, 200 and 104 bytes, separated by used
    // blocks so they cannot merge.
    fn candidates() -> TestHeap {
        TestHeap::with_blocks(&[
            (56, true),
            (8, false),
            (200, true),
            (8, false),
            (104, true),
            (8, false),
        ])
    }

    #[test]
    fn selector_parsing() {
        assert_eq!(FitPolicy::from_selector(0), Ok(FitPolicy::FirstFit));
        assert_eq!(FitPolicy::from_selector(1), Ok(FitPolicy::BestFit));
        assert_eq!(FitPolicy::from_selector(2), Ok(FitPolicy::WorstFit));
        assert_eq!(FitPolicy::from_selector(3), Err(UnknownPolicy(3)));
    }

    #[test]
    fn first_fit_takes_the_first_qualifying_block() {
        let heap = candidates();
        let selection = FitPolicy::FirstFit.select(&heap.directory, 80);

        assert_eq!(selection.hit, Some(heap.blocks[2]));
        // The scan stopped at the hit; the last visited block is its
        // predecessor.
        assert_eq!(selection.last, Some(heap.blocks[1]));
    }

    #[test]
    fn best_fit_takes_the_least_slack() {
        let heap = candidates();
        let selection = FitPolicy::BestFit.select(&heap.directory, 80);

        assert_eq!(selection.hit, Some(heap.blocks[4]));
        assert_eq!(selection.last, Some(heap.blocks[5]));
    }

    #[test]
    fn best_fit_returns_an_exact_match_immediately() {
        let heap = candidates();
        let selection = FitPolicy::BestFit.select(&heap.directory, 56);

        assert_eq!(selection.hit, Some(heap.blocks[0]));
        assert_eq!(selection.last, None);
    }

    #[test]
    fn worst_fit_takes_the_largest_qualifying_block() {
        let heap = candidates();
        let selection = FitPolicy::WorstFit.select(&heap.directory, 80);

        assert_eq!(selection.hit, Some(heap.blocks[2]));
        assert_eq!(selection.last, Some(heap.blocks[5]));
    }

    #[test]
    fn ties_go_to_the_earliest_block() {
        let heap = TestHeap::with_blocks(&[(96, true), (8, false), (96, true)]);

        let best = FitPolicy::BestFit.select(&heap.directory, 80);
        assert_eq!(best.hit, Some(heap.blocks[0]));

        let worst = FitPolicy::WorstFit.select(&heap.directory, 80);
        assert_eq!(worst.hit, Some(heap.blocks[0]));
    }

    #[test]
    fn a_miss_reports_the_extension_point() {
        let heap = candidates();
        for policy in &[FitPolicy::FirstFit, FitPolicy::BestFit, FitPolicy::WorstFit] {
            let selection = policy.select(&heap.directory, 512);
            assert_eq!(selection.hit, None);
            assert_eq!(selection.last, Some(heap.blocks[5]));
        }
    }

    #[test]
    fn used_blocks_never_qualify() {
        let heap = TestHeap::with_blocks(&[(256, false), (64, true)]);
        let selection = FitPolicy::FirstFit.select(&heap.directory, 128);
        assert_eq!(selection.hit, None);
    }
}
