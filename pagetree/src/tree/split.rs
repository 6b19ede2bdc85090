//! Split strategies.
//!
//! A strategy looks at the ordered content of an overflowing node and returns
//! the boundary `i` at which it is cut: the left node keeps `items[..i]`, the
//! new right sibling receives `items[i..]`.

use std::fmt::Debug;

use crate::curve::common_prefix_len;

/// What a strategy knows about one node entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitItem {
    /// Serialized size in bytes
    pub size: usize,
    /// Left-aligned fixed-width image of the entry's key
    pub curve_bits: u64,
}

/// Chooses where an overflowing node is cut.
pub trait SplitStrategy: Debug + Send + Sync {
    /// Returns a boundary in `1..items.len()`. Both halves should keep at
    /// least `min_entries` items when `items.len()` allows it.
    fn split_point(&self, items: &[SplitItem], min_entries: usize) -> usize;
}

/// Range of boundaries keeping `min_entries` on both sides.
fn legal_bounds(len: usize, min_entries: usize) -> (usize, usize) {
    let lo = min_entries.max(1);
    let hi = len.saturating_sub(min_entries.max(1));
    if lo > hi {
        let mid = (len / 2).max(1);
        (mid, mid)
    } else {
        (lo, hi)
    }
}

/// Cuts at the balanced midpoint by entry count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MidpointSplit;

impl SplitStrategy for MidpointSplit {
    fn split_point(&self, items: &[SplitItem], min_entries: usize) -> usize {
        let (lo, hi) = legal_bounds(items.len(), min_entries);
        (items.len() / 2).clamp(lo, hi)
    }
}

/// Cuts where adjacent keys share the shortest common bit prefix.
///
/// A boundary is admissible when the byte size of the left part lies in
/// `[min_bytes, max_bytes]`. Among admissible boundaries the one whose two
/// adjacent keys have the shortest common leading-bit prefix wins; ties go to
/// the earliest position. Without an admissible boundary the midpoint is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceFillingCurveSplit {
    pub min_bytes: usize,
    pub max_bytes: usize,
}

impl SpaceFillingCurveSplit {
    pub fn new(min_bytes: usize, max_bytes: usize) -> Self {
        Self {
            min_bytes,
            max_bytes,
        }
    }
}

impl SplitStrategy for SpaceFillingCurveSplit {
    fn split_point(&self, items: &[SplitItem], min_entries: usize) -> usize {
        let (lo, hi) = legal_bounds(items.len(), min_entries);

        let mut best: Option<(u32, usize)> = None;
        let mut left_bytes: usize = items[..lo.min(items.len())].iter().map(|i| i.size).sum();
        for boundary in lo..=hi {
            if boundary > lo {
                left_bytes += items[boundary - 1].size;
            }
            if boundary == 0 || boundary >= items.len() {
                continue;
            }
            if left_bytes < self.min_bytes || left_bytes > self.max_bytes {
                continue;
            }
            let prefix = common_prefix_len(
                items[boundary - 1].curve_bits,
                items[boundary].curve_bits,
            );
            if best.map_or(true, |(p, _)| prefix < p) {
                best = Some((prefix, boundary));
            }
        }

        match best {
            Some((_, boundary)) => boundary,
            None => MidpointSplit.split_point(items, min_entries),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::CurveKey;

    fn items(keys: &[u64], size: usize) -> Vec<SplitItem> {
        keys.iter()
            .map(|k| SplitItem {
                size,
                curve_bits: k.curve_bits(),
            })
            .collect()
    }

    #[test]
    fn test_midpoint() {
        let items = items(&[1, 2, 3, 4, 5], 8);
        assert_eq!(MidpointSplit.split_point(&items, 2), 2);
        assert_eq!(MidpointSplit.split_point(&items[..4], 1), 2);
    }

    #[test]
    fn test_curve_split_picks_shortest_prefix() {
        // keys 0..8 with 1-byte entries; window [2, 6] admits boundaries 2..=6
        let keys: Vec<u64> = vec![0, 1, 2, 3, 4, 5, 6, 7];
        let items = items(&keys, 1);
        let strategy = SpaceFillingCurveSplit::new(2, 6);

        let expected = (2..=6)
            .min_by_key(|&b| (keys[b - 1] ^ keys[b]).leading_zeros())
            .unwrap();
        assert_eq!(expected, 4);
        assert_eq!(strategy.split_point(&items, 1), expected);
    }

    #[test]
    fn test_curve_split_ties_go_to_earliest() {
        // identical images share all 64 bits at every boundary
        let same = vec![
            SplitItem {
                size: 4,
                curve_bits: 42,
            };
            5
        ];
        let strategy = SpaceFillingCurveSplit::new(8, 16);
        assert_eq!(strategy.split_point(&same, 1), 2);

        let items = items(&[10, 11, 12, 13], 4);
        let wide = SpaceFillingCurveSplit::new(0, 100);
        // 11 -> 12 differs in bit 2, the other boundaries only in bit 0
        assert_eq!(wide.split_point(&items, 1), 2);
    }

    #[test]
    fn test_curve_split_falls_back_to_midpoint() {
        let items = items(&[1, 2, 3, 4, 5, 6], 10);
        let strategy = SpaceFillingCurveSplit::new(1000, 2000);
        assert_eq!(strategy.split_point(&items, 1), 3);
    }

    #[test]
    fn test_curve_split_respects_min_entries() {
        // the best raw boundary (after 7) would leave one entry on the right
        let items = items(&[0, 1, 2, 3, 4, 5, 6, 1 << 40], 1);
        let strategy = SpaceFillingCurveSplit::new(0, 100);
        let point = strategy.split_point(&items, 3);
        assert!((3..=5).contains(&point));
        assert_eq!(point, 4);
    }
}
