use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use super::{Descriptor, Separator};

/// Half-open key interval `[min, max)`.
///
/// An indefinite `max` makes the range unbounded above, an indefinite `min`
/// unbounded below.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange<K> {
    pub min: Separator<K>,
    pub max: Separator<K>,
}

impl<K: Ord + Clone> KeyRange<K> {
    pub fn new(min: Separator<K>, max: Separator<K>) -> Self {
        Self { min, max }
    }

    /// The range covering every key.
    pub fn all() -> Self {
        Self::new(Separator::NegInfinity, Separator::PosInfinity)
    }

    /// `[lo, hi)`
    pub fn between(lo: K, hi: K) -> Self {
        Self::new(Separator::Value(lo), Separator::Value(hi))
    }

    /// `[lo, +inf)`
    pub fn at_least(lo: K) -> Self {
        Self::new(Separator::Value(lo), Separator::PosInfinity)
    }

    /// `[-inf, hi)`
    pub fn below(hi: K) -> Self {
        Self::new(Separator::NegInfinity, Separator::Value(hi))
    }

    pub fn is_empty(&self) -> bool {
        self.min >= self.max
    }

    /// `min <= key < max`
    pub fn contains_key(&self, key: &K) -> bool {
        self.min.cmp_key(key).is_le() && self.max.cmp_key(key).is_gt()
    }

    /// Intersection of two ranges, `None` if disjoint.
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let min = std::cmp::max(&self.min, &other.min).clone();
        let max = std::cmp::min(&self.max, &other.max).clone();
        let range = Self::new(min, max);
        (!range.is_empty()).then_some(range)
    }

    /// Cuts the range at `at`: `[min, at)` and `[at, max)`.
    pub fn split_at(&self, at: K) -> (Self, Self) {
        let at = Separator::Value(at);
        (
            Self::new(self.min.clone(), at.clone()),
            Self::new(at, self.max.clone()),
        )
    }
}

impl<K: Ord + Clone> Descriptor for KeyRange<K> {
    fn overlaps(&self, other: &Self) -> bool {
        self.min < other.max && other.min < self.max
    }

    fn contains(&self, other: &Self) -> bool {
        self.min <= other.min && other.max <= self.max
    }

    fn union(&self, other: &Self) -> Self {
        Self::new(
            std::cmp::min(&self.min, &other.min).clone(),
            std::cmp::max(&self.max, &other.max).clone(),
        )
    }
}

impl<K: Display> Display for KeyRange<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}
