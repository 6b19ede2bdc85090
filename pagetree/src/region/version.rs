use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use super::{Descriptor, KeyRange, Separator};

/// Totally ordered timestamp scoping the validity of MVBT entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Version(pub u64);

impl Version {
    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }
}

impl From<u64> for Version {
    fn from(v: u64) -> Self {
        Version(v)
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Validity interval `[insert, delete)`; an undefined `delete` means the
/// owner is still alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lifespan {
    pub insert: Version,
    pub delete: Option<Version>,
}

impl Lifespan {
    pub fn starting_at(insert: Version) -> Self {
        Self {
            insert,
            delete: None,
        }
    }

    pub fn new(insert: Version, delete: Option<Version>) -> Self {
        Self { insert, delete }
    }

    /// `insert <= v < delete`
    pub fn alive_at(&self, v: Version) -> bool {
        self.insert <= v && self.delete.map_or(true, |d| v < d)
    }

    /// Still alive at the newest version.
    pub fn is_open(&self) -> bool {
        self.delete.is_none()
    }

    pub fn close(&mut self, at: Version) {
        self.delete = Some(at);
    }

    /// Whether the two intervals share at least one version.
    pub fn overlaps(&self, other: &Lifespan) -> bool {
        let self_before_other_ends = other.delete.map_or(true, |d| self.insert < d);
        let other_before_self_ends = self.delete.map_or(true, |d| other.insert < d);
        self_before_other_ends && other_before_self_ends
    }

    /// Intersection with an enclosing interval; the start is kept.
    pub fn clip(&self, outer: &Lifespan) -> Lifespan {
        let delete = match (self.delete, outer.delete) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Lifespan::new(self.insert, delete)
    }
}

impl Display for Lifespan {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.delete {
            Some(d) => write!(f, "[{}, {})", self.insert, d),
            None => write!(f, "[{}, *)", self.insert),
        }
    }
}

/// A definite key together with its lifespan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MvSeparator<K> {
    pub key: K,
    pub lifespan: Lifespan,
}

impl<K: Ord> MvSeparator<K> {
    pub fn new(key: K, lifespan: Lifespan) -> Self {
        Self { key, lifespan }
    }

    pub fn alive_at(&self, v: Version) -> bool {
        self.lifespan.alive_at(v)
    }

    pub fn separator(&self) -> Separator<&K> {
        Separator::Value(&self.key)
    }
}

/// Key range together with the lifespan of the subtree it describes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MvRegion<K> {
    pub range: KeyRange<K>,
    pub lifespan: Lifespan,
}

impl<K: Ord + Clone> MvRegion<K> {
    pub fn new(range: KeyRange<K>, lifespan: Lifespan) -> Self {
        Self { range, lifespan }
    }

    pub fn alive_at(&self, v: Version) -> bool {
        self.lifespan.alive_at(v)
    }
}

impl<K: Ord + Clone> Descriptor for MvRegion<K> {
    fn overlaps(&self, other: &Self) -> bool {
        self.range.overlaps(&other.range) && self.lifespan.overlaps(&other.lifespan)
    }

    fn contains(&self, other: &Self) -> bool {
        let starts_before = self.lifespan.insert <= other.lifespan.insert;
        let ends_after = match (self.lifespan.delete, other.lifespan.delete) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(a), Some(b)) => b <= a,
        };
        self.range.contains(&other.range) && starts_before && ends_after
    }

    fn union(&self, other: &Self) -> Self {
        let insert = self.lifespan.insert.min(other.lifespan.insert);
        let delete = match (self.lifespan.delete, other.lifespan.delete) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        };
        Self::new(self.range.union(&other.range), Lifespan::new(insert, delete))
    }
}
