//! Boundary and region abstractions shared by all tree variants.
//!
//! - [`Separator`]: a single boundary key, possibly indefinite (±∞)
//! - [`KeyRange`]: half-open interval of separators
//! - [`Rectangle`]: n-dimensional closed box
//! - [`Version`], [`Lifespan`], [`MvSeparator`], [`MvRegion`]: temporal
//!   augmentation used by the multi-version B-Tree

mod key_range;
mod rectangle;
mod separator;
mod version;

pub use key_range::KeyRange;
pub use rectangle::Rectangle;
pub use separator::Separator;
pub use version::{Lifespan, MvRegion, MvSeparator, Version};

/// A boundable region attached to an entry or a subtree.
pub trait Descriptor: Clone {
    /// Whether the two regions share at least one point.
    fn overlaps(&self, other: &Self) -> bool;

    /// Whether `other` lies completely inside `self`.
    fn contains(&self, other: &Self) -> bool;

    /// Smallest region covering both.
    fn union(&self, other: &Self) -> Self;

    /// Union of a non-empty sequence of regions.
    fn union_all<'a, I>(regions: I) -> Option<Self>
    where
        Self: 'a,
        I: IntoIterator<Item = &'a Self>,
    {
        let mut iter = regions.into_iter();
        let first = iter.next()?.clone();
        Some(iter.fold(first, |acc, r| acc.union(r)))
    }
}
