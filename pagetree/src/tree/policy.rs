//! The seam between the generic engine and a concrete tree variant.

use std::fmt::Debug;

use super::node::IndexEntry;
use crate::errors::TreeResult;

/// Variant-specific behaviour plugged into [`Tree`](super::Tree).
///
/// The engine owns descent, path rewriting, splitting and rebalancing; a
/// policy decides how regions are computed, which subtree receives an entry,
/// where an entry sits inside a leaf and which subtrees a query visits.
pub trait IndexPolicy: Send + Sync {
    /// Leaf payload
    type Entry: Clone + Debug + Send + Sync + 'static;
    /// Region stored next to every child reference
    type Region: Clone + Debug + PartialEq + Send + Sync + 'static;
    /// Query selecting a set of entries
    type Query;
    /// Identifies one stored entry for lookup and removal
    type Probe: ?Sized;

    /// Region describing the given leaf entries, `None` for an empty leaf.
    fn leaf_region(&self, entries: &[Self::Entry]) -> Option<Self::Region>;

    /// Region describing the given children, `None` for an empty node.
    fn index_region(&self, children: &[IndexEntry<Self::Region>]) -> Option<Self::Region>;

    /// Rejects entries the tree cannot hold.
    fn validate(&self, _entry: &Self::Entry) -> TreeResult<()> {
        Ok(())
    }

    /// Candidate children for a new entry. When several are returned the
    /// engine takes the one with the fewest entries.
    fn choose_subtree(
        &self,
        children: &[IndexEntry<Self::Region>],
        entry: &Self::Entry,
    ) -> Vec<usize>;

    /// Adds an entry to a leaf.
    fn place(&self, entries: &mut Vec<Self::Entry>, entry: Self::Entry) -> TreeResult<()>;

    /// Children that may hold the probed entry, in visiting order.
    fn probe_children(
        &self,
        children: &[IndexEntry<Self::Region>],
        probe: &Self::Probe,
    ) -> Vec<usize>;

    /// Position of the probed entry inside a leaf.
    fn find(&self, entries: &[Self::Entry], probe: &Self::Probe) -> Option<usize>;

    /// Children a query has to visit, in result order.
    fn query_children(
        &self,
        children: &[IndexEntry<Self::Region>],
        query: &Self::Query,
    ) -> Vec<usize>;

    fn matches(&self, entry: &Self::Entry, query: &Self::Query) -> bool;

    /// Reorders leaf entries before a split or redistribution.
    fn order_entries(&self, _entries: &mut [Self::Entry]) {}

    /// Reorders children before a split or redistribution.
    fn order_children(&self, _children: &mut [IndexEntry<Self::Region>]) {}

    /// Fixed-width key images used by curve-based split strategies.
    fn entry_curve_bits(&self, entries: &[Self::Entry]) -> Vec<u64>;

    fn child_curve_bits(&self, children: &[IndexEntry<Self::Region>]) -> Vec<u64>;

    /// Whether a stored region correctly describes a subtree whose actual
    /// region is `actual`.
    fn covers(&self, recorded: &Self::Region, actual: &Self::Region) -> bool;

    /// Ordering violations inside a run of consecutive leaf entries.
    fn check_entries(&self, _entries: &[Self::Entry]) -> Option<String> {
        None
    }

    /// Ordering violations among the children of one index node.
    fn check_children(&self, _children: &[IndexEntry<Self::Region>]) -> Option<String> {
        None
    }
}
