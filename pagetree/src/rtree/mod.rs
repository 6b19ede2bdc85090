//! R-Tree over n-dimensional rectangles.
//!
//! Index entries carry the bounding rectangle of their subtree. Rectangles
//! of siblings may overlap, so lookups and removals may descend into more
//! than one child.

mod join;

pub use join::SpatialJoin;

use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::btree::TreeValue;
use crate::buffer::BufferStats;
use crate::container::{Container, PageId};
use crate::converter::{Converter, RectangleConverter};
use crate::curve::z_order_of_center;
use crate::errors::{TreeError, TreeResult};
use crate::region::{Descriptor, Rectangle};
use crate::tree::{
    IndexEntry, IndexPolicy, IntegrityReport, Node, QueryCursor, Tree, TreeParams, TreeStats,
};

/// A rectangle and the value it indexes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialEntry<V> {
    pub rect: Rectangle,
    pub value: V,
}

impl<V> SpatialEntry<V> {
    pub fn new(rect: Rectangle, value: V) -> Self {
        Self { rect, value }
    }
}

pub struct SpatialEntryConverter<V> {
    rect: RectangleConverter,
    value: Arc<dyn Converter<V>>,
}

impl<V> SpatialEntryConverter<V> {
    pub fn new(dims: usize, value: Arc<dyn Converter<V>>) -> Self {
        Self {
            rect: RectangleConverter::new(dims),
            value,
        }
    }
}

impl<V> Converter<SpatialEntry<V>> for SpatialEntryConverter<V> {
    fn write(&self, value: &SpatialEntry<V>, out: &mut Vec<u8>) -> TreeResult<()> {
        self.rect.write(&value.rect, out)?;
        self.value.write(&value.value, out)
    }

    fn read(&self, input: &mut &[u8]) -> TreeResult<SpatialEntry<V>> {
        let rect = self.rect.read(input)?;
        let value = self.value.read(input)?;
        Ok(SpatialEntry::new(rect, value))
    }

    fn max_object_size(&self) -> usize {
        self.rect.max_object_size() + self.value.max_object_size()
    }
}

/// Axis along which the centres of `rects` are spread the widest.
fn widest_axis<'a>(rects: impl Iterator<Item = &'a Rectangle> + Clone, dims: usize) -> usize {
    let mut best = 0;
    let mut best_spread = f64::NEG_INFINITY;
    for d in 0..dims {
        let (lo, hi) = rects
            .clone()
            .map(|r| r.center(d))
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), c| {
                (lo.min(c), hi.max(c))
            });
        if hi - lo > best_spread {
            best = d;
            best_spread = hi - lo;
        }
    }
    best
}

pub struct RTreePolicy<V> {
    dims: usize,
    _marker: PhantomData<fn() -> V>,
}

impl<V> RTreePolicy<V> {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            _marker: PhantomData,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dims
    }

    fn check_dimensions(&self, rect: &Rectangle, what: &str) -> TreeResult<()> {
        if rect.dimensions() != self.dims {
            return Err(TreeError::invariant(format!(
                "{} has {} dimensions, tree has {}",
                what,
                rect.dimensions(),
                self.dims
            )));
        }
        Ok(())
    }

    fn curve_bits<'a>(&self, rects: impl Iterator<Item = &'a Rectangle> + Clone) -> Vec<u64> {
        match Rectangle::union_all(rects.clone()) {
            Some(bounds) => rects.map(|r| z_order_of_center(r, &bounds)).collect(),
            None => Vec::new(),
        }
    }
}

impl<V: TreeValue + PartialEq> IndexPolicy for RTreePolicy<V> {
    type Entry = SpatialEntry<V>;
    type Region = Rectangle;
    type Query = Rectangle;
    type Probe = SpatialEntry<V>;

    fn leaf_region(&self, entries: &[Self::Entry]) -> Option<Rectangle> {
        Rectangle::union_all(entries.iter().map(|e| &e.rect))
    }

    fn index_region(&self, children: &[IndexEntry<Rectangle>]) -> Option<Rectangle> {
        Rectangle::union_all(children.iter().map(|c| &c.region))
    }

    fn validate(&self, entry: &Self::Entry) -> TreeResult<()> {
        self.check_dimensions(&entry.rect, "entry")?;
        let well_formed = entry
            .rect
            .min()
            .iter()
            .zip(entry.rect.max())
            .all(|(lo, hi)| lo.is_finite() && hi.is_finite() && lo <= hi);
        if !well_formed {
            return Err(TreeError::invariant(format!(
                "malformed rectangle {}",
                entry.rect
            )));
        }
        Ok(())
    }

    /// Children needing the least area enlargement, ties broken by the
    /// smaller area.
    fn choose_subtree(&self, children: &[IndexEntry<Rectangle>], entry: &Self::Entry) -> Vec<usize> {
        let costs: Vec<(f64, f64)> = children
            .iter()
            .map(|c| (c.region.enlargement(&entry.rect), c.region.area()))
            .collect();
        let Some(best) = costs
            .iter()
            .copied()
            .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)))
        else {
            return Vec::new();
        };
        costs
            .iter()
            .enumerate()
            .filter(|(_, cost)| **cost == best)
            .map(|(i, _)| i)
            .collect()
    }

    fn place(&self, entries: &mut Vec<Self::Entry>, entry: Self::Entry) -> TreeResult<()> {
        entries.push(entry);
        Ok(())
    }

    fn probe_children(&self, children: &[IndexEntry<Rectangle>], probe: &Self::Probe) -> Vec<usize> {
        children
            .iter()
            .enumerate()
            .filter(|(_, c)| c.region.contains(&probe.rect))
            .map(|(i, _)| i)
            .collect()
    }

    fn find(&self, entries: &[Self::Entry], probe: &Self::Probe) -> Option<usize> {
        entries.iter().position(|e| e == probe)
    }

    fn query_children(&self, children: &[IndexEntry<Rectangle>], query: &Rectangle) -> Vec<usize> {
        children
            .iter()
            .enumerate()
            .filter(|(_, c)| c.region.overlaps(query))
            .map(|(i, _)| i)
            .collect()
    }

    fn matches(&self, entry: &Self::Entry, query: &Rectangle) -> bool {
        entry.rect.overlaps(query)
    }

    fn order_entries(&self, entries: &mut [Self::Entry]) {
        let axis = widest_axis(entries.iter().map(|e| &e.rect), self.dims);
        entries.sort_by(|a, b| a.rect.center(axis).total_cmp(&b.rect.center(axis)));
    }

    fn order_children(&self, children: &mut [IndexEntry<Rectangle>]) {
        let axis = widest_axis(children.iter().map(|c| &c.region), self.dims);
        children.sort_by(|a, b| a.region.center(axis).total_cmp(&b.region.center(axis)));
    }

    fn entry_curve_bits(&self, entries: &[Self::Entry]) -> Vec<u64> {
        self.curve_bits(entries.iter().map(|e| &e.rect))
    }

    fn child_curve_bits(&self, children: &[IndexEntry<Rectangle>]) -> Vec<u64> {
        self.curve_bits(children.iter().map(|c| &c.region))
    }

    fn covers(&self, recorded: &Rectangle, actual: &Rectangle) -> bool {
        recorded.contains(actual)
    }
}

type RTreeCursor<'a, V> = QueryCursor<'a, RTreePolicy<V>>;

/// Spatial index of rectangles with attached values.
pub struct RTree<V: TreeValue + PartialEq> {
    tree: Tree<RTreePolicy<V>>,
}

impl<V: TreeValue + PartialEq> RTree<V> {
    /// Opens a `dims`-dimensional R-Tree in `container`.
    pub fn open(
        container: Arc<dyn Container>,
        dims: usize,
        value_converter: Arc<dyn Converter<V>>,
        params: TreeParams,
    ) -> TreeResult<Self> {
        if dims == 0 {
            return Err(TreeError::configuration("an R-Tree needs at least one dimension"));
        }
        let tree = Tree::open(
            RTreePolicy::new(dims),
            container,
            Arc::new(SpatialEntryConverter::new(dims, value_converter)),
            Arc::new(RectangleConverter::new(dims)),
            params,
        )?;
        Ok(Self { tree })
    }

    pub fn dimensions(&self) -> usize {
        self.tree.policy().dimensions()
    }

    pub fn insert(&mut self, rect: Rectangle, value: V) -> TreeResult<()> {
        self.tree.insert(SpatialEntry::new(rect, value))
    }

    /// Inserts a batch ordered by the Z-order value of the rectangle centres,
    /// so that neighbouring entries end up in the same leaves.
    pub fn bulk_load<I>(&mut self, entries: I) -> TreeResult<()>
    where
        I: IntoIterator<Item = (Rectangle, V)>,
    {
        let entries: Vec<SpatialEntry<V>> = entries
            .into_iter()
            .map(|(rect, value)| SpatialEntry::new(rect, value))
            .collect();
        for entry in &entries {
            self.tree.policy().validate(entry)?;
        }
        let Some(bounds) = Rectangle::union_all(entries.iter().map(|e| &e.rect)) else {
            return Ok(());
        };

        let mut keyed: Vec<(u64, SpatialEntry<V>)> = entries
            .into_iter()
            .map(|e| (z_order_of_center(&e.rect, &bounds), e))
            .collect();
        keyed.sort_by_key(|(z, _)| *z);

        for (_, entry) in keyed {
            self.tree.insert(entry)?;
        }
        Ok(())
    }

    /// Removes one entry with exactly this rectangle and value.
    pub fn remove(&mut self, rect: &Rectangle, value: &V) -> TreeResult<bool> {
        let probe = SpatialEntry::new(rect.clone(), value.clone());
        Ok(self.tree.remove(&probe)?.is_some())
    }

    pub fn contains(&self, rect: &Rectangle, value: &V) -> TreeResult<bool> {
        let probe = SpatialEntry::new(rect.clone(), value.clone());
        Ok(self.tree.lookup(&probe)?.is_some())
    }

    /// Entries whose rectangle overlaps `window`.
    pub fn query(&self, window: Rectangle) -> TreeResult<RTreeCursor<'_, V>> {
        self.tree.policy().check_dimensions(&window, "query window")?;
        self.tree.query(window)
    }

    pub fn iter(&self) -> TreeResult<RTreeCursor<'_, V>> {
        self.tree.entries()
    }

    /// The `k` entries closest to `point`, nearest first, together with
    /// their distance.
    ///
    /// # Arguments
    /// * `point` - query coordinates, one per dimension
    /// * `k` - maximum number of results
    /// * `max_distance` - optional cut-off radius
    pub fn nearest(
        &self,
        point: &[f64],
        k: usize,
        max_distance: Option<f64>,
    ) -> TreeResult<Vec<(SpatialEntry<V>, f64)>> {
        if point.len() != self.dimensions() {
            return Err(TreeError::invariant(format!(
                "query point has {} dimensions, tree has {}",
                point.len(),
                self.dimensions()
            )));
        }
        let mut results = Vec::new();
        if k == 0 {
            return Ok(results);
        }
        let mut bound = max_distance.unwrap_or(f64::INFINITY);
        self.nearest_in(self.tree.root_page(), point, k, &mut results, &mut bound)?;
        Ok(results)
    }

    fn nearest_in(
        &self,
        page: PageId,
        point: &[f64],
        k: usize,
        results: &mut Vec<(SpatialEntry<V>, f64)>,
        bound: &mut f64,
    ) -> TreeResult<()> {
        match self.tree.read_node(page)? {
            Node::Leaf { entries } => {
                for entry in entries {
                    let dist = entry.rect.min_distance(point);
                    if dist > *bound {
                        continue;
                    }
                    let at = results.partition_point(|(_, d)| *d <= dist);
                    results.insert(at, (entry, dist));
                    if results.len() > k {
                        results.truncate(k);
                    }
                    if results.len() == k {
                        if let Some((_, kth)) = results.last() {
                            *bound = (*kth).min(*bound);
                        }
                    }
                }
            }
            Node::Index { children, .. } => {
                let mut candidates: Vec<(PageId, f64)> = children
                    .iter()
                    .map(|c| (c.child, c.region.min_distance(point)))
                    .collect();
                candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
                for (child, dist) in candidates {
                    if dist > *bound {
                        break;
                    }
                    self.nearest_in(child, point, k, results, bound)?;
                }
            }
        }
        Ok(())
    }

    /// Pairs of entries from `self` and `other` whose rectangles overlap.
    pub fn join<'a, W: TreeValue + PartialEq>(
        &'a self,
        other: &'a RTree<W>,
    ) -> TreeResult<SpatialJoin<'a, V, W>> {
        SpatialJoin::new(&self.tree, &other.tree)
    }

    pub fn len(&self) -> u64 {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn height(&self) -> u32 {
        self.tree.height()
    }

    /// Bounding box of every entry, `None` when empty.
    pub fn root_descriptor(&self) -> TreeResult<Option<Rectangle>> {
        self.tree.root_descriptor()
    }

    pub fn check_integrity(&self) -> TreeResult<IntegrityReport> {
        self.tree.check_integrity()
    }

    pub fn stats(&self) -> TreeStats {
        self.tree.stats()
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.tree.stats().buffer
    }

    pub fn flush(&self) -> TreeResult<()> {
        self.tree.flush()
    }

    pub fn close(&mut self) -> TreeResult<()> {
        self.tree.close()
    }

    pub fn inner(&self) -> &Tree<RTreePolicy<V>> {
        &self.tree
    }
}
