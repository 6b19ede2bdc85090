//! Multi-version B-Tree.
//!
//! Every entry carries a [`Lifespan`]; every index entry carries the key
//! range and lifespan of its subtree. Mutations happen at the newest version
//! only, while queries may address any version that ever existed.
//!
//! ## Structural changes
//! Nodes are modified in place only by adding entries or closing lifespans.
//! A node that overflows its capacity, or (non-root) keeps fewer than
//! `weak_min` alive entries, is *version split*: its alive entries are copied
//! into a fresh node valid from the current version and the old node is left
//! untouched for historical queries. A copy with fewer than `strong_min`
//! entries is merged with the copy of an adjacent sibling; a copy with more
//! than `strong_max` entries is split by key.
//!
//! The roots that served the tree over time are kept in a root history.

mod cursor;
mod entry;

pub use cursor::MvQueryCursor;
pub use entry::{MvEntry, MvEntryConverter, RootRecord};

use std::collections::btree_map::Entry as MapEntry;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use log::{debug, error};
use serde::{Deserialize, Serialize};

use crate::btree::{TreeKey, TreeValue};
use crate::constants::{CHILD_REF_SIZE, MVBT_META_MAGIC};
use crate::container::{Container, PageId};
use crate::converter::{Converter, MvRegionConverter};
use crate::curve::separator_bits;
use crate::errors::{ErrorKind, TreeError, TreeResult};
use crate::region::{KeyRange, Lifespan, MvRegion, Separator, Version};
use crate::tree::{
    IndexEntry, IntegrityReport, Node, NodeConverter, NodeStore, SplitItem, SplitStrategy,
    TreeParams, TreeStats,
};

type MvNode<K, V> = Node<MvEntry<K, V>, MvRegion<K>>;
type MvChild<K> = IndexEntry<MvRegion<K>>;

/// Occupancy thresholds of one node kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLimits {
    pub capacity: usize,
    /// Fewest alive entries a live non-root node may keep
    pub weak_min: usize,
    /// Fewest entries a fresh version copy should start with
    pub strong_min: usize,
    /// Most entries a fresh version copy may start with
    pub strong_max: usize,
}

impl NodeLimits {
    pub fn new(capacity: usize, min_ratio: f64) -> Self {
        let weak_min = ((min_ratio * capacity as f64).ceil() as usize).max(1);
        let eps = (weak_min / 2).max(1);
        Self {
            capacity,
            weak_min,
            strong_min: weak_min + eps,
            strong_max: capacity.saturating_sub(eps),
        }
    }

    fn validate(&self, kind: &str) -> TreeResult<()> {
        if self.strong_min > self.strong_max || 2 * self.weak_min > self.strong_max + 1 {
            return Err(TreeError::configuration(format!(
                "{} capacity {} is too small for weak minimum {} (strong bounds {}..{})",
                kind, self.capacity, self.weak_min, self.strong_min, self.strong_max
            )));
        }
        Ok(())
    }
}

/// Persisted MVBT metadata (page 0)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct MvbtMeta {
    magic: u32,
    min_ratio: f64,
    block_size: u32,
    leaf_capacity: u32,
    index_capacity: u32,
    /// Entries alive at the newest version
    entry_count: u64,
    last_version: Version,
    /// Pages holding the encoded root history
    history_pages: Vec<PageId>,
}

impl MvbtMeta {
    fn check_compatible(&self, params: &TreeParams) -> TreeResult<()> {
        if self.magic != MVBT_META_MAGIC {
            return Err(TreeError::Serialization(format!(
                "invalid MVBT metadata magic {:#x}",
                self.magic
            )));
        }
        if self.block_size as usize != params.block_size
            || self.leaf_capacity as usize != params.leaf_capacity
            || self.index_capacity as usize != params.index_capacity
        {
            return Err(TreeError::configuration(format!(
                "MVBT was created with block size {} and capacities {}/{}, \
                 reopened with {} and {}/{}",
                self.block_size,
                self.leaf_capacity,
                self.index_capacity,
                params.block_size,
                params.leaf_capacity,
                params.index_capacity
            )));
        }
        Ok(())
    }
}

/// A fixed page on a mutation path with the key range it covers
struct MvFrame<K, V> {
    page: PageId,
    node: MvNode<K, V>,
    range: KeyRange<K>,
}

fn alive_count<K, V>(node: &MvNode<K, V>) -> usize {
    match node {
        Node::Leaf { entries } => entries.iter().filter(|e| e.lifespan.is_open()).count(),
        Node::Index { children, .. } => children
            .iter()
            .filter(|c| c.region.lifespan.is_open())
            .count(),
    }
}

/// The alive content of a node, in key order.
fn alive_copy<K: Ord, V>(node: MvNode<K, V>) -> MvNode<K, V> {
    match node {
        Node::Leaf { entries } => Node::Leaf {
            entries: entries
                .into_iter()
                .filter(|e| e.lifespan.is_open())
                .collect(),
        },
        Node::Index { level, children } => Node::Index {
            level,
            children: children
                .into_iter()
                .filter(|c| c.region.lifespan.is_open())
                .collect(),
        },
    }
}

fn order_by_key<K: Ord, V>(node: &mut MvNode<K, V>) {
    match node {
        Node::Leaf { entries } => {
            entries.sort_by(|a, b| (&a.key, a.lifespan.insert).cmp(&(&b.key, b.lifespan.insert)))
        }
        Node::Index { children, .. } => children.sort_by(|a, b| {
            (&a.region.range.min, a.region.lifespan.insert)
                .cmp(&(&b.region.range.min, b.region.lifespan.insert))
        }),
    }
}

/// Inserts a child entry keeping `(range.min, insert version)` order.
fn insert_child<K: Ord>(children: &mut Vec<MvChild<K>>, child: MvChild<K>) {
    let key = (&child.region.range.min, child.region.lifespan.insert);
    let at = children.partition_point(|c| (&c.region.range.min, c.region.lifespan.insert) <= key);
    children.insert(at, child);
}

/// A lifespan that covers no version at all.
fn is_void(lifespan: &Lifespan) -> bool {
    lifespan.delete.map_or(false, |d| d <= lifespan.insert)
}

/// Multi-version B-Tree with unique alive keys.
pub struct Mvbt<K: TreeKey, V: TreeValue> {
    store: NodeStore<MvEntry<K, V>, MvRegion<K>>,
    meta: MvbtMeta,
    roots: Vec<RootRecord>,
    roots_dirty: bool,
    leaf_limits: NodeLimits,
    index_limits: NodeLimits,
    leaf_split: Arc<dyn SplitStrategy>,
    index_split: Arc<dyn SplitStrategy>,
    closed: bool,
}

impl<K: TreeKey, V: TreeValue> Mvbt<K, V> {
    /// Opens the MVBT stored in `container`, creating it when the container
    /// is empty.
    pub fn open(
        container: Arc<dyn Container>,
        key_converter: Arc<dyn Converter<K>>,
        value_converter: Arc<dyn Converter<V>>,
        params: TreeParams,
    ) -> TreeResult<Self> {
        params.validate()?;
        let leaf_limits = NodeLimits::new(params.leaf_capacity, params.min_ratio);
        let index_limits = NodeLimits::new(params.index_capacity, params.min_ratio);
        leaf_limits.validate("leaf")?;
        index_limits.validate("index")?;

        let page_size = container
            .max_page_size()
            .map_or(params.block_size, |max| max.min(params.block_size));
        let codec = Arc::new(NodeConverter::new(
            Arc::new(MvEntryConverter::new(key_converter.clone(), value_converter)),
            Arc::new(MvRegionConverter::new(key_converter)),
            params.leaf_capacity,
            params.index_capacity,
        ));
        if codec.max_object_size() > page_size {
            return Err(TreeError::configuration(format!(
                "a full node needs {} bytes but pages hold {}",
                codec.max_object_size(),
                page_size
            )));
        }

        let store = NodeStore::new(container, codec, params.buffer_size, page_size);
        let reopened = store.has_meta();
        let (meta, roots) = if reopened {
            let meta: MvbtMeta = store.read_meta()?;
            meta.check_compatible(&params)?;
            let bytes = store.read_chunked(&meta.history_pages)?;
            let (roots, _): (Vec<RootRecord>, usize) =
                bincode::serde::decode_from_slice(&bytes, bincode::config::legacy())?;
            if roots.is_empty() {
                return Err(TreeError::Serialization("empty root history".into()));
            }
            debug!(
                "Reopened MVBT at {} with {} roots and {} alive entries",
                meta.last_version,
                roots.len(),
                meta.entry_count
            );
            (meta, roots)
        } else {
            store.bootstrap_meta()?;
            let root = store.allocate(Node::empty_leaf())?;
            let meta = MvbtMeta {
                magic: MVBT_META_MAGIC,
                min_ratio: params.min_ratio,
                block_size: params.block_size as u32,
                leaf_capacity: params.leaf_capacity as u32,
                index_capacity: params.index_capacity as u32,
                entry_count: 0,
                last_version: Version::default(),
                history_pages: Vec::new(),
            };
            let roots = vec![RootRecord {
                lifespan: Lifespan::starting_at(Version::default()),
                page: root,
                height: 1,
            }];
            (meta, roots)
        };

        let mut tree = Self {
            store,
            meta,
            roots,
            roots_dirty: !reopened,
            leaf_limits,
            index_limits,
            leaf_split: params.leaf_split,
            index_split: params.index_split,
            closed: false,
        };
        if !reopened {
            tree.persist_meta()?;
        }
        Ok(tree)
    }

    /// Entries alive at the newest version.
    pub fn len(&self) -> u64 {
        self.meta.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.meta.entry_count == 0
    }

    /// Height of the current root.
    pub fn height(&self) -> u32 {
        self.roots.last().map_or(0, |r| r.height)
    }

    /// Newest version seen by a mutation.
    pub fn current_version(&self) -> Version {
        self.meta.last_version
    }

    pub fn root_history(&self) -> &[RootRecord] {
        &self.roots
    }

    pub fn leaf_limits(&self) -> NodeLimits {
        self.leaf_limits
    }

    pub fn index_limits(&self) -> NodeLimits {
        self.index_limits
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn stats(&self) -> TreeStats {
        TreeStats {
            entry_count: self.meta.entry_count,
            height: self.height(),
            leaf_capacity: self.leaf_limits.capacity,
            index_capacity: self.index_limits.capacity,
            buffer: self.store.buffer_stats(),
        }
    }

    fn check_closed(&self) -> TreeResult<()> {
        if self.closed {
            Err(TreeError::InvalidState("tree is closed".into()))
        } else {
            Ok(())
        }
    }

    fn check_version(&self, v: Version) -> TreeResult<()> {
        if v < self.meta.last_version {
            return Err(TreeError::invariant(format!(
                "version {} precedes the current version {}",
                v, self.meta.last_version
            )));
        }
        Ok(())
    }

    pub(crate) fn read_node(&self, page: PageId) -> TreeResult<MvNode<K, V>> {
        self.check_closed()?;
        self.store.read(page)
    }

    fn limits(&self, node: &MvNode<K, V>) -> NodeLimits {
        if node.is_leaf() {
            self.leaf_limits
        } else {
            self.index_limits
        }
    }

    fn current_root(&self) -> TreeResult<RootRecord> {
        self.roots
            .last()
            .copied()
            .ok_or_else(|| TreeError::invariant("root history is empty"))
    }

    /// The root that served version `at`, if the tree existed then.
    fn root_at(&self, at: Version) -> Option<&RootRecord> {
        self.roots.iter().rev().find(|r| r.lifespan.alive_at(at))
    }

    /// Inserts `key` at version `v`. The key must not be alive already.
    pub fn insert(&mut self, key: K, value: V, v: Version) -> TreeResult<()> {
        self.check_closed()?;
        self.check_version(v)?;

        let mut path = Vec::new();
        let result = self.insert_along(&mut path, key, value, v);
        self.release(&mut path);
        result?;

        self.meta.entry_count += 1;
        self.meta.last_version = v;
        self.persist_meta()
    }

    /// Ends the lifespan of `key` at version `v` and returns its value,
    /// `Ok(None)` when the key is not alive.
    pub fn delete(&mut self, key: &K, v: Version) -> TreeResult<Option<V>> {
        self.check_closed()?;
        self.check_version(v)?;

        let mut path = Vec::new();
        let result = self.delete_along(&mut path, key, v);
        self.release(&mut path);
        let removed = result?;

        self.meta.last_version = v;
        if removed.is_some() {
            self.meta.entry_count = self.meta.entry_count.saturating_sub(1);
        }
        self.persist_meta()?;
        Ok(removed)
    }

    /// Replaces the value of `key` at version `v`, inserting it when absent.
    /// Returns the previous value.
    pub fn update(&mut self, key: K, value: V, v: Version) -> TreeResult<Option<V>> {
        let previous = self.delete(&key, v)?;
        self.insert(key, value, v)?;
        Ok(previous)
    }

    /// Value of `key` at version `at`.
    pub fn lookup(&self, key: &K, at: Version) -> TreeResult<Option<V>> {
        self.check_closed()?;
        let Some(root) = self.root_at(at) else {
            return Ok(None);
        };
        let mut page = root.page;
        loop {
            match self.store.read(page)? {
                Node::Leaf { entries } => {
                    return Ok(entries
                        .into_iter()
                        .find(|e| e.key == *key && e.alive_at(at))
                        .map(|e| e.value))
                }
                Node::Index { children, .. } => {
                    let next = children
                        .iter()
                        .find(|c| c.region.alive_at(at) && c.region.range.contains_key(key));
                    match next {
                        Some(child) => page = child.child,
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    /// Value of `key` at the newest version.
    pub fn get(&self, key: &K) -> TreeResult<Option<V>> {
        self.lookup(key, self.meta.last_version)
    }

    /// Entries alive at version `at` with keys in `range`, in key order.
    pub fn query(&self, range: KeyRange<K>, at: Version) -> TreeResult<MvQueryCursor<'_, K, V>> {
        self.check_closed()?;
        let root = self.root_at(at).map(|r| r.page);
        Ok(MvQueryCursor::new(self, range, at, root))
    }

    /// Every lifespan `key` was alive in, with the value it had, oldest
    /// first.
    pub fn history(&self, key: &K) -> TreeResult<Vec<(Lifespan, V)>> {
        self.check_closed()?;

        let mut seen = HashSet::new();
        let mut found: BTreeMap<Version, (Lifespan, V)> = BTreeMap::new();
        let mut stack: Vec<(PageId, Lifespan)> =
            self.roots.iter().map(|r| (r.page, r.lifespan)).collect();

        while let Some((page, span)) = stack.pop() {
            if is_void(&span) || !seen.insert((page, span)) {
                continue;
            }
            match self.store.read(page)? {
                Node::Leaf { entries } => {
                    for entry in entries.into_iter().filter(|e| e.key == *key) {
                        let lifespan = entry.lifespan.clip(&span);
                        if is_void(&lifespan) {
                            continue;
                        }
                        match found.entry(lifespan.insert) {
                            MapEntry::Vacant(slot) => {
                                slot.insert((lifespan, entry.value));
                            }
                            MapEntry::Occupied(mut slot) => {
                                let longer = match (lifespan.delete, slot.get().0.delete) {
                                    (None, _) => true,
                                    (Some(_), None) => false,
                                    (Some(a), Some(b)) => a > b,
                                };
                                if longer {
                                    slot.insert((lifespan, entry.value));
                                }
                            }
                        }
                    }
                }
                Node::Index { children, .. } => {
                    for child in children {
                        if child.region.range.contains_key(key) {
                            stack.push((child.child, child.region.lifespan.clip(&span)));
                        }
                    }
                }
            }
        }
        Ok(found.into_values().collect())
    }

    /// Persists the metadata and writes dirty pages.
    pub fn flush(&self) -> TreeResult<()> {
        self.check_closed()?;
        self.store.write_meta(&self.meta)?;
        self.store.flush()
    }

    pub fn close(&mut self) -> TreeResult<()> {
        self.check_closed()?;
        self.persist_meta()?;
        self.store.flush()?;
        self.closed = true;
        debug!("Closed MVBT at {}", self.meta.last_version);
        Ok(())
    }

    fn persist_meta(&mut self) -> TreeResult<()> {
        if self.roots_dirty {
            let bytes = bincode::serde::encode_to_vec(&self.roots, bincode::config::legacy())?;
            self.meta.history_pages = self.store.write_chunked(&bytes, &self.meta.history_pages)?;
            self.roots_dirty = false;
        }
        self.store.write_meta(&self.meta)
    }

    fn pop_frame(&self, path: &mut Vec<MvFrame<K, V>>) -> TreeResult<Option<MvFrame<K, V>>> {
        match path.pop() {
            Some(frame) => {
                self.store.unfix(frame.page)?;
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    fn release(&self, path: &mut Vec<MvFrame<K, V>>) {
        for frame in path.drain(..) {
            if let Err(e) = self.store.unfix(frame.page) {
                error!("Failed to unfix page {}: {}", frame.page, e);
            }
        }
    }

    /// Fixes the live path from the current root to the leaf responsible
    /// for `key`.
    fn descend(&self, path: &mut Vec<MvFrame<K, V>>, key: &K) -> TreeResult<()> {
        let mut page = self.current_root()?.page;
        let mut range = KeyRange::all();
        loop {
            let node = self.store.fix(page)?;
            path.push(MvFrame { page, node, range });
            let Some(frame) = path.last() else {
                return Err(TreeError::invariant("mutation path is empty"));
            };
            let Node::Index { children, .. } = &frame.node else {
                return Ok(());
            };
            let child = children
                .iter()
                .find(|c| c.region.lifespan.is_open() && c.region.range.contains_key(key))
                .ok_or_else(|| {
                    TreeError::invariant(format!(
                        "no live subtree of page {} covers key {:?}",
                        frame.page, key
                    ))
                })?;
            page = child.child;
            range = child.region.range.clone();
        }
    }

    fn pop_leaf(
        &self,
        path: &mut Vec<MvFrame<K, V>>,
    ) -> TreeResult<(MvFrame<K, V>, Vec<MvEntry<K, V>>)> {
        let frame = self
            .pop_frame(path)?
            .ok_or_else(|| TreeError::invariant("mutation path is empty"))?;
        match frame.node {
            Node::Leaf { entries } => Ok((
                MvFrame {
                    page: frame.page,
                    node: Node::empty_leaf(),
                    range: frame.range,
                },
                entries,
            )),
            Node::Index { .. } => Err(TreeError::invariant(
                "mutation path does not end in a leaf",
            )),
        }
    }

    fn insert_along(
        &mut self,
        path: &mut Vec<MvFrame<K, V>>,
        key: K,
        value: V,
        v: Version,
    ) -> TreeResult<()> {
        self.descend(path, &key)?;
        let (mut leaf, mut entries) = self.pop_leaf(path)?;

        if entries.iter().any(|e| e.key == key && e.lifespan.is_open()) {
            return Err(TreeError::invariant(format!(
                "key {:?} is already alive",
                key
            )));
        }
        let at = entries.partition_point(|e| (&e.key, e.lifespan.insert) <= (&key, v));
        entries.insert(at, MvEntry::new(key, Lifespan::starting_at(v), value));

        leaf.node = Node::Leaf { entries };
        self.settle(path, leaf, v)
    }

    fn delete_along(
        &mut self,
        path: &mut Vec<MvFrame<K, V>>,
        key: &K,
        v: Version,
    ) -> TreeResult<Option<V>> {
        self.descend(path, key)?;
        let (mut leaf, mut entries) = self.pop_leaf(path)?;

        let Some(at) = entries
            .iter()
            .position(|e| e.key == *key && e.lifespan.is_open())
        else {
            return Ok(None);
        };
        let removed = if entries[at].lifespan.insert == v {
            // never visible to any version
            entries.remove(at)
        } else {
            entries[at].lifespan.close(v);
            entries[at].clone()
        };

        leaf.node = Node::Leaf { entries };
        self.settle(path, leaf, v)?;
        Ok(Some(removed.value))
    }

    /// Writes a modified node back, restructuring it and its ancestors as
    /// long as they leave their occupancy bounds.
    fn settle(
        &mut self,
        path: &mut Vec<MvFrame<K, V>>,
        mut frame: MvFrame<K, V>,
        v: Version,
    ) -> TreeResult<()> {
        loop {
            if path.is_empty() {
                return self.settle_root(frame, v);
            }
            let limits = self.limits(&frame.node);
            if frame.node.len() <= limits.capacity && alive_count(&frame.node) >= limits.weak_min {
                return self.store.write(frame.page, frame.node);
            }

            let parent = self
                .pop_frame(path)?
                .ok_or_else(|| TreeError::invariant("mutation path is empty"))?;
            let Node::Index {
                level,
                mut children,
            } = parent.node
            else {
                return Err(TreeError::invariant("leaf found above leaf level"));
            };
            self.version_split(&mut children, frame, v)?;
            frame = MvFrame {
                page: parent.page,
                node: Node::Index { level, children },
                range: parent.range,
            };
        }
    }

    /// Replaces a child by the version copy of its alive entries, merged
    /// with an adjacent sibling or split by key as needed.
    fn version_split(
        &mut self,
        children: &mut Vec<MvChild<K>>,
        frame: MvFrame<K, V>,
        v: Version,
    ) -> TreeResult<()> {
        let limits = self.limits(&frame.node);
        debug!(
            "Version split of page {} at {}: {} of {} entries alive",
            frame.page,
            v,
            alive_count(&frame.node),
            frame.node.len()
        );
        let mut content = alive_copy(frame.node);
        let mut range = frame.range;
        self.retire(children, frame.page, v)?;

        if content.len() < limits.strong_min {
            let sibling = children
                .iter()
                .find(|c| {
                    c.region.lifespan.is_open()
                        && (c.region.range.max == range.min || c.region.range.min == range.max)
                })
                .map(|c| (c.child, c.region.range.clone()));
            if let Some((page, sibling_range)) = sibling {
                debug!("Merging version copy of page {} with page {}", frame.page, page);
                content.append(alive_copy(self.store.read(page)?))?;
                order_by_key(&mut content);
                range = KeyRange::new(
                    std::cmp::min(range.min, sibling_range.min),
                    std::cmp::max(range.max, sibling_range.max),
                );
                self.retire(children, page, v)?;
            }
        }
        if content.is_empty() {
            // sole child without alive entries; the parent underflows next
            // and its range is absorbed one level up
            debug!("Dropping empty version copy of page {}", frame.page);
            return Ok(());
        }
        self.cover_range(&mut content, &range, v)?;

        for (range, node) in self.key_split(content, range)? {
            let page = self.store.allocate(node)?;
            insert_child(
                children,
                IndexEntry::new(MvRegion::new(range, Lifespan::starting_at(v)), page),
            );
        }
        Ok(())
    }

    /// Stretches the edge children of a version copy until its alive
    /// children cover `range` again. Needed once an empty neighbour was
    /// absorbed by a merge. Edge subtrees are copied at `v` all the way
    /// down, leaves only get a wider parent entry.
    fn cover_range(
        &mut self,
        content: &mut MvNode<K, V>,
        range: &KeyRange<K>,
        v: Version,
    ) -> TreeResult<()> {
        let Node::Index { children, .. } = content else {
            return Ok(());
        };
        let (Some(first), Some(last)) = (children.first(), children.last()) else {
            return Err(TreeError::invariant("version copy without alive children"));
        };
        let (widen_first, widen_last) =
            (first.region.range.min > range.min, last.region.range.max < range.max);
        if widen_first {
            let min = range.min.clone();
            self.widen_child(&mut children[0], Some(min), None, v)?;
        }
        if widen_last {
            let max = range.max.clone();
            let at = children.len() - 1;
            self.widen_child(&mut children[at], None, Some(max), v)?;
        }
        Ok(())
    }

    fn widen_child(
        &mut self,
        child: &mut MvChild<K>,
        min: Option<Separator<K>>,
        max: Option<Separator<K>>,
        v: Version,
    ) -> TreeResult<()> {
        let old = &child.region.range;
        let range = KeyRange::new(
            min.unwrap_or_else(|| old.min.clone()),
            max.unwrap_or_else(|| old.max.clone()),
        );
        debug!(
            "Widening page {} from {:?} to {:?} at {}",
            child.child, child.region.range, range, v
        );

        let node = self.store.read(child.child)?;
        if node.is_leaf() {
            child.region.range = range;
            return Ok(());
        }

        let mut copy = alive_copy(node);
        self.cover_range(&mut copy, &range, v)?;
        let page = self.store.allocate(copy)?;
        if child.region.lifespan.insert == v {
            self.store.free(child.child)?;
        }
        *child = IndexEntry::new(MvRegion::new(range, Lifespan::starting_at(v)), page);
        Ok(())
    }

    /// Ends the parent entry of `page` at `v`. A subtree that was created
    /// at `v` is dropped instead, as no version ever saw it.
    fn retire(&mut self, children: &mut Vec<MvChild<K>>, page: PageId, v: Version) -> TreeResult<()> {
        let at = children
            .iter()
            .position(|c| c.child == page && c.region.lifespan.is_open())
            .ok_or_else(|| TreeError::invariant(format!("page {} has no live parent entry", page)))?;
        if children[at].region.lifespan.insert == v {
            children.remove(at);
            self.store.free(page)
        } else {
            children[at].region.lifespan.close(v);
            Ok(())
        }
    }

    /// Splits a version copy by key when it exceeds `strong_max`.
    fn key_split(
        &self,
        content: MvNode<K, V>,
        range: KeyRange<K>,
    ) -> TreeResult<Vec<(KeyRange<K>, MvNode<K, V>)>> {
        let limits = self.limits(&content);
        if content.len() <= limits.strong_max {
            return Ok(vec![(range, content)]);
        }

        let at = self.key_split_point(&content, limits)?;
        let mut left = content;
        let right = left.split_off(at);
        let boundary = match &right {
            Node::Leaf { entries } => entries
                .first()
                .map(|e| Separator::Value(e.key.clone())),
            Node::Index { children, .. } => children.first().map(|c| c.region.range.min.clone()),
        }
        .ok_or_else(|| TreeError::invariant("key split produced an empty node"))?;

        debug!(
            "Key split at {:?}: {} + {} entries",
            boundary,
            left.len(),
            right.len()
        );
        Ok(vec![
            (KeyRange::new(range.min, boundary.clone()), left),
            (KeyRange::new(boundary, range.max), right),
        ])
    }

    fn key_split_point(&self, content: &MvNode<K, V>, limits: NodeLimits) -> TreeResult<usize> {
        let len = content.len();
        let (items, strategy) = match content {
            Node::Leaf { entries } => {
                let converter = self.store.codec().entry_converter();
                let items = entries
                    .iter()
                    .map(|e| {
                        Ok(SplitItem {
                            size: converter.serialized_size(e)?,
                            curve_bits: e.key.curve_bits(),
                        })
                    })
                    .collect::<TreeResult<Vec<_>>>()?;
                (items, &self.leaf_split)
            }
            Node::Index { children, .. } => {
                let converter = self.store.codec().region_converter();
                let items = children
                    .iter()
                    .map(|c| {
                        Ok(SplitItem {
                            size: converter.serialized_size(&c.region)? + CHILD_REF_SIZE,
                            curve_bits: separator_bits(&c.region.range.min),
                        })
                    })
                    .collect::<TreeResult<Vec<_>>>()?;
                (items, &self.index_split)
            }
        };
        let at = strategy.split_point(&items, limits.weak_min);
        // both halves must fit a page
        let lo = len.saturating_sub(limits.capacity).max(1);
        let hi = limits.capacity.min(len - 1);
        Ok(at.max(lo).min(hi))
    }

    fn settle_root(&mut self, frame: MvFrame<K, V>, v: Version) -> TreeResult<()> {
        let root = self.current_root()?;
        let limits = self.limits(&frame.node);

        if !frame.node.is_leaf() && alive_count(&frame.node) == 0 {
            let page = self.store.allocate(Node::empty_leaf())?;
            return self.replace_root(page, 1, v);
        }

        if frame.node.len() > limits.capacity {
            debug!("Version split of root page {} at {}", frame.page, v);
            let mut pieces = self.key_split(alive_copy(frame.node), KeyRange::all())?;
            if pieces.len() == 1 {
                let Some((_, node)) = pieces.pop() else {
                    return Err(TreeError::invariant("root copy vanished"));
                };
                if let Some(child) = self.sole_alive_child(&node) {
                    return self.collapse_root(Some(child), root.height, v);
                }
                let page = self.store.allocate(node)?;
                return self.replace_root(page, root.height, v);
            }
            let mut children = Vec::with_capacity(pieces.len());
            for (range, node) in pieces {
                let page = self.store.allocate(node)?;
                children.push(IndexEntry::new(
                    MvRegion::new(range, Lifespan::starting_at(v)),
                    page,
                ));
            }
            let page = self.store.allocate(Node::Index {
                level: root.height,
                children,
            })?;
            return self.replace_root(page, root.height + 1, v);
        }

        let sole = self.sole_alive_child(&frame.node);
        self.store.write(frame.page, frame.node)?;
        self.collapse_root(sole, root.height, v)
    }

    /// Hands the root over to its only alive child for as long as there is
    /// one.
    fn collapse_root(
        &mut self,
        mut sole: Option<PageId>,
        mut height: u32,
        v: Version,
    ) -> TreeResult<()> {
        while let Some(child) = sole {
            height -= 1;
            self.replace_root(child, height, v)?;
            sole = match self.store.read(child)? {
                node @ Node::Index { .. } => self.sole_alive_child(&node),
                Node::Leaf { .. } => None,
            };
        }
        Ok(())
    }

    fn sole_alive_child(&self, node: &MvNode<K, V>) -> Option<PageId> {
        let Node::Index { children, .. } = node else {
            return None;
        };
        let mut alive = children.iter().filter(|c| c.region.lifespan.is_open());
        match (alive.next(), alive.next()) {
            (Some(child), None) => Some(child.child),
            _ => None,
        }
    }

    fn replace_root(&mut self, page: PageId, height: u32, v: Version) -> TreeResult<()> {
        let last = self
            .roots
            .last_mut()
            .ok_or_else(|| TreeError::invariant("root history is empty"))?;
        if last.lifespan.insert == v {
            last.page = page;
            last.height = height;
        } else {
            last.lifespan.close(v);
            self.roots.push(RootRecord {
                lifespan: Lifespan::starting_at(v),
                page,
                height,
            });
        }
        self.roots_dirty = true;
        debug!("Root at {} is page {} with height {}", v, page, height);
        Ok(())
    }

    /// Validates the live tree: key partitioning of alive index entries,
    /// alive key order, capacity, weak minimum and uniform leaf depth.
    pub fn check_integrity(&self) -> TreeResult<IntegrityReport> {
        self.check_closed()?;
        let root = self.current_root()?;
        let mut report = IntegrityReport::new();
        self.check_live(
            root.page,
            &KeyRange::all(),
            root.height.saturating_sub(1),
            true,
            &mut report,
        )?;
        if report.entries != self.meta.entry_count {
            report.fail(format!(
                "metadata counts {} alive entries, leaves hold {}",
                self.meta.entry_count, report.entries
            ));
        }
        Ok(report)
    }

    fn check_live(
        &self,
        page: PageId,
        range: &KeyRange<K>,
        level: u32,
        is_root: bool,
        report: &mut IntegrityReport,
    ) -> TreeResult<()> {
        let node = match self.store.read(page) {
            Ok(node) => node,
            Err(e) if e.kind() == ErrorKind::Serialization => {
                report.corrupted_pages.push(page);
                report.fail(format!("Page {}: {}", page, e));
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        report.pages_checked += 1;

        let limits = self.limits(&node);
        let alive = alive_count(&node);
        if node.level() != level {
            report.fail(format!(
                "Page {} sits at level {} but is tagged level {}",
                page,
                level,
                node.level()
            ));
        }
        if node.len() > limits.capacity {
            report.fail(format!(
                "Page {} holds {} entries, capacity is {}",
                page,
                node.len(),
                limits.capacity
            ));
        }
        if is_root && !node.is_leaf() && alive < 2 {
            report.fail(format!(
                "Root page {} is an index node with {} alive children",
                page, alive
            ));
        }
        if !is_root && alive < limits.weak_min {
            report.fail(format!(
                "Page {} keeps {} alive entries, weak minimum is {}",
                page, alive, limits.weak_min
            ));
        }

        match node {
            Node::Leaf { entries } => {
                report.leaf_pages += 1;
                report.entries += alive as u64;
                let keys: Vec<&K> = entries
                    .iter()
                    .filter(|e| e.lifespan.is_open())
                    .map(|e| &e.key)
                    .collect();
                if let Some(pair) = keys.windows(2).find(|p| p[0] >= p[1]) {
                    report.fail(format!(
                        "Page {}: alive keys out of order: {:?} before {:?}",
                        page, pair[0], pair[1]
                    ));
                }
                if let Some(key) = keys.iter().find(|k| !range.contains_key(k)) {
                    report.fail(format!(
                        "Page {}: alive key {:?} outside {:?}",
                        page, key, range
                    ));
                }
            }
            Node::Index { children, .. } => {
                report.index_pages += 1;
                let live: Vec<&MvChild<K>> = children
                    .iter()
                    .filter(|c| c.region.lifespan.is_open())
                    .collect();
                let mut expected = &range.min;
                for child in &live {
                    if child.region.range.min != *expected || child.region.range.is_empty() {
                        report.fail(format!(
                            "Page {}: live child range {:?} does not continue at {:?}",
                            page, child.region.range, expected
                        ));
                    }
                    expected = &child.region.range.max;
                }
                if !live.is_empty() && *expected != range.max {
                    report.fail(format!(
                        "Page {}: live children end at {:?}, node ends at {:?}",
                        page, expected, range.max
                    ));
                }
                for child in live {
                    self.check_live(
                        child.child,
                        &child.region.range,
                        level.saturating_sub(1),
                        false,
                        report,
                    )?;
                }
            }
        }
        Ok(())
    }
}

impl<K: TreeKey, V: TreeValue> Drop for Mvbt<K, V> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let result = self.persist_meta().and_then(|_| self.store.flush());
        if let Err(e) = result {
            error!("Failed to flush MVBT on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::MemoryContainer;
    use crate::converter::BincodeConverter;
    use crate::tree::MidpointSplit;

    fn mvbt(capacity: usize) -> Mvbt<u32, u32> {
        let params = TreeParams {
            block_size: 4096,
            buffer_size: 8,
            min_ratio: 0.2,
            leaf_capacity: capacity,
            index_capacity: capacity,
            leaf_split: Arc::new(MidpointSplit),
            index_split: Arc::new(MidpointSplit),
        };
        Mvbt::open(
            Arc::new(MemoryContainer::new()),
            Arc::new(BincodeConverter::<u32>::fixed()),
            Arc::new(BincodeConverter::<u32>::fixed()),
            params,
        )
        .unwrap()
    }

    fn keys_at(tree: &Mvbt<u32, u32>, at: u64) -> Vec<u32> {
        tree.query(KeyRange::all(), Version(at))
            .unwrap()
            .map(|e| e.unwrap().key)
            .collect()
    }

    #[test]
    fn test_limits() {
        let limits = NodeLimits::new(10, 0.2);
        assert_eq!(limits.weak_min, 2);
        assert_eq!(limits.strong_min, 3);
        assert_eq!(limits.strong_max, 9);
        assert!(limits.validate("leaf").is_ok());
        assert!(NodeLimits::new(2, 0.5).validate("leaf").is_err());
    }

    #[test]
    fn test_versions_are_isolated() {
        let mut tree = mvbt(4);
        for k in 0..10 {
            tree.insert(k, k * 10, Version(k as u64 + 1)).unwrap();
        }
        tree.delete(&3, Version(20)).unwrap();
        tree.update(5, 55, Version(21)).unwrap();

        assert_eq!(keys_at(&tree, 0), Vec::<u32>::new());
        assert_eq!(keys_at(&tree, 4), vec![0, 1, 2, 3]);
        assert_eq!(keys_at(&tree, 19), (0..10).collect::<Vec<_>>());
        assert!(!keys_at(&tree, 20).contains(&3));
        assert_eq!(tree.lookup(&5, Version(20)).unwrap(), Some(50));
        assert_eq!(tree.lookup(&5, Version(21)).unwrap(), Some(55));
        assert_eq!(tree.get(&3).unwrap(), None);
        assert_eq!(tree.len(), 9);
        assert!(tree.check_integrity().unwrap().is_valid);
    }

    #[test]
    fn test_versions_must_not_decrease() {
        let mut tree = mvbt(4);
        tree.insert(1, 1, Version(5)).unwrap();
        let err = tree.insert(2, 2, Version(4)).unwrap_err();
        assert!(matches!(err, TreeError::InvariantViolation(_)));
        assert!(tree.delete(&1, Version(3)).is_err());
        assert_eq!(tree.current_version(), Version(5));
    }

    #[test]
    fn test_duplicate_alive_key_rejected() {
        let mut tree = mvbt(4);
        tree.insert(1, 1, Version(1)).unwrap();
        assert!(matches!(
            tree.insert(1, 2, Version(2)),
            Err(TreeError::InvariantViolation(_))
        ));
        tree.delete(&1, Version(3)).unwrap();
        tree.insert(1, 3, Version(4)).unwrap();
        assert_eq!(tree.lookup(&1, Version(2)).unwrap(), Some(1));
        assert_eq!(tree.lookup(&1, Version(3)).unwrap(), None);
        assert_eq!(tree.lookup(&1, Version(4)).unwrap(), Some(3));
    }

    #[test]
    fn test_same_version_delete_is_physical() {
        let mut tree = mvbt(4);
        tree.insert(7, 70, Version(2)).unwrap();
        assert_eq!(tree.delete(&7, Version(2)).unwrap(), Some(70));
        assert!(tree.history(&7).unwrap().is_empty());
        assert_eq!(tree.delete(&7, Version(2)).unwrap(), None);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_history() {
        let mut tree = mvbt(4);
        for k in 0..30 {
            tree.insert(k, k, Version(1)).unwrap();
        }
        tree.update(12, 100, Version(5)).unwrap();
        for k in 0..20 {
            if k != 12 {
                tree.delete(&k, Version(6)).unwrap();
            }
        }
        tree.delete(&12, Version(9)).unwrap();

        let history = tree.history(&12).unwrap();
        assert_eq!(
            history,
            vec![
                (Lifespan::new(Version(1), Some(Version(5))), 12),
                (Lifespan::new(Version(5), Some(Version(9))), 100),
            ]
        );
        assert!(tree.history(&99).unwrap().is_empty());
    }

    #[test]
    fn test_emptied_subtree_range_is_absorbed() {
        let mut tree = mvbt(5);
        assert_eq!(tree.leaf_limits().weak_min, 1);
        for k in 0..80 {
            tree.insert(k, k, Version(k as u64 + 1)).unwrap();
        }
        let mut v = 100;
        for k in (20..60).chain((0..10).rev()) {
            tree.delete(&k, Version(v)).unwrap();
            let report = tree.check_integrity().unwrap();
            assert!(report.is_valid, "after deleting {}: {:?}", k, report.errors);
            v += 1;
        }
        for k in (0..10).chain(20..60) {
            tree.insert(k, k + 1000, Version(v)).unwrap();
            let report = tree.check_integrity().unwrap();
            assert!(report.is_valid, "after inserting {}: {:?}", k, report.errors);
            v += 1;
        }

        assert_eq!(keys_at(&tree, v), (0..80).collect::<Vec<_>>());
        assert_eq!(keys_at(&tree, 99), (0..80).collect::<Vec<_>>());
        assert_eq!(tree.lookup(&30, Version(99)).unwrap(), Some(30));
        assert_eq!(tree.get(&30).unwrap(), Some(1030));
        assert_eq!(tree.get(&70).unwrap(), Some(70));
    }

    #[test]
    fn test_root_keeps_two_alive_children() {
        let mut tree = mvbt(4);
        for k in 0..24 {
            tree.insert(k, k, Version(1)).unwrap();
        }
        for k in 3..24 {
            tree.delete(&k, Version(k as u64)).unwrap();
            let report = tree.check_integrity().unwrap();
            assert!(report.is_valid, "after deleting {}: {:?}", k, report.errors);
        }
        assert_eq!(keys_at(&tree, 30), vec![0, 1, 2]);
        assert_eq!(keys_at(&tree, 1).len(), 24);
    }

    #[test]
    fn test_root_history_grows_and_shrinks() {
        let mut tree = mvbt(4);
        for k in 0..40 {
            tree.insert(k, k, Version(k as u64 + 1)).unwrap();
        }
        assert!(tree.height() >= 3);
        for k in 0..40 {
            tree.delete(&k, Version(100 + k as u64)).unwrap();
            assert!(tree.check_integrity().unwrap().is_valid, "after deleting {}", k);
        }
        assert!(tree.is_empty());
        assert_eq!(tree.height(), 1);
        assert!(tree.root_history().len() > 1);
        assert_eq!(keys_at(&tree, 40), (0..40).collect::<Vec<_>>());
    }
}
