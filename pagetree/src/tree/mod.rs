//! Generic balanced-tree engine.
//!
//! [`Tree`] implements descent, insertion with node splitting, deletion with
//! redistribution and merging, and lazy queries over nodes kept in a
//! [`NodeStore`]. What distinguishes a B+-Tree from an R-Tree lives in an
//! [`IndexPolicy`].
//!
//! ## Path handling
//! Mutations descend from the root and fix every visited page. The path is
//! then rewritten bottom-up: each level applies the outcome of the level
//! below (an updated region, or a split producing a new sibling entry) and
//! reports its own outcome to its parent. Pages are unfixed as soon as their
//! level has been processed.

mod cursor;
mod integrity;
pub mod node;
pub mod policy;
pub mod split;
pub mod store;

pub use cursor::QueryCursor;
pub use integrity::IntegrityReport;
pub use node::{IndexEntry, Node, NodeConverter, NodeState};
pub use policy::IndexPolicy;
pub use split::{MidpointSplit, SpaceFillingCurveSplit, SplitItem, SplitStrategy};
pub use store::NodeStore;

use std::sync::Arc;

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};

use crate::buffer::BufferStats;
use crate::constants::{CHILD_REF_SIZE, META_MAGIC};
use crate::container::{Container, PageId};
use crate::converter::Converter;
use crate::errors::{TreeError, TreeResult};

/// Sizing and behaviour of a tree, resolved by the builder.
#[derive(Debug, Clone)]
pub struct TreeParams {
    pub block_size: usize,
    pub buffer_size: usize,
    pub min_ratio: f64,
    pub leaf_capacity: usize,
    pub index_capacity: usize,
    pub leaf_split: Arc<dyn SplitStrategy>,
    pub index_split: Arc<dyn SplitStrategy>,
}

impl TreeParams {
    pub fn validate(&self) -> TreeResult<()> {
        if !(self.min_ratio > 0.0 && self.min_ratio <= 0.5) {
            return Err(TreeError::configuration(format!(
                "min ratio {} outside (0, 0.5]",
                self.min_ratio
            )));
        }
        if self.leaf_capacity < 2 || self.index_capacity < 2 {
            return Err(TreeError::configuration(format!(
                "node capacities must be at least 2 (leaf {}, index {})",
                self.leaf_capacity, self.index_capacity
            )));
        }
        Ok(())
    }
}

/// Persisted tree metadata (page 0)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct TreeMeta {
    pub magic: u32,
    pub root: PageId,
    pub height: u32,
    pub min_ratio: f64,
    pub block_size: u32,
    pub leaf_capacity: u32,
    pub index_capacity: u32,
    pub entry_count: u64,
}

impl TreeMeta {
    fn check_compatible(&self, params: &TreeParams) -> TreeResult<()> {
        if self.magic != META_MAGIC {
            return Err(TreeError::Serialization(format!(
                "invalid metadata magic {:#x}",
                self.magic
            )));
        }
        if self.block_size as usize != params.block_size
            || self.leaf_capacity as usize != params.leaf_capacity
            || self.index_capacity as usize != params.index_capacity
        {
            return Err(TreeError::configuration(format!(
                "tree was created with block size {} and capacities {}/{}, \
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

/// Snapshot of tree-level counters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeStats {
    pub entry_count: u64,
    pub height: u32,
    pub leaf_capacity: usize,
    pub index_capacity: usize,
    pub buffer: BufferStats,
}

/// One fixed page on a mutation path
struct Frame<E, R> {
    page: PageId,
    node: Node<E, R>,
    /// Child taken (index node) or entry found (leaf)
    slot: usize,
}

/// What a rewritten node reports to its parent
enum Outcome<R> {
    Updated(Option<R>),
    Split { left: R, right: IndexEntry<R> },
}

type PolicyNode<P> = Node<<P as IndexPolicy>::Entry, <P as IndexPolicy>::Region>;
type PolicyFrame<P> = Frame<<P as IndexPolicy>::Entry, <P as IndexPolicy>::Region>;

/// A paged, balanced tree whose variant behaviour comes from `P`.
pub struct Tree<P: IndexPolicy> {
    policy: P,
    store: NodeStore<P::Entry, P::Region>,
    meta: TreeMeta,
    leaf_split: Arc<dyn SplitStrategy>,
    index_split: Arc<dyn SplitStrategy>,
    closed: bool,
}

impl<P: IndexPolicy> Tree<P> {
    /// Opens the tree stored in `container`, creating it when the container
    /// is empty.
    pub fn open(
        policy: P,
        container: Arc<dyn Container>,
        entry_converter: Arc<dyn Converter<P::Entry>>,
        region_converter: Arc<dyn Converter<P::Region>>,
        params: TreeParams,
    ) -> TreeResult<Self> {
        params.validate()?;

        let page_size = container
            .max_page_size()
            .map_or(params.block_size, |max| max.min(params.block_size));
        let codec = Arc::new(NodeConverter::new(
            entry_converter,
            region_converter,
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
        let meta = if store.has_meta() {
            let meta: TreeMeta = store.read_meta()?;
            meta.check_compatible(&params)?;
            debug!(
                "Reopened tree with root {} height {} and {} entries",
                meta.root, meta.height, meta.entry_count
            );
            meta
        } else {
            store.bootstrap_meta()?;
            let root = store.allocate(Node::empty_leaf())?;
            let meta = TreeMeta {
                magic: META_MAGIC,
                root,
                height: 1,
                min_ratio: params.min_ratio,
                block_size: params.block_size as u32,
                leaf_capacity: params.leaf_capacity as u32,
                index_capacity: params.index_capacity as u32,
                entry_count: 0,
            };
            store.write_meta(&meta)?;
            meta
        };

        Ok(Self {
            policy,
            store,
            meta,
            leaf_split: params.leaf_split,
            index_split: params.index_split,
            closed: false,
        })
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn len(&self) -> u64 {
        self.meta.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.meta.entry_count == 0
    }

    /// Number of levels, 1 for a single leaf.
    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn root_page(&self) -> PageId {
        self.meta.root
    }

    pub fn min_ratio(&self) -> f64 {
        self.meta.min_ratio
    }

    pub fn block_size(&self) -> usize {
        self.meta.block_size as usize
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn stats(&self) -> TreeStats {
        TreeStats {
            entry_count: self.meta.entry_count,
            height: self.meta.height,
            leaf_capacity: self.meta.leaf_capacity as usize,
            index_capacity: self.meta.index_capacity as usize,
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

    pub(crate) fn read_node(&self, page: PageId) -> TreeResult<PolicyNode<P>> {
        self.check_closed()?;
        self.store.read(page)
    }

    /// Region covering every entry, `None` for an empty tree.
    pub fn root_descriptor(&self) -> TreeResult<Option<P::Region>> {
        let root = self.read_node(self.meta.root)?;
        Ok(self.region_of(&root))
    }

    pub fn insert(&mut self, entry: P::Entry) -> TreeResult<()> {
        self.check_closed()?;
        self.policy.validate(&entry)?;

        let mut path = Vec::new();
        let result = self.insert_along(&mut path, entry);
        self.release(&mut path);
        result?;

        self.meta.entry_count += 1;
        self.store.write_meta(&self.meta)
    }

    /// Finds the stored entry matching `probe`.
    pub fn lookup(&self, probe: &P::Probe) -> TreeResult<Option<P::Entry>> {
        self.check_closed()?;
        self.lookup_in(self.meta.root, probe)
    }

    /// Removes the entry matching `probe`; `Ok(None)` when there is none.
    pub fn remove(&mut self, probe: &P::Probe) -> TreeResult<Option<P::Entry>> {
        self.check_closed()?;

        let mut path = Vec::new();
        let result = self.remove_along(&mut path, probe);
        self.release(&mut path);
        let removed = result?;

        if removed.is_some() {
            self.meta.entry_count = self.meta.entry_count.saturating_sub(1);
            self.store.write_meta(&self.meta)?;
        }
        Ok(removed)
    }

    /// Lazily yields the entries matching `query`.
    pub fn query(&self, query: P::Query) -> TreeResult<QueryCursor<'_, P>> {
        self.check_closed()?;
        Ok(QueryCursor::new(self, Some(query), self.meta.root))
    }

    /// Lazily yields every entry.
    pub fn entries(&self) -> TreeResult<QueryCursor<'_, P>> {
        self.check_closed()?;
        Ok(QueryCursor::new(self, None, self.meta.root))
    }

    /// Writes dirty pages and metadata to the container.
    pub fn flush(&self) -> TreeResult<()> {
        self.check_closed()?;
        self.store.write_meta(&self.meta)?;
        self.store.flush()
    }

    pub fn close(&mut self) -> TreeResult<()> {
        self.flush()?;
        self.closed = true;
        debug!("Closed tree with {} entries", self.meta.entry_count);
        Ok(())
    }

    fn capacity(&self, node: &PolicyNode<P>) -> usize {
        if node.is_leaf() {
            self.meta.leaf_capacity as usize
        } else {
            self.meta.index_capacity as usize
        }
    }

    fn min_entries(&self, node: &PolicyNode<P>) -> usize {
        let capacity = self.capacity(node) as f64;
        ((self.meta.min_ratio * capacity).ceil() as usize).max(1)
    }

    fn state_of(&self, node: &PolicyNode<P>) -> NodeState {
        node.state(self.min_entries(node), self.capacity(node))
    }

    fn region_of(&self, node: &PolicyNode<P>) -> Option<P::Region> {
        match node {
            Node::Leaf { entries } => self.policy.leaf_region(entries),
            Node::Index { children, .. } => self.policy.index_region(children),
        }
    }

    fn pop_frame(&self, path: &mut Vec<PolicyFrame<P>>) -> TreeResult<Option<PolicyFrame<P>>> {
        match path.pop() {
            Some(frame) => {
                self.store.unfix(frame.page)?;
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Unfixes whatever is left on a path after an early return.
    fn release(&self, path: &mut Vec<PolicyFrame<P>>) {
        for frame in path.drain(..) {
            if let Err(e) = self.store.unfix(frame.page) {
                warn!("Failed to unfix page {}: {}", frame.page, e);
            }
        }
    }

    fn insert_along(
        &mut self,
        path: &mut Vec<PolicyFrame<P>>,
        entry: P::Entry,
    ) -> TreeResult<()> {
        self.descend_for_insert(path, &entry)?;

        let leaf = self
            .pop_frame(path)?
            .ok_or_else(|| TreeError::invariant("insert path is empty"))?;
        let Node::Leaf { mut entries } = leaf.node else {
            return Err(TreeError::invariant("insert path does not end in a leaf"));
        };
        self.policy.place(&mut entries, entry)?;
        let mut outcome = self.settle(leaf.page, Node::Leaf { entries })?;

        while let Some(parent) = self.pop_frame(path)? {
            let Node::Index {
                level,
                mut children,
            } = parent.node
            else {
                return Err(TreeError::invariant("leaf found above leaf level"));
            };
            Self::apply_outcome(&mut children, parent.slot, outcome);
            outcome = self.settle(parent.page, Node::Index { level, children })?;
        }

        if let Outcome::Split { left, right } = outcome {
            self.grow_root(left, right)?;
        }
        Ok(())
    }

    fn descend_for_insert(
        &self,
        path: &mut Vec<PolicyFrame<P>>,
        entry: &P::Entry,
    ) -> TreeResult<()> {
        let mut page = self.meta.root;
        loop {
            let node = self.store.fix(page)?;
            path.push(Frame {
                page,
                node,
                slot: 0,
            });
            let Some(frame) = path.last_mut() else {
                return Err(TreeError::invariant("insert path is empty"));
            };
            let Node::Index { children, .. } = &frame.node else {
                return Ok(());
            };
            let slot = self.choose_child(children, entry)?;
            page = children[slot].child;
            frame.slot = slot;
        }
    }

    fn choose_child(
        &self,
        children: &[IndexEntry<P::Region>],
        entry: &P::Entry,
    ) -> TreeResult<usize> {
        let candidates = self.policy.choose_subtree(children, entry);
        match candidates.as_slice() {
            [] => Err(TreeError::invariant("index node offers no subtree")),
            [only] => Ok(*only),
            many => {
                let mut best = many[0];
                let mut best_len = usize::MAX;
                for &candidate in many {
                    let len = self.store.read(children[candidate].child)?.len();
                    if len < best_len {
                        best = candidate;
                        best_len = len;
                    }
                }
                Ok(best)
            }
        }
    }

    fn apply_outcome(
        children: &mut Vec<IndexEntry<P::Region>>,
        slot: usize,
        outcome: Outcome<P::Region>,
    ) {
        match outcome {
            Outcome::Updated(Some(region)) => children[slot].region = region,
            Outcome::Updated(None) => {}
            Outcome::Split { left, right } => {
                children[slot].region = left;
                children.insert(slot + 1, right);
            }
        }
    }

    /// Writes a node back, splitting it first when it overflows.
    fn settle(&mut self, page: PageId, mut node: PolicyNode<P>) -> TreeResult<Outcome<P::Region>> {
        if self.state_of(&node) != NodeState::Overflow {
            let region = self.region_of(&node);
            self.store.write(page, node)?;
            return Ok(Outcome::Updated(region));
        }

        let at = self.split_point(&mut node)?;
        let right = node.split_off(at);
        let (Some(left_region), Some(right_region)) = (self.region_of(&node), self.region_of(&right))
        else {
            return Err(TreeError::invariant("split produced an empty node"));
        };

        debug!(
            "Splitting page {} at level {}: {} + {} entries",
            page,
            node.level(),
            node.len(),
            right.len()
        );
        self.store.write(page, node)?;
        let right_page = self.store.allocate(right)?;

        Ok(Outcome::Split {
            left: left_region,
            right: IndexEntry::new(right_region, right_page),
        })
    }

    /// Orders an overflowing node and asks the split strategy for a boundary.
    fn split_point(&self, node: &mut PolicyNode<P>) -> TreeResult<usize> {
        let min_entries = self.min_entries(node);
        let len = node.len();
        let at = match node {
            Node::Leaf { entries } => {
                self.policy.order_entries(entries);
                let converter = self.store.codec().entry_converter();
                let bits = self.policy.entry_curve_bits(entries);
                let items = entries
                    .iter()
                    .zip(bits)
                    .map(|(entry, curve_bits)| {
                        Ok(SplitItem {
                            size: converter.serialized_size(entry)?,
                            curve_bits,
                        })
                    })
                    .collect::<TreeResult<Vec<_>>>()?;
                self.leaf_split.split_point(&items, min_entries)
            }
            Node::Index { children, .. } => {
                self.policy.order_children(children);
                let converter = self.store.codec().region_converter();
                let bits = self.policy.child_curve_bits(children);
                let items = children
                    .iter()
                    .zip(bits)
                    .map(|(child, curve_bits)| {
                        Ok(SplitItem {
                            size: converter.serialized_size(&child.region)? + CHILD_REF_SIZE,
                            curve_bits,
                        })
                    })
                    .collect::<TreeResult<Vec<_>>>()?;
                self.index_split.split_point(&items, min_entries)
            }
        };
        Ok(at.clamp(1, len - 1))
    }

    fn grow_root(&mut self, left: P::Region, right: IndexEntry<P::Region>) -> TreeResult<()> {
        let old_root = self.meta.root;
        let root = Node::Index {
            level: self.meta.height,
            children: vec![IndexEntry::new(left, old_root), right],
        };
        self.meta.root = self.store.allocate(root)?;
        self.meta.height += 1;
        debug!(
            "Root split: new root {} at height {}",
            self.meta.root, self.meta.height
        );
        Ok(())
    }

    fn lookup_in(&self, page: PageId, probe: &P::Probe) -> TreeResult<Option<P::Entry>> {
        match self.store.read(page)? {
            Node::Leaf { mut entries } => Ok(self
                .policy
                .find(&entries, probe)
                .map(|i| entries.swap_remove(i))),
            Node::Index { children, .. } => {
                for i in self.policy.probe_children(&children, probe) {
                    if let Some(entry) = self.lookup_in(children[i].child, probe)? {
                        return Ok(Some(entry));
                    }
                }
                Ok(None)
            }
        }
    }

    fn remove_along(
        &mut self,
        path: &mut Vec<PolicyFrame<P>>,
        probe: &P::Probe,
    ) -> TreeResult<Option<P::Entry>> {
        if !self.find_path(self.meta.root, probe, path)? {
            return Ok(None);
        }

        let leaf = self
            .pop_frame(path)?
            .ok_or_else(|| TreeError::invariant("remove path is empty"))?;
        let Node::Leaf { mut entries } = leaf.node else {
            return Err(TreeError::invariant("remove path does not end in a leaf"));
        };
        let removed = entries.remove(leaf.slot);

        let mut page = leaf.page;
        let mut node = Node::Leaf { entries };
        while let Some(parent) = self.pop_frame(path)? {
            let Node::Index {
                level,
                mut children,
            } = parent.node
            else {
                return Err(TreeError::invariant("leaf found above leaf level"));
            };
            self.rebalance_child(&mut children, parent.slot, page, node)?;
            page = parent.page;
            node = Node::Index { level, children };
        }

        self.store.write(page, node)?;
        self.collapse_root()?;
        Ok(Some(removed))
    }

    /// Fixes the path down to the leaf holding `probe`, backtracking over
    /// candidate subtrees. Returns false (with nothing left fixed) if absent.
    fn find_path(
        &self,
        page: PageId,
        probe: &P::Probe,
        path: &mut Vec<PolicyFrame<P>>,
    ) -> TreeResult<bool> {
        let node = self.store.fix(page)?;
        path.push(Frame {
            page,
            node,
            slot: 0,
        });
        let depth = path.len() - 1;

        let candidates: Vec<(usize, PageId)> = match &path[depth].node {
            Node::Leaf { entries } => {
                if let Some(slot) = self.policy.find(entries, probe) {
                    path[depth].slot = slot;
                    return Ok(true);
                }
                Vec::new()
            }
            Node::Index { children, .. } => self
                .policy
                .probe_children(children, probe)
                .into_iter()
                .map(|i| (i, children[i].child))
                .collect(),
        };

        for (slot, child) in candidates {
            path[depth].slot = slot;
            if self.find_path(child, probe, path)? {
                return Ok(true);
            }
        }

        self.pop_frame(path)?;
        Ok(false)
    }

    /// Writes a child back into its parent, redistributing with or merging
    /// into a sibling when it underflows.
    fn rebalance_child(
        &mut self,
        children: &mut Vec<IndexEntry<P::Region>>,
        slot: usize,
        page: PageId,
        node: PolicyNode<P>,
    ) -> TreeResult<()> {
        let min_entries = self.min_entries(&node);
        if self.state_of(&node) != NodeState::Underflow || children.len() < 2 {
            if node.is_empty() {
                self.store.free(page)?;
                children.remove(slot);
                return Ok(());
            }
            if let Some(region) = self.region_of(&node) {
                children[slot].region = region;
            }
            return self.store.write(page, node);
        }

        let sibling_slot = if slot > 0 { slot - 1 } else { slot + 1 };
        let sibling = self.store.read(children[sibling_slot].child)?;
        let (left_slot, right_slot, mut left, right) = if sibling_slot < slot {
            (sibling_slot, slot, sibling, node)
        } else {
            (slot, sibling_slot, node, sibling)
        };
        let left_page = children[left_slot].child;
        let right_page = children[right_slot].child;
        let combined = left.len() + right.len();
        left.append(right)?;

        if combined >= 2 * min_entries {
            match &mut left {
                Node::Leaf { entries } => self.policy.order_entries(entries),
                Node::Index {
                    children: grandchildren,
                    ..
                } => self.policy.order_children(grandchildren),
            }
            let right = left.split_off(combined / 2);
            let (Some(left_region), Some(right_region)) =
                (self.region_of(&left), self.region_of(&right))
            else {
                return Err(TreeError::invariant("redistribution produced an empty node"));
            };
            debug!(
                "Redistributed pages {} and {}: {} + {} entries",
                left_page,
                right_page,
                left.len(),
                right.len()
            );
            children[left_slot].region = left_region;
            children[right_slot].region = right_region;
            self.store.write(left_page, left)?;
            self.store.write(right_page, right)?;
        } else {
            let region = self
                .region_of(&left)
                .ok_or_else(|| TreeError::invariant("merge produced an empty node"))?;
            debug!("Merged page {} into page {}", right_page, left_page);
            children[left_slot].region = region;
            children.remove(right_slot);
            self.store.write(left_page, left)?;
            self.store.free(right_page)?;
        }
        Ok(())
    }

    /// Replaces an index root with a single child by that child.
    fn collapse_root(&mut self) -> TreeResult<()> {
        loop {
            let Node::Index { children, .. } = self.store.read(self.meta.root)? else {
                return Ok(());
            };
            match children.len() {
                0 => {
                    self.store.write(self.meta.root, Node::empty_leaf())?;
                    self.meta.height = 1;
                    return Ok(());
                }
                1 => {
                    let old_root = self.meta.root;
                    self.meta.root = children[0].child;
                    self.meta.height -= 1;
                    self.store.free(old_root)?;
                    debug!(
                        "Root collapse: new root {} at height {}",
                        self.meta.root, self.meta.height
                    );
                }
                _ => return Ok(()),
            }
        }
    }
}

impl<P: IndexPolicy> Drop for Tree<P> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let result = self
            .store
            .write_meta(&self.meta)
            .and_then(|_| self.store.flush());
        if let Err(e) = result {
            error!("Failed to flush tree on drop: {}", e);
        }
    }
}
