use std::collections::VecDeque;

use super::{MvEntry, Mvbt};
use crate::btree::{TreeKey, TreeValue};
use crate::container::PageId;
use crate::errors::TreeResult;
use crate::region::{KeyRange, Version};
use crate::tree::Node;

/// Lazy range query over one version of an [`Mvbt`].
///
/// Yields the entries alive at the queried version in ascending key order.
pub struct MvQueryCursor<'a, K: TreeKey, V: TreeValue> {
    tree: &'a Mvbt<K, V>,
    range: KeyRange<K>,
    at: Version,
    stack: Vec<PageId>,
    pending: VecDeque<MvEntry<K, V>>,
}

impl<'a, K: TreeKey, V: TreeValue> MvQueryCursor<'a, K, V> {
    pub(crate) fn new(
        tree: &'a Mvbt<K, V>,
        range: KeyRange<K>,
        at: Version,
        root: Option<PageId>,
    ) -> Self {
        Self {
            tree,
            range,
            at,
            stack: root.into_iter().collect(),
            pending: VecDeque::new(),
        }
    }
}

impl<'a, K: TreeKey, V: TreeValue> Iterator for MvQueryCursor<'a, K, V> {
    type Item = TreeResult<MvEntry<K, V>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                return Some(Ok(entry));
            }
            let page = self.stack.pop()?;
            let node = match self.tree.read_node(page) {
                Ok(node) => node,
                Err(e) => {
                    self.stack.clear();
                    return Some(Err(e));
                }
            };

            let (at, range) = (self.at, &self.range);
            match node {
                Node::Leaf { entries } => self.pending.extend(
                    entries
                        .into_iter()
                        .filter(|e| e.alive_at(at) && range.contains_key(&e.key)),
                ),
                Node::Index { children, .. } => {
                    let selected: Vec<PageId> = children
                        .iter()
                        .filter(|c| {
                            c.region.alive_at(at) && c.region.range.intersection(range).is_some()
                        })
                        .map(|c| c.child)
                        .collect();
                    self.stack.extend(selected.into_iter().rev());
                }
            }
        }
    }
}
