//! B+-Tree over a scalar key order.
//!
//! Index entries carry the maximum key of their subtree: child `i` covers
//! `(sep[i-1], sep[i]]`. Leaves hold `(key, value)` pairs in strictly
//! increasing key order.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::buffer::BufferStats;
use crate::converter::{Converter, SeparatorConverter};
use crate::curve::{separator_bits, CurveKey};
use crate::errors::{TreeError, TreeResult};
use crate::region::{KeyRange, Separator};
use crate::tree::{
    IndexEntry, IndexPolicy, IntegrityReport, QueryCursor, Tree, TreeParams, TreeStats,
};
use crate::container::Container;

/// Key and value stored in a B+-Tree leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEntry<K, V> {
    pub key: K,
    pub value: V,
}

impl<K, V> DataEntry<K, V> {
    pub fn new(key: K, value: V) -> Self {
        Self { key, value }
    }
}

/// Key encoding followed by value encoding.
pub struct DataEntryConverter<K, V> {
    key: Arc<dyn Converter<K>>,
    value: Arc<dyn Converter<V>>,
}

impl<K, V> DataEntryConverter<K, V> {
    pub fn new(key: Arc<dyn Converter<K>>, value: Arc<dyn Converter<V>>) -> Self {
        Self { key, value }
    }
}

impl<K, V> Converter<DataEntry<K, V>> for DataEntryConverter<K, V> {
    fn write(&self, value: &DataEntry<K, V>, out: &mut Vec<u8>) -> TreeResult<()> {
        self.key.write(&value.key, out)?;
        self.value.write(&value.value, out)
    }

    fn read(&self, input: &mut &[u8]) -> TreeResult<DataEntry<K, V>> {
        let key = self.key.read(input)?;
        let value = self.value.read(input)?;
        Ok(DataEntry::new(key, value))
    }

    fn max_object_size(&self) -> usize {
        self.key.max_object_size() + self.value.max_object_size()
    }
}

/// Bounds required from B+-Tree keys
pub trait TreeKey: Ord + Clone + Debug + CurveKey + Send + Sync + 'static {}

impl<T: Ord + Clone + Debug + CurveKey + Send + Sync + 'static> TreeKey for T {}

/// Bounds required from stored values
pub trait TreeValue: Clone + Debug + Send + Sync + 'static {}

impl<T: Clone + Debug + Send + Sync + 'static> TreeValue for T {}

pub struct BTreePolicy<K, V> {
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Default for BTreePolicy<K, V> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<K: TreeKey, V> BTreePolicy<K, V> {
    /// First child whose separator is not below `key`, else the last child.
    fn route(children: &[IndexEntry<Separator<K>>], key: &K) -> usize {
        children
            .iter()
            .position(|c| c.region.cmp_key(key).is_ge())
            .unwrap_or(children.len().saturating_sub(1))
    }
}

impl<K: TreeKey, V: TreeValue> IndexPolicy for BTreePolicy<K, V> {
    type Entry = DataEntry<K, V>;
    type Region = Separator<K>;
    type Query = KeyRange<K>;
    type Probe = K;

    fn leaf_region(&self, entries: &[Self::Entry]) -> Option<Self::Region> {
        entries.last().map(|e| Separator::Value(e.key.clone()))
    }

    fn index_region(&self, children: &[IndexEntry<Self::Region>]) -> Option<Self::Region> {
        children.last().map(|c| c.region.clone())
    }

    fn choose_subtree(
        &self,
        children: &[IndexEntry<Self::Region>],
        entry: &Self::Entry,
    ) -> Vec<usize> {
        vec![Self::route(children, &entry.key)]
    }

    fn place(&self, entries: &mut Vec<Self::Entry>, entry: Self::Entry) -> TreeResult<()> {
        match entries.binary_search_by(|e| e.key.cmp(&entry.key)) {
            Ok(_) => Err(TreeError::invariant(format!(
                "duplicate key {:?}",
                entry.key
            ))),
            Err(pos) => {
                entries.insert(pos, entry);
                Ok(())
            }
        }
    }

    fn probe_children(&self, children: &[IndexEntry<Self::Region>], probe: &K) -> Vec<usize> {
        if children.is_empty() {
            Vec::new()
        } else {
            vec![Self::route(children, probe)]
        }
    }

    fn find(&self, entries: &[Self::Entry], probe: &K) -> Option<usize> {
        entries.binary_search_by(|e| e.key.cmp(probe)).ok()
    }

    fn query_children(
        &self,
        children: &[IndexEntry<Self::Region>],
        query: &Self::Query,
    ) -> Vec<usize> {
        let mut selected = Vec::new();
        let mut lower = &Separator::NegInfinity;
        for (i, child) in children.iter().enumerate() {
            // keys of child i lie in (lower, child.region]
            if child.region >= query.min && *lower < query.max {
                selected.push(i);
            }
            lower = &child.region;
        }
        selected
    }

    fn matches(&self, entry: &Self::Entry, query: &Self::Query) -> bool {
        query.contains_key(&entry.key)
    }

    fn entry_curve_bits(&self, entries: &[Self::Entry]) -> Vec<u64> {
        entries.iter().map(|e| e.key.curve_bits()).collect()
    }

    fn child_curve_bits(&self, children: &[IndexEntry<Self::Region>]) -> Vec<u64> {
        children
            .iter()
            .map(|c| separator_bits(&c.region))
            .collect()
    }

    fn covers(&self, recorded: &Self::Region, actual: &Self::Region) -> bool {
        recorded == actual
    }

    fn check_entries(&self, entries: &[Self::Entry]) -> Option<String> {
        entries
            .windows(2)
            .find(|pair| pair[0].key >= pair[1].key)
            .map(|pair| format!("keys out of order: {:?} before {:?}", pair[0].key, pair[1].key))
    }

    fn check_children(&self, children: &[IndexEntry<Self::Region>]) -> Option<String> {
        children
            .windows(2)
            .find(|pair| pair[0].region >= pair[1].region)
            .map(|pair| {
                format!(
                    "separators out of order: {:?} before {:?}",
                    pair[0].region, pair[1].region
                )
            })
    }
}

/// Ordered key/value index with unique keys.
pub struct BPlusTree<K: TreeKey, V: TreeValue> {
    tree: Tree<BTreePolicy<K, V>>,
}

impl<K: TreeKey, V: TreeValue> BPlusTree<K, V> {
    /// Opens a B+-Tree in `container`; usually called through
    /// [`TreeBuilder::build_btree`](crate::config::TreeBuilder::build_btree).
    pub fn open(
        container: Arc<dyn Container>,
        key_converter: Arc<dyn Converter<K>>,
        value_converter: Arc<dyn Converter<V>>,
        params: TreeParams,
    ) -> TreeResult<Self> {
        let entry_converter = Arc::new(DataEntryConverter::new(key_converter.clone(), value_converter));
        let separator_converter = Arc::new(SeparatorConverter::new(key_converter));
        let tree = Tree::open(
            BTreePolicy::default(),
            container,
            entry_converter,
            separator_converter,
            params,
        )?;
        Ok(Self { tree })
    }

    /// Inserts a new key. Inserting a key that is already present is an
    /// invariant violation.
    pub fn insert(&mut self, key: K, value: V) -> TreeResult<()> {
        self.tree.insert(DataEntry::new(key, value))
    }

    pub fn lookup(&self, key: &K) -> TreeResult<Option<V>> {
        Ok(self.tree.lookup(key)?.map(|e| e.value))
    }

    pub fn contains(&self, key: &K) -> TreeResult<bool> {
        Ok(self.tree.lookup(key)?.is_some())
    }

    /// Removes a key and returns its value, `Ok(None)` if it was absent.
    pub fn remove(&mut self, key: &K) -> TreeResult<Option<V>> {
        Ok(self.tree.remove(key)?.map(|e| e.value))
    }

    /// Entries with keys in `range`, in ascending key order.
    pub fn range(&self, range: KeyRange<K>) -> TreeResult<QueryCursor<'_, BTreePolicy<K, V>>> {
        self.tree.query(range)
    }

    /// Every entry in ascending key order.
    pub fn iter(&self) -> TreeResult<QueryCursor<'_, BTreePolicy<K, V>>> {
        self.tree.entries()
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

    /// Largest key of the tree as a separator, `None` when empty.
    pub fn root_descriptor(&self) -> TreeResult<Option<Separator<K>>> {
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

    /// The underlying generic tree.
    pub fn inner(&self) -> &Tree<BTreePolicy<K, V>> {
        &self.tree
    }
}
