//! Declarative tree configuration.
//!
//! [`TreeBuilder`] collects options into a [`TreeConfig`], validating each
//! one as it is set. The first invalid option is remembered and returned by
//! whichever `build_*` method finishes the chain, so configuration errors
//! surface before any page is written.

use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;

use crate::btree::{BPlusTree, DataEntryConverter, TreeKey, TreeValue};
use crate::constants::{
    CHILD_REF_SIZE, DEFAULT_BLOCK_SIZE, DEFAULT_BUFFER_SIZE, DEFAULT_MIN_RATIO,
    DEFAULT_MVBT_MIN_RATIO, NODE_HEADER_SIZE,
};
use crate::container::{BlockFileContainer, Container, MemoryContainer, MIN_BLOCK_SIZE};
use crate::converter::{Converter, MvRegionConverter, RectangleConverter, SeparatorConverter};
use crate::errors::{TreeError, TreeResult};
use crate::mvbt::{MvEntryConverter, Mvbt};
use crate::rtree::{RTree, SpatialEntryConverter};
use crate::tree::{MidpointSplit, NodeConverter, SpaceFillingCurveSplit, SplitStrategy, TreeParams};

/// Where the pages of a tree live
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StorageLocation {
    #[default]
    Memory,
    File(PathBuf),
}

impl Display for StorageLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageLocation::Memory => write!(f, "memory"),
            StorageLocation::File(path) => write!(f, "file {}", path.display()),
        }
    }
}

/// How overflowing nodes are cut
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplitKind {
    #[default]
    Midpoint,
    /// Cut where adjacent keys share the shortest curve prefix
    SpaceFillingCurve,
}

/// Validated tree options.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeConfig {
    block_size: usize,
    buffer_size: usize,
    storage: Option<StorageLocation>,
    min_ratio: Option<f64>,
    max_fanout: Option<usize>,
    split: SplitKind,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeConfig {
    pub fn new() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            storage: None,
            min_ratio: None,
            max_fanout: None,
            split: SplitKind::Midpoint,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn storage(&self) -> StorageLocation {
        self.storage.clone().unwrap_or_default()
    }

    /// Minimum fill ratio, falling back to `default` when unset.
    pub fn min_ratio_or(&self, default: f64) -> f64 {
        self.min_ratio.unwrap_or(default)
    }

    pub fn max_fanout(&self) -> Option<usize> {
        self.max_fanout
    }

    pub fn split(&self) -> SplitKind {
        self.split
    }

    fn set_block_size(&mut self, block_size: usize) -> TreeResult<()> {
        if block_size < MIN_BLOCK_SIZE {
            return Err(TreeError::configuration(format!(
                "block size {} is below the minimum of {} bytes",
                block_size, MIN_BLOCK_SIZE
            )));
        }
        self.block_size = block_size;
        Ok(())
    }

    fn set_buffer_size(&mut self, buffer_size: usize) -> TreeResult<()> {
        if buffer_size == 0 {
            return Err(TreeError::configuration("buffer size must be at least 1"));
        }
        self.buffer_size = buffer_size;
        Ok(())
    }

    fn set_storage(&mut self, location: StorageLocation) -> TreeResult<()> {
        match &self.storage {
            Some(current) if *current != location => Err(TreeError::configuration(format!(
                "storage already set to {}, cannot switch to {}",
                current, location
            ))),
            _ => {
                self.storage = Some(location);
                Ok(())
            }
        }
    }

    fn set_min_ratio(&mut self, min_ratio: f64) -> TreeResult<()> {
        if !(min_ratio > 0.0 && min_ratio <= 0.5) {
            return Err(TreeError::configuration(format!(
                "min ratio {} outside (0, 0.5]",
                min_ratio
            )));
        }
        self.min_ratio = Some(min_ratio);
        Ok(())
    }

    fn set_max_fanout(&mut self, fanout: usize) -> TreeResult<()> {
        if fanout < 2 {
            return Err(TreeError::configuration(format!(
                "fan-out {} is below 2",
                fanout
            )));
        }
        self.max_fanout = Some(fanout);
        Ok(())
    }

    fn open_container(&self) -> TreeResult<Arc<dyn Container>> {
        Ok(match self.storage() {
            StorageLocation::Memory => Arc::new(MemoryContainer::new()),
            StorageLocation::File(path) => {
                Arc::new(BlockFileContainer::open_or_create(path, self.block_size)?)
            }
        })
    }

    /// Entries of `item_size` bytes a node may hold on pages of `page_size`.
    fn capacity(&self, what: &str, page_size: usize, item_size: usize) -> TreeResult<usize> {
        let fits = NodeConverter::<(), ()>::capacity_for(page_size, item_size);
        match self.max_fanout {
            Some(fanout) if fanout > fits => Err(TreeError::configuration(format!(
                "{} fan-out {} exceeds the {} entries of {} bytes fitting a {} byte block",
                what, fanout, fits, item_size, self.block_size
            ))),
            Some(fanout) => Ok(fanout),
            None if fits < 2 => Err(TreeError::configuration(format!(
                "block size {} holds only {} {} entries of {} bytes",
                self.block_size, fits, what, item_size
            ))),
            None => Ok(fits),
        }
    }

    fn split_strategy(&self, page_size: usize) -> Arc<dyn SplitStrategy> {
        match self.split {
            SplitKind::Midpoint => Arc::new(MidpointSplit),
            SplitKind::SpaceFillingCurve => Arc::new(SpaceFillingCurveSplit::new(
                0,
                page_size.saturating_sub(NODE_HEADER_SIZE),
            )),
        }
    }

    /// Resolves node capacities for the given item sizes against the page
    /// size `container` offers.
    fn resolve(
        &self,
        container: &dyn Container,
        leaf_item: usize,
        index_item: usize,
        default_ratio: f64,
    ) -> TreeResult<TreeParams> {
        let page_size = container
            .max_page_size()
            .map_or(self.block_size, |max| max.min(self.block_size));
        let params = TreeParams {
            block_size: self.block_size,
            buffer_size: self.buffer_size,
            min_ratio: self.min_ratio_or(default_ratio),
            leaf_capacity: self.capacity("leaf", page_size, leaf_item)?,
            index_capacity: self.capacity("index", page_size, index_item)?,
            leaf_split: self.split_strategy(page_size),
            index_split: self.split_strategy(page_size),
        };
        debug!(
            "Resolved {} storage with {} byte pages, capacities {}/{}",
            self.storage(),
            page_size,
            params.leaf_capacity,
            params.index_capacity
        );
        Ok(params)
    }
}

/// Builder for B+-Trees, R-Trees and MVBTs.
///
/// ```rust
/// use std::sync::Arc;
/// use pagetree::config::TreeBuilder;
/// use pagetree::converter::BincodeConverter;
///
/// # fn main() -> Result<(), pagetree::errors::TreeError> {
/// let mut tree = TreeBuilder::new()
///     .in_memory()
///     .max_fanout(4)
///     .build_btree::<u32, u64>(
///         Arc::new(BincodeConverter::<u32>::fixed()),
///         Arc::new(BincodeConverter::<u64>::fixed()),
///     )?;
/// tree.insert(1, 10)?;
/// assert_eq!(tree.lookup(&1)?, Some(10));
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct TreeBuilder {
    error: Option<TreeError>,
    config: TreeConfig,
}

impl TreeBuilder {
    /// Creates a builder with in-memory storage, 4096 byte blocks and a
    /// 20 slot buffer.
    pub fn new() -> Self {
        Self {
            error: None,
            config: TreeConfig::new(),
        }
    }

    fn apply(mut self, f: impl FnOnce(&mut TreeConfig) -> TreeResult<()>) -> Self {
        if self.error.is_none() {
            if let Err(e) = f(&mut self.config) {
                self.error = Some(e);
            }
        }
        self
    }

    pub fn block_size(self, block_size: usize) -> Self {
        self.apply(|c| c.set_block_size(block_size))
    }

    /// Number of decoded pages kept in the LRU buffer.
    pub fn buffer_size(self, buffer_size: usize) -> Self {
        self.apply(|c| c.set_buffer_size(buffer_size))
    }

    pub fn in_memory(self) -> Self {
        self.apply(|c| c.set_storage(StorageLocation::Memory))
    }

    /// Stores pages in a block file, reopening it when it already exists.
    ///
    /// Combining this with [`in_memory`](Self::in_memory) is a configuration
    /// error.
    pub fn file_path(self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        self.apply(|c| c.set_storage(StorageLocation::File(path)))
    }

    /// Minimum fill ratio of non-root nodes, in `(0, 0.5]`. Defaults to 0.5
    /// for B+-Trees and R-Trees and to 0.2 for MVBTs.
    pub fn min_ratio(self, min_ratio: f64) -> Self {
        self.apply(|c| c.set_min_ratio(min_ratio))
    }

    /// Caps node capacities below what a block could hold. A fan-out larger
    /// than what fits a block fails at build time.
    pub fn max_fanout(self, fanout: usize) -> Self {
        self.apply(|c| c.set_max_fanout(fanout))
    }

    pub fn split(self, split: SplitKind) -> Self {
        self.apply(|c| {
            c.split = split;
            Ok(())
        })
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    fn finish(self) -> TreeResult<TreeConfig> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.config),
        }
    }

    /// Builds a B+-Tree over keys and values encoded by the given converters.
    pub fn build_btree<K: TreeKey, V: TreeValue>(
        self,
        key_converter: Arc<dyn Converter<K>>,
        value_converter: Arc<dyn Converter<V>>,
    ) -> TreeResult<BPlusTree<K, V>> {
        let config = self.finish()?;
        let leaf_item =
            DataEntryConverter::new(key_converter.clone(), value_converter.clone()).max_object_size();
        let index_item =
            SeparatorConverter::new(key_converter.clone()).max_object_size() + CHILD_REF_SIZE;

        let container = config.open_container()?;
        let params = config.resolve(container.as_ref(), leaf_item, index_item, DEFAULT_MIN_RATIO)?;
        BPlusTree::open(container, key_converter, value_converter, params)
    }

    /// Builds an R-Tree over `dims`-dimensional rectangles.
    pub fn build_rtree<V: TreeValue + PartialEq>(
        self,
        dims: usize,
        value_converter: Arc<dyn Converter<V>>,
    ) -> TreeResult<RTree<V>> {
        let config = self.finish()?;
        if dims == 0 {
            return Err(TreeError::configuration("an R-Tree needs at least one dimension"));
        }
        let leaf_item = SpatialEntryConverter::new(dims, value_converter.clone()).max_object_size();
        let index_item = RectangleConverter::new(dims).max_object_size() + CHILD_REF_SIZE;

        let container = config.open_container()?;
        let params = config.resolve(container.as_ref(), leaf_item, index_item, DEFAULT_MIN_RATIO)?;
        RTree::open(container, dims, value_converter, params)
    }

    /// Builds a multi-version B-Tree.
    pub fn build_mvbt<K: TreeKey, V: TreeValue>(
        self,
        key_converter: Arc<dyn Converter<K>>,
        value_converter: Arc<dyn Converter<V>>,
    ) -> TreeResult<Mvbt<K, V>> {
        let config = self.finish()?;
        let leaf_item =
            MvEntryConverter::new(key_converter.clone(), value_converter.clone()).max_object_size();
        let index_item =
            MvRegionConverter::new(key_converter.clone()).max_object_size() + CHILD_REF_SIZE;

        let container = config.open_container()?;
        let params =
            config.resolve(container.as_ref(), leaf_item, index_item, DEFAULT_MVBT_MIN_RATIO)?;
        Mvbt::open(container, key_converter, value_converter, params)
    }
}
