//! # pagetree - Paged Index Structures
//!
//! This crate provides secondary-storage index structures built on a single
//! generic balanced-tree engine. Nodes are stored as pages in a
//! [`Container`](container::Container), cached by an LRU
//! [`Buffer`](buffer::Buffer) and encoded by explicit
//! [`Converter`](converter::Converter)s.
//!
//! ## Features
//!
//! - **B+-Tree**: ordered keys with point lookups and half-open range queries
//! - **R-Tree**: n-dimensional rectangles with window queries, nearest
//!   neighbours and a lazy spatial join
//! - **MVBT**: a multi-version B-Tree answering queries at any past version
//! - **Block files**: fixed-size blocks with an on-disk free list and
//!   checksummed pages
//! - **Split strategies**: balanced midpoint or shortest curve prefix
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use pagetree::config::TreeBuilder;
//! use pagetree::converter::BincodeConverter;
//! use pagetree::region::KeyRange;
//!
//! # fn main() -> Result<(), pagetree::errors::TreeError> {
//! let mut tree = TreeBuilder::new()
//!     .in_memory()
//!     .max_fanout(4)
//!     .build_btree::<u32, u32>(
//!         Arc::new(BincodeConverter::<u32>::fixed()),
//!         Arc::new(BincodeConverter::<u32>::fixed()),
//!     )?;
//! for key in [5, 3, 8, 1, 9, 2, 7] {
//!     tree.insert(key, key * 10)?;
//! }
//! let keys = tree
//!     .range(KeyRange::between(2, 8))?
//!     .map(|entry| entry.map(|e| e.key))
//!     .collect::<Result<Vec<_>, _>>()?;
//! assert_eq!(keys, vec![2, 3, 5, 7]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Spatial Queries
//!
//! ```rust
//! use std::sync::Arc;
//! use pagetree::config::TreeBuilder;
//! use pagetree::converter::BincodeConverter;
//! use pagetree::region::Rectangle;
//!
//! # fn main() -> Result<(), pagetree::errors::TreeError> {
//! let mut tree = TreeBuilder::new().build_rtree::<u64>(2, Arc::new(BincodeConverter::<u64>::fixed()))?;
//! tree.insert(Rectangle::new_2d(0.0, 0.0, 10.0, 10.0), 1)?;
//! tree.insert(Rectangle::new_2d(20.0, 20.0, 30.0, 30.0), 2)?;
//!
//! let hits = tree.query(Rectangle::new_2d(5.0, 5.0, 15.0, 15.0))?.count();
//! assert_eq!(hits, 1);
//! # Ok(())
//! # }
//! ```

pub mod btree;
pub mod buffer;
pub mod config;
pub mod constants;
pub mod container;
pub mod converter;
pub mod curve;
pub mod errors;
pub mod mvbt;
pub mod region;
pub mod rtree;
pub mod tree;

pub use btree::{BPlusTree, DataEntry};
pub use config::{SplitKind, StorageLocation, TreeBuilder, TreeConfig};
pub use container::{BlockFileContainer, Container, MemoryContainer, PageId};
pub use errors::{ErrorKind, TreeError, TreeResult};
pub use mvbt::{MvEntry, Mvbt};
pub use region::{Descriptor, KeyRange, Lifespan, Rectangle, Separator, Version};
pub use rtree::{RTree, SpatialEntry, SpatialJoin};
pub use tree::{IntegrityReport, Tree, TreeParams, TreeStats};
