//! Constants for paged index structures.

/// Default block size in bytes for every container page
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Default number of buffer slots
pub const DEFAULT_BUFFER_SIZE: usize = 20;

/// Default minimum fill ratio of non-root nodes
pub const DEFAULT_MIN_RATIO: f64 = 0.5;

/// Default weak minimum ratio of MVBT nodes
pub const DEFAULT_MVBT_MIN_RATIO: f64 = 0.2;

/// Page id of the tree metadata record
pub const META_PAGE_ID: u64 = 0;

/// Magic number for block file identification
pub const BLOCK_FILE_MAGIC: u32 = 0x5054_5245; // "PTRE"

/// Block file format version
pub const BLOCK_FILE_VERSION: u32 = 1;

/// Magic number of the metadata record
pub const META_MAGIC: u32 = 0x5054_4D44; // "PTMD"

/// Bytes in front of every node payload: checksum, tag, level, entry count
pub const NODE_HEADER_SIZE: usize = 4 + 1 + 4 + 4;

/// Bytes of a child page reference inside an index entry
pub const CHILD_REF_SIZE: usize = 8;

/// Magic number of the multi-version B-Tree metadata record
pub const MVBT_META_MAGIC: u32 = 0x5054_4D56; // "PTMV"
