//! Page containers.
//!
//! A container stores opaque pages addressed by [`PageId`]. Two
//! implementations are provided:
//! - [`MemoryContainer`]: pages kept in a hash map, lost on drop
//! - [`BlockFileContainer`]: fixed-size blocks in a single file with an
//!   on-disk free list for block reuse
//!
//! Containers never cache decoded values; that is the job of
//! [`Buffer`](crate::buffer::Buffer).

mod block_file;
mod memory;

pub use block_file::{BlockFileContainer, BlockFileHeader, MIN_BLOCK_SIZE};
pub use memory::MemoryContainer;

use crate::errors::TreeResult;

/// Page ID - unique identifier for a page inside a container
pub type PageId = u64;

/// Raw page contents
pub type Page = Vec<u8>;

/// Page storage capability consumed by the buffer and the trees.
///
/// Implementations use interior mutability so a container can be shared
/// between a buffer and the metadata writer of a tree.
pub trait Container: Send + Sync {
    /// Reads a page. Fails with `MissingPage` for unknown or reserved-only ids.
    fn get(&self, id: PageId) -> TreeResult<Page>;

    /// Stores a new page and returns its id.
    fn insert(&self, page: &[u8]) -> TreeResult<PageId> {
        let id = self.reserve()?;
        self.update(id, page)?;
        Ok(id)
    }

    /// Overwrites a page previously returned by `insert` or `reserve`.
    fn update(&self, id: PageId, page: &[u8]) -> TreeResult<()>;

    /// Releases a page so its id may be handed out again.
    fn remove(&self, id: PageId) -> TreeResult<()>;

    /// Allocates an id without storing contents yet.
    fn reserve(&self) -> TreeResult<PageId>;

    /// Whether the id refers to a live (reserved or written) page.
    fn contains(&self, id: PageId) -> bool;

    /// Number of live pages.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest page the container accepts, if bounded.
    fn max_page_size(&self) -> Option<usize> {
        None
    }

    /// Pushes buffered writes to durable storage.
    fn flush(&self) -> TreeResult<()> {
        Ok(())
    }
}
