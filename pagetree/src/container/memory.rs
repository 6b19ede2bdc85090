use std::collections::HashMap;

use parking_lot::RwLock;

use super::{Container, Page, PageId};
use crate::errors::{TreeError, TreeResult};

/// Container keeping every page in memory.
///
/// Freed ids are recycled in LIFO order, mirroring the free list of
/// [`BlockFileContainer`](super::BlockFileContainer).
#[derive(Default)]
pub struct MemoryContainer {
    inner: RwLock<MemoryContainerInner>,
}

#[derive(Default)]
struct MemoryContainerInner {
    /// `None` marks an id that is reserved but not yet written
    pages: HashMap<PageId, Option<Page>>,
    free_ids: Vec<PageId>,
    next_id: PageId,
}

impl MemoryContainer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Container for MemoryContainer {
    fn get(&self, id: PageId) -> TreeResult<Page> {
        let inner = self.inner.read();
        match inner.pages.get(&id) {
            Some(Some(page)) => Ok(page.clone()),
            _ => Err(TreeError::MissingPage(id)),
        }
    }

    fn update(&self, id: PageId, page: &[u8]) -> TreeResult<()> {
        let mut inner = self.inner.write();
        match inner.pages.get_mut(&id) {
            Some(slot) => {
                *slot = Some(page.to_vec());
                Ok(())
            }
            None => Err(TreeError::MissingPage(id)),
        }
    }

    fn remove(&self, id: PageId) -> TreeResult<()> {
        let mut inner = self.inner.write();
        if inner.pages.remove(&id).is_none() {
            return Err(TreeError::MissingPage(id));
        }
        inner.free_ids.push(id);
        Ok(())
    }

    fn reserve(&self) -> TreeResult<PageId> {
        let mut inner = self.inner.write();
        let id = match inner.free_ids.pop() {
            Some(id) => id,
            None => {
                let id = inner.next_id;
                inner.next_id += 1;
                id
            }
        };
        inner.pages.insert(id, None);
        Ok(id)
    }

    fn contains(&self, id: PageId) -> bool {
        self.inner.read().pages.contains_key(&id)
    }

    fn len(&self) -> usize {
        self.inner.read().pages.len()
    }
}
