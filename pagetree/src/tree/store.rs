//! Node access for the tree engines.
//!
//! A [`NodeStore`] owns the buffer of decoded nodes and the metadata record
//! in page [`META_PAGE_ID`]. Metadata bypasses the buffer and is written
//! straight to the container.

use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::node::{Node, NodeConverter};
use crate::buffer::{Buffer, BufferStats};
use crate::constants::META_PAGE_ID;
use crate::container::{Container, PageId};
use crate::converter::Converter;
use crate::errors::{TreeError, TreeResult};

pub struct NodeStore<E, R> {
    buffer: Mutex<Buffer<Node<E, R>>>,
    container: Arc<dyn Container>,
    codec: Arc<NodeConverter<E, R>>,
    page_size: usize,
}

impl<E, R> NodeStore<E, R>
where
    E: Clone + 'static,
    R: Clone + 'static,
{
    pub fn new(
        container: Arc<dyn Container>,
        codec: Arc<NodeConverter<E, R>>,
        buffer_size: usize,
        page_size: usize,
    ) -> Self {
        let node_converter: Arc<dyn Converter<Node<E, R>>> = codec.clone();
        Self {
            buffer: Mutex::new(Buffer::new(container.clone(), node_converter, buffer_size)),
            container,
            codec,
            page_size,
        }
    }

    pub fn codec(&self) -> &NodeConverter<E, R> {
        &self.codec
    }

    pub fn container(&self) -> &Arc<dyn Container> {
        &self.container
    }

    /// Snapshot of a node without pinning it.
    pub fn read(&self, id: PageId) -> TreeResult<Node<E, R>> {
        self.buffer.lock().get(id)
    }

    /// Pins a node and returns a snapshot of it.
    pub fn fix(&self, id: PageId) -> TreeResult<Node<E, R>> {
        self.buffer.lock().fix(id)
    }

    pub fn unfix(&self, id: PageId) -> TreeResult<()> {
        self.buffer.lock().unfix(id)
    }

    pub fn write(&self, id: PageId, node: Node<E, R>) -> TreeResult<()> {
        self.buffer.lock().update(id, node)
    }

    /// Stores a new node and returns its page id.
    pub fn allocate(&self, node: Node<E, R>) -> TreeResult<PageId> {
        self.buffer.lock().insert(node)
    }

    pub fn free(&self, id: PageId) -> TreeResult<()> {
        debug!("Freeing page {}", id);
        self.buffer.lock().remove(id)
    }

    pub fn flush(&self) -> TreeResult<()> {
        self.buffer.lock().flush()
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.buffer.lock().stats()
    }

    /// Claims the metadata page of an empty container.
    pub fn bootstrap_meta(&self) -> TreeResult<()> {
        let id = self.container.reserve()?;
        if id != META_PAGE_ID {
            return Err(TreeError::invariant(format!(
                "metadata page must be page {}, container handed out {}",
                META_PAGE_ID, id
            )));
        }
        Ok(())
    }

    /// Whether the container already holds a tree.
    pub fn has_meta(&self) -> bool {
        self.container.contains(META_PAGE_ID)
    }

    pub fn read_meta<M: DeserializeOwned>(&self) -> TreeResult<M> {
        let page = self.container.get(META_PAGE_ID)?;
        let (meta, _) = bincode::serde::decode_from_slice(&page, bincode::config::legacy())?;
        Ok(meta)
    }

    pub fn write_meta<M: Serialize>(&self, meta: &M) -> TreeResult<()> {
        let bytes = bincode::serde::encode_to_vec(meta, bincode::config::legacy())?;
        if bytes.len() > self.page_size {
            return Err(TreeError::Serialization(format!(
                "metadata of {} bytes exceeds page size {}",
                bytes.len(),
                self.page_size
            )));
        }
        self.container.update(META_PAGE_ID, &bytes)
    }

    /// Writes a byte string spread over as many raw pages as needed,
    /// reusing `pages` first and releasing those left over.
    pub fn write_chunked(&self, bytes: &[u8], pages: &[PageId]) -> TreeResult<Vec<PageId>> {
        let chunk_size = self.page_size.max(1);
        let mut written = Vec::new();
        for (i, chunk) in bytes.chunks(chunk_size).enumerate() {
            let id = match pages.get(i) {
                Some(id) => *id,
                None => self.container.reserve()?,
            };
            self.container.update(id, chunk)?;
            written.push(id);
        }
        for id in pages.iter().skip(written.len()) {
            self.container.remove(*id)?;
        }
        Ok(written)
    }

    pub fn read_chunked(&self, pages: &[PageId]) -> TreeResult<Vec<u8>> {
        let mut bytes = Vec::new();
        for id in pages {
            bytes.extend_from_slice(&self.container.get(*id)?);
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::MemoryContainer;
    use crate::converter::BincodeConverter;

    fn store(page_size: usize) -> NodeStore<u32, u32> {
        let conv: Arc<dyn Converter<u32>> = Arc::new(BincodeConverter::<u32>::fixed());
        let codec = Arc::new(NodeConverter::new(conv.clone(), conv, 4, 4));
        NodeStore::new(Arc::new(MemoryContainer::new()), codec, 4, page_size)
    }

    #[test]
    fn test_meta_page_roundtrip() {
        let store = store(64);
        assert!(!store.has_meta());
        store.bootstrap_meta().unwrap();
        store.write_meta(&(7u64, 3u32)).unwrap();
        assert!(store.has_meta());
        let meta: (u64, u32) = store.read_meta().unwrap();
        assert_eq!(meta, (7, 3));
    }

    #[test]
    fn test_bootstrap_requires_empty_container() {
        let store = store(64);
        store.container().reserve().unwrap();
        assert!(store.bootstrap_meta().is_err());
    }

    #[test]
    fn test_oversized_meta_rejected() {
        let store = store(8);
        store.bootstrap_meta().unwrap();
        assert!(store.write_meta(&vec![0u64; 4]).is_err());
    }

    #[test]
    fn test_chunked_blob() {
        let store = store(4);
        store.bootstrap_meta().unwrap();
        let data: Vec<u8> = (0..10).collect();
        let pages = store.write_chunked(&data, &[]).unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(store.read_chunked(&pages).unwrap(), data);

        let shorter = store.write_chunked(&data[..5], &pages).unwrap();
        assert_eq!(shorter, pages[..2].to_vec());
        assert!(!store.container().contains(pages[2]));
        assert_eq!(store.read_chunked(&shorter).unwrap(), data[..5].to_vec());
    }

    #[test]
    fn test_node_allocation_through_buffer() {
        let store = store(64);
        store.bootstrap_meta().unwrap();
        let id = store
            .allocate(Node::Leaf {
                entries: vec![1, 2],
            })
            .unwrap();
        assert_ne!(id, META_PAGE_ID);
        assert_eq!(store.fix(id).unwrap().len(), 2);
        store.unfix(id).unwrap();
        store.flush().unwrap();
        assert!(store.container().get(id).is_ok());
        store.free(id).unwrap();
        assert!(store.read(id).is_err());
    }
}
