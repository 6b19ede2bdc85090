//! Block file container.
//!
//! Layout of the file:
//! - block 0: [`BlockFileHeader`] (bincode, zero padded)
//! - block `id + 1`: page `id`, stored as `[status: u8][len: u32 LE][payload]`
//!
//! Removed blocks are chained through a free list whose head lives in the
//! header. Each read or write touches exactly one block.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{Container, Page, PageId};
use crate::constants::{BLOCK_FILE_MAGIC, BLOCK_FILE_VERSION};
use crate::errors::{TreeError, TreeResult};

const STATUS_RESERVED: u8 = 0;
const STATUS_USED: u8 = 1;
const STATUS_FREE: u8 = 2;

/// Status byte plus payload length
const BLOCK_PREFIX: usize = 1 + 4;

/// Bytes read when decoding the header before the block size is known
const HEADER_PROBE: usize = 128;

/// Smallest accepted block size
pub const MIN_BLOCK_SIZE: usize = HEADER_PROBE;

/// File header stored in block 0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockFileHeader {
    pub magic: u32,
    pub version: u32,
    pub block_size: u32,
    pub next_page_id: PageId,
    pub free_list_head: Option<PageId>,
    pub free_page_count: u64,
}

impl BlockFileHeader {
    pub fn new(block_size: usize) -> Self {
        Self {
            magic: BLOCK_FILE_MAGIC,
            version: BLOCK_FILE_VERSION,
            block_size: block_size as u32,
            next_page_id: 0,
            free_list_head: None,
            free_page_count: 0,
        }
    }

    pub fn validate(&self) -> TreeResult<()> {
        if self.magic != BLOCK_FILE_MAGIC {
            return Err(TreeError::Serialization(
                "Invalid file format (bad magic)".into(),
            ));
        }
        if self.version != BLOCK_FILE_VERSION {
            return Err(TreeError::Serialization(format!(
                "Unsupported file format version {}",
                self.version
            )));
        }
        Ok(())
    }
}

/// A free block in the free list chain
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FreeBlock {
    next_free: Option<PageId>,
}

struct BlockFileState {
    file: File,
    header: BlockFileHeader,
    /// Ids currently on the free list
    free_ids: HashSet<PageId>,
}

/// Container writing fixed-size blocks to a single file.
pub struct BlockFileContainer {
    state: Mutex<BlockFileState>,
    path: PathBuf,
    block_size: usize,
}

impl BlockFileContainer {
    /// Creates a new, empty block file, truncating any existing file.
    pub fn create(path: impl AsRef<Path>, block_size: usize) -> TreeResult<Self> {
        if block_size < MIN_BLOCK_SIZE {
            return Err(TreeError::configuration(format!(
                "Block size {} is below the minimum of {} bytes",
                block_size, MIN_BLOCK_SIZE
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;

        let container = Self {
            state: Mutex::new(BlockFileState {
                file,
                header: BlockFileHeader::new(block_size),
                free_ids: HashSet::new(),
            }),
            path: path.as_ref().to_path_buf(),
            block_size,
        };
        {
            let mut state = container.state.lock();
            container.write_header(&mut state)?;
        }
        Ok(container)
    }

    /// Opens an existing block file. Only the header and the free list
    /// chain are read.
    pub fn open(path: impl AsRef<Path>) -> TreeResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;

        let mut probe = vec![0u8; HEADER_PROBE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut probe)?;
        let (header, _): (BlockFileHeader, usize) =
            bincode::serde::decode_from_slice(&probe, bincode::config::legacy())?;
        header.validate()?;

        let block_size = header.block_size as usize;
        let container = Self {
            state: Mutex::new(BlockFileState {
                file,
                header,
                free_ids: HashSet::new(),
            }),
            path: path.as_ref().to_path_buf(),
            block_size,
        };

        {
            let mut state = container.state.lock();
            let mut cursor = state.header.free_list_head;
            while let Some(id) = cursor {
                if !state.free_ids.insert(id) {
                    return Err(TreeError::Serialization(format!(
                        "Free list contains a cycle at block {}",
                        id
                    )));
                }
                cursor = container.read_free_block(&mut state, id)?.next_free;
            }
        }
        Ok(container)
    }

    /// Opens the file if it exists and is non-empty, creates it otherwise.
    pub fn open_or_create(path: impl AsRef<Path>, block_size: usize) -> TreeResult<Self> {
        let existing = std::fs::metadata(path.as_ref())
            .map(|m| m.len() > 0)
            .unwrap_or(false);
        if existing {
            let container = Self::open(path)?;
            if container.block_size != block_size {
                return Err(TreeError::configuration(format!(
                    "File uses block size {} but {} was requested",
                    container.block_size, block_size
                )));
            }
            Ok(container)
        } else {
            Self::create(path, block_size)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn header(&self) -> BlockFileHeader {
        self.state.lock().header.clone()
    }

    fn offset(&self, id: PageId) -> u64 {
        (id + 1) * self.block_size as u64
    }

    fn write_header(&self, state: &mut BlockFileState) -> TreeResult<()> {
        let mut bytes = bincode::serde::encode_to_vec(&state.header, bincode::config::legacy())?;
        bytes.resize(self.block_size, 0);
        state.file.seek(SeekFrom::Start(0))?;
        state.file.write_all(&bytes)?;
        Ok(())
    }

    fn write_block(
        &self,
        state: &mut BlockFileState,
        id: PageId,
        status: u8,
        payload: &[u8],
    ) -> TreeResult<()> {
        if payload.len() + BLOCK_PREFIX > self.block_size {
            return Err(TreeError::Serialization(format!(
                "Page too large: {} bytes (max {})",
                payload.len(),
                self.block_size - BLOCK_PREFIX
            )));
        }
        let mut block = Vec::with_capacity(self.block_size);
        block.push(status);
        block.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        block.extend_from_slice(payload);
        block.resize(self.block_size, 0);

        let offset = self.offset(id);
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.write_all(&block)?;
        Ok(())
    }

    fn read_block(&self, state: &mut BlockFileState, id: PageId) -> TreeResult<(u8, Vec<u8>)> {
        let offset = self.offset(id);
        let mut block = vec![0u8; self.block_size];
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.read_exact(&mut block)?;

        let status = block[0];
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&block[1..BLOCK_PREFIX]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len + BLOCK_PREFIX > self.block_size {
            return Err(TreeError::Serialization(format!(
                "Block {} declares {} payload bytes, more than fit in a block",
                id, len
            )));
        }
        block.truncate(BLOCK_PREFIX + len);
        block.drain(..BLOCK_PREFIX);
        Ok((status, block))
    }

    fn read_free_block(&self, state: &mut BlockFileState, id: PageId) -> TreeResult<FreeBlock> {
        let (status, payload) = self.read_block(state, id)?;
        if status != STATUS_FREE {
            return Err(TreeError::Serialization(format!(
                "Block {} is on the free list but not marked free",
                id
            )));
        }
        let (free, _): (FreeBlock, usize) =
            bincode::serde::decode_from_slice(&payload, bincode::config::legacy())?;
        Ok(free)
    }

    fn is_live(state: &BlockFileState, id: PageId) -> bool {
        id < state.header.next_page_id && !state.free_ids.contains(&id)
    }
}

impl Container for BlockFileContainer {
    fn get(&self, id: PageId) -> TreeResult<Page> {
        let mut state = self.state.lock();
        if !Self::is_live(&state, id) {
            return Err(TreeError::MissingPage(id));
        }
        let (status, payload) = self.read_block(&mut state, id)?;
        if status != STATUS_USED {
            return Err(TreeError::MissingPage(id));
        }
        Ok(payload)
    }

    fn update(&self, id: PageId, page: &[u8]) -> TreeResult<()> {
        let mut state = self.state.lock();
        if !Self::is_live(&state, id) {
            return Err(TreeError::MissingPage(id));
        }
        self.write_block(&mut state, id, STATUS_USED, page)
    }

    fn remove(&self, id: PageId) -> TreeResult<()> {
        let mut state = self.state.lock();
        if !Self::is_live(&state, id) {
            return Err(TreeError::MissingPage(id));
        }
        let free = FreeBlock {
            next_free: state.header.free_list_head,
        };
        let bytes = bincode::serde::encode_to_vec(&free, bincode::config::legacy())?;
        self.write_block(&mut state, id, STATUS_FREE, &bytes)?;

        state.header.free_list_head = Some(id);
        state.header.free_page_count += 1;
        state.free_ids.insert(id);
        self.write_header(&mut state)
    }

    fn reserve(&self) -> TreeResult<PageId> {
        let mut state = self.state.lock();
        let id = match state.header.free_list_head {
            Some(id) => {
                let free = self.read_free_block(&mut state, id)?;
                state.header.free_list_head = free.next_free;
                state.header.free_page_count = state.header.free_page_count.saturating_sub(1);
                state.free_ids.remove(&id);
                id
            }
            None => {
                let id = state.header.next_page_id;
                state.header.next_page_id += 1;
                id
            }
        };
        self.write_block(&mut state, id, STATUS_RESERVED, &[])?;
        self.write_header(&mut state)?;
        Ok(id)
    }

    fn contains(&self, id: PageId) -> bool {
        Self::is_live(&self.state.lock(), id)
    }

    fn len(&self) -> usize {
        let state = self.state.lock();
        (state.header.next_page_id - state.header.free_page_count) as usize
    }

    fn max_page_size(&self) -> Option<usize> {
        Some(self.block_size - BLOCK_PREFIX)
    }

    fn flush(&self) -> TreeResult<()> {
        let mut state = self.state.lock();
        self.write_header(&mut state)?;
        state.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_writes_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.blocks");
        let container = BlockFileContainer::create(&path, 512).unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 512);
        assert_eq!(container.header().next_page_id, 0);
        assert!(container.is_empty());
    }

    #[test]
    fn test_block_size_too_small() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.blocks");
        let result = BlockFileContainer::create(&path, 16);
        assert!(matches!(result, Err(TreeError::Configuration(_))));
    }

    #[test]
    fn test_insert_get_update_remove() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.blocks");
        let container = BlockFileContainer::create(&path, 256).unwrap();

        let a = container.insert(b"first page").unwrap();
        let b = container.insert(b"second page").unwrap();
        assert_eq!(container.get(a).unwrap(), b"first page".to_vec());
        assert_eq!(container.get(b).unwrap(), b"second page".to_vec());

        container.update(a, b"rewritten").unwrap();
        assert_eq!(container.get(a).unwrap(), b"rewritten".to_vec());

        container.remove(a).unwrap();
        assert!(matches!(container.get(a), Err(TreeError::MissingPage(_))));
        assert_eq!(container.len(), 1);
    }

    #[test]
    fn test_oversized_page_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.blocks");
        let container = BlockFileContainer::create(&path, 128).unwrap();
        let id = container.reserve().unwrap();
        let result = container.update(id, &[7u8; 200]);
        assert!(matches!(result, Err(TreeError::Serialization(_))));
    }

    #[test]
    fn test_free_list_reuse_lifo() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.blocks");
        let container = BlockFileContainer::create(&path, 256).unwrap();

        let ids: Vec<_> = (0..4)
            .map(|i| container.insert(&[i as u8; 10]).unwrap())
            .collect();
        container.remove(ids[1]).unwrap();
        container.remove(ids[2]).unwrap();
        assert_eq!(container.header().free_page_count, 2);

        assert_eq!(container.reserve().unwrap(), ids[2]);
        assert_eq!(container.reserve().unwrap(), ids[1]);
        assert_eq!(container.reserve().unwrap(), 4);
        assert_eq!(container.header().free_page_count, 0);
    }

    #[test]
    fn test_reopen_preserves_pages_and_free_list() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.blocks");
        let (kept, freed) = {
            let container = BlockFileContainer::create(&path, 256).unwrap();
            let kept = container.insert(b"durable").unwrap();
            let freed = container.insert(b"garbage").unwrap();
            container.remove(freed).unwrap();
            container.flush().unwrap();
            (kept, freed)
        };

        let container = BlockFileContainer::open(&path).unwrap();
        assert_eq!(container.block_size(), 256);
        assert_eq!(container.get(kept).unwrap(), b"durable".to_vec());
        assert!(!container.contains(freed));
        assert_eq!(container.reserve().unwrap(), freed);
    }

    #[test]
    fn test_open_or_create_block_size_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.blocks");
        BlockFileContainer::create(&path, 256).unwrap();
        let result = BlockFileContainer::open_or_create(&path, 512);
        assert!(matches!(result, Err(TreeError::Configuration(_))));
    }

    #[test]
    fn test_open_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage.blocks");
        std::fs::write(&path, vec![0xAB; 512]).unwrap();
        assert!(BlockFileContainer::open(&path).is_err());
    }
}
