//! Tree nodes and their page codec.

use std::sync::Arc;

use crate::constants::{CHILD_REF_SIZE, NODE_HEADER_SIZE};
use crate::container::PageId;
use crate::converter::{read_u32, read_u64, read_u8, Converter};
use crate::errors::{TreeError, TreeResult};

/// Reference from an index node to a child page
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry<R> {
    pub region: R,
    pub child: PageId,
}

impl<R> IndexEntry<R> {
    pub fn new(region: R, child: PageId) -> Self {
        Self { region, child }
    }
}

/// Fill state of a node relative to `[min_entries, capacity]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Underflow,
    Balanced,
    Overflow,
}

/// A decoded page. Leaves sit at level 0.
#[derive(Debug, Clone, PartialEq)]
pub enum Node<E, R> {
    Leaf { entries: Vec<E> },
    Index { level: u32, children: Vec<IndexEntry<R>> },
}

impl<E, R> Node<E, R> {
    pub fn empty_leaf() -> Self {
        Node::Leaf {
            entries: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }

    pub fn level(&self) -> u32 {
        match self {
            Node::Leaf { .. } => 0,
            Node::Index { level, .. } => *level,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Node::Leaf { entries } => entries.len(),
            Node::Index { children, .. } => children.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self, min_entries: usize, capacity: usize) -> NodeState {
        let len = self.len();
        if len > capacity {
            NodeState::Overflow
        } else if len < min_entries {
            NodeState::Underflow
        } else {
            NodeState::Balanced
        }
    }

    /// Moves the entries from `at` onwards into a new node of the same level.
    pub fn split_off(&mut self, at: usize) -> Self {
        match self {
            Node::Leaf { entries } => Node::Leaf {
                entries: entries.split_off(at),
            },
            Node::Index { level, children } => Node::Index {
                level: *level,
                children: children.split_off(at),
            },
        }
    }

    /// Appends the content of a node of the same level.
    pub fn append(&mut self, other: Self) -> TreeResult<()> {
        match (self, other) {
            (Node::Leaf { entries }, Node::Leaf { entries: mut more }) => {
                entries.append(&mut more);
                Ok(())
            }
            (
                Node::Index { level, children },
                Node::Index {
                    level: other_level,
                    children: mut more,
                },
            ) if *level == other_level => {
                children.append(&mut more);
                Ok(())
            }
            _ => Err(TreeError::invariant(
                "cannot merge nodes of different levels",
            )),
        }
    }
}

const TAG_LEAF: u8 = 0;
const TAG_INDEX: u8 = 1;

/// Page codec for nodes.
///
/// Layout: `[crc32 u32][tag u8][level u32][count u32][entries...]`, all
/// integers little endian. The checksum covers everything after itself.
pub struct NodeConverter<E, R> {
    entry: Arc<dyn Converter<E>>,
    region: Arc<dyn Converter<R>>,
    leaf_capacity: usize,
    index_capacity: usize,
}

impl<E, R> NodeConverter<E, R> {
    pub fn new(
        entry: Arc<dyn Converter<E>>,
        region: Arc<dyn Converter<R>>,
        leaf_capacity: usize,
        index_capacity: usize,
    ) -> Self {
        Self {
            entry,
            region,
            leaf_capacity,
            index_capacity,
        }
    }

    pub fn entry_converter(&self) -> &Arc<dyn Converter<E>> {
        &self.entry
    }

    pub fn region_converter(&self) -> &Arc<dyn Converter<R>> {
        &self.region
    }

    /// Serialized size of one index entry.
    pub fn index_entry_size(&self) -> usize {
        self.region.max_object_size() + CHILD_REF_SIZE
    }

    /// Largest number of items of `item_size` bytes fitting a page.
    pub fn capacity_for(page_size: usize, item_size: usize) -> usize {
        if item_size == 0 {
            return 0;
        }
        page_size.saturating_sub(NODE_HEADER_SIZE) / item_size
    }
}

impl<E, R> Converter<Node<E, R>> for NodeConverter<E, R> {
    fn write(&self, value: &Node<E, R>, out: &mut Vec<u8>) -> TreeResult<()> {
        let start = out.len();
        out.extend_from_slice(&[0u8; 4]);
        match value {
            Node::Leaf { entries } => {
                out.push(TAG_LEAF);
                out.extend_from_slice(&0u32.to_le_bytes());
                out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
                for entry in entries {
                    self.entry.write(entry, out)?;
                }
            }
            Node::Index { level, children } => {
                out.push(TAG_INDEX);
                out.extend_from_slice(&level.to_le_bytes());
                out.extend_from_slice(&(children.len() as u32).to_le_bytes());
                for child in children {
                    self.region.write(&child.region, out)?;
                    out.extend_from_slice(&child.child.to_le_bytes());
                }
            }
        }
        let checksum = crc32fast::hash(&out[start + 4..]);
        out[start..start + 4].copy_from_slice(&checksum.to_le_bytes());
        Ok(())
    }

    fn read(&self, input: &mut &[u8]) -> TreeResult<Node<E, R>> {
        let stored = read_u32(input)?;
        let computed = crc32fast::hash(input);
        if stored != computed {
            return Err(TreeError::Serialization(format!(
                "node checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored, computed
            )));
        }

        let tag = read_u8(input)?;
        let level = read_u32(input)?;
        let count = read_u32(input)? as usize;
        match tag {
            TAG_LEAF => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(self.entry.read(input)?);
                }
                Ok(Node::Leaf { entries })
            }
            TAG_INDEX => {
                let mut children = Vec::with_capacity(count);
                for _ in 0..count {
                    let region = self.region.read(input)?;
                    let child = read_u64(input)?;
                    children.push(IndexEntry::new(region, child));
                }
                Ok(Node::Index { level, children })
            }
            other => Err(TreeError::Serialization(format!(
                "unknown node tag {}",
                other
            ))),
        }
    }

    fn max_object_size(&self) -> usize {
        let leaf = self.leaf_capacity * self.entry.max_object_size();
        let index = self.index_capacity * self.index_entry_size();
        NODE_HEADER_SIZE + leaf.max(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::{BincodeConverter, SeparatorConverter};
    use crate::region::Separator;

    fn converter() -> NodeConverter<u64, Separator<u64>> {
        let key: Arc<dyn Converter<u64>> = Arc::new(BincodeConverter::<u64>::fixed());
        NodeConverter::new(
            key.clone(),
            Arc::new(SeparatorConverter::new(key)),
            4,
            4,
        )
    }

    #[test]
    fn test_leaf_and_index_encoding() {
        let conv = converter();
        let leaf: Node<u64, Separator<u64>> = Node::Leaf {
            entries: vec![1, 2, 3],
        };
        let bytes = conv.to_bytes(&leaf).unwrap();
        assert_eq!(bytes.len(), NODE_HEADER_SIZE + 3 * 8);
        assert_eq!(conv.from_bytes(&bytes).unwrap(), leaf);

        let index: Node<u64, Separator<u64>> = Node::Index {
            level: 2,
            children: vec![
                IndexEntry::new(Separator::Value(5), 10),
                IndexEntry::new(Separator::PosInfinity, 11),
            ],
        };
        let decoded = conv.from_bytes(&conv.to_bytes(&index).unwrap()).unwrap();
        assert_eq!(decoded.level(), 2);
        assert_eq!(decoded, index);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let conv = converter();
        let leaf: Node<u64, Separator<u64>> = Node::Leaf {
            entries: vec![7, 8],
        };
        let mut bytes = conv.to_bytes(&leaf).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let err = conv.from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_oversized_node_rejected() {
        let conv = converter();
        let leaf: Node<u64, Separator<u64>> = Node::Leaf {
            entries: (0..9).collect(),
        };
        assert!(matches!(conv.to_bytes(&leaf), Err(TreeError::Serialization(_))));
    }

    #[test]
    fn test_split_append_and_state() {
        let mut node: Node<u64, Separator<u64>> = Node::Leaf {
            entries: vec![1, 2, 3, 4, 5],
        };
        assert_eq!(node.state(2, 4), NodeState::Overflow);
        let right = node.split_off(2);
        assert_eq!(node.len(), 2);
        assert_eq!(right.len(), 3);
        assert_eq!(node.state(3, 4), NodeState::Underflow);
        node.append(right).unwrap();
        assert_eq!(node.state(2, 5), NodeState::Balanced);

        let index: Node<u64, Separator<u64>> = Node::Index {
            level: 1,
            children: vec![],
        };
        assert!(node.append(index).is_err());
    }

    #[test]
    fn test_capacity_for() {
        assert_eq!(NodeConverter::<u64, u64>::capacity_for(4096, 8), (4096 - 13) / 8);
        assert_eq!(NodeConverter::<u64, u64>::capacity_for(10, 8), 0);
    }
}
