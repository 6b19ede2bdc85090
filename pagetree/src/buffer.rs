//! LRU buffer of decoded pages.
//!
//! The buffer sits between a tree and its [`Container`]. Pages are decoded
//! once through the buffer's [`Converter`] and kept until evicted. Pages are
//! only read from the container when first accessed; dirty pages are written
//! back on eviction or [`flush`](Buffer::flush).
//!
//! Fixed (pinned) pages are never evicted. When every slot is pinned the
//! buffer admits the page anyway and exceeds its capacity until pages are
//! unfixed again.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use log::{debug, warn};
use lru::LruCache;

use crate::container::{Container, PageId};
use crate::converter::Converter;
use crate::errors::{TreeError, TreeResult};

/// A cached page with its pin count and dirty flag
struct Slot<T> {
    value: T,
    dirty: bool,
    pins: usize,
}

/// Counters describing buffer behaviour since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub hits: u64,
    pub misses: u64,
    /// Pages read and decoded from the container
    pub reads: u64,
    /// Pages encoded and written to the container
    pub writes: u64,
    pub evictions: u64,
}

impl BufferStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl Display for BufferStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "hits={} misses={} reads={} writes={} evictions={}",
            self.hits, self.misses, self.reads, self.writes, self.evictions
        )
    }
}

/// Fixed-capacity cache of decoded pages over a container.
pub struct Buffer<T> {
    container: Arc<dyn Container>,
    converter: Arc<dyn Converter<T>>,
    slots: LruCache<PageId, Slot<T>>,
    capacity: usize,
    stats: BufferStats,
}

impl<T: Clone> Buffer<T> {
    pub fn new(
        container: Arc<dyn Container>,
        converter: Arc<dyn Converter<T>>,
        capacity: usize,
    ) -> Self {
        Self {
            container,
            converter,
            slots: LruCache::unbounded(),
            capacity: capacity.max(1),
            stats: BufferStats::default(),
        }
    }

    pub fn container(&self) -> &Arc<dyn Container> {
        &self.container
    }

    /// Returns a copy of the page, loading it on a miss.
    pub fn get(&mut self, id: PageId) -> TreeResult<T> {
        self.load(id)?;
        self.slots
            .get(&id)
            .map(|slot| slot.value.clone())
            .ok_or(TreeError::MissingPage(id))
    }

    /// Pins the page and returns a snapshot of it.
    pub fn fix(&mut self, id: PageId) -> TreeResult<T> {
        self.load(id)?;
        let slot = self.slots.get_mut(&id).ok_or(TreeError::MissingPage(id))?;
        slot.pins += 1;
        Ok(slot.value.clone())
    }

    /// Releases one pin taken by [`fix`](Self::fix).
    pub fn unfix(&mut self, id: PageId) -> TreeResult<()> {
        match self.slots.peek_mut(&id) {
            Some(slot) if slot.pins > 0 => {
                slot.pins -= 1;
                Ok(())
            }
            _ => Err(TreeError::InvalidState(format!(
                "page {} is not fixed",
                id
            ))),
        }
    }

    /// Replaces the cached value and marks it dirty.
    pub fn update(&mut self, id: PageId, value: T) -> TreeResult<()> {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.value = value;
            slot.dirty = true;
            return Ok(());
        }
        if !self.container.contains(id) {
            return Err(TreeError::MissingPage(id));
        }
        self.admit(id, value, true)
    }

    /// Reserves a fresh page id and caches `value` under it as dirty.
    pub fn insert(&mut self, value: T) -> TreeResult<PageId> {
        let id = self.container.reserve()?;
        self.admit(id, value, true)?;
        Ok(id)
    }

    /// Drops the page from the buffer and the container.
    pub fn remove(&mut self, id: PageId) -> TreeResult<()> {
        if let Some(slot) = self.slots.peek(&id) {
            if slot.pins > 0 {
                return Err(TreeError::InvalidState(format!(
                    "cannot remove fixed page {}",
                    id
                )));
            }
        }
        self.slots.pop(&id);
        self.container.remove(id)
    }

    /// Writes every dirty page back and flushes the container.
    pub fn flush(&mut self) -> TreeResult<()> {
        let dirty: Vec<PageId> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.dirty)
            .map(|(id, _)| *id)
            .collect();
        for id in dirty {
            self.write_back(id)?;
        }
        self.container.flush()
    }

    pub fn contains(&self, id: PageId) -> bool {
        self.slots.contains(&id)
    }

    pub fn is_fixed(&self, id: PageId) -> bool {
        self.slots.peek(&id).map_or(false, |slot| slot.pins > 0)
    }

    pub fn is_dirty(&self, id: PageId) -> bool {
        self.slots.peek(&id).map_or(false, |slot| slot.dirty)
    }

    /// Number of cached pages.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    fn load(&mut self, id: PageId) -> TreeResult<()> {
        if self.slots.contains(&id) {
            self.stats.hits += 1;
            return Ok(());
        }
        self.stats.misses += 1;
        let page = self.container.get(id)?;
        let value = self.converter.from_bytes(&page)?;
        self.stats.reads += 1;
        self.admit(id, value, false)
    }

    fn admit(&mut self, id: PageId, value: T, dirty: bool) -> TreeResult<()> {
        self.make_room()?;
        self.slots.put(
            id,
            Slot {
                value,
                dirty,
                pins: 0,
            },
        );
        Ok(())
    }

    /// Evicts least-recently-used unpinned pages until a slot is free.
    fn make_room(&mut self) -> TreeResult<()> {
        while self.slots.len() >= self.capacity {
            let victim = self
                .slots
                .iter()
                .rev()
                .find(|(_, slot)| slot.pins == 0)
                .map(|(id, _)| *id);

            let Some(id) = victim else {
                warn!(
                    "All {} buffer slots are fixed, growing beyond capacity {}",
                    self.slots.len(),
                    self.capacity
                );
                return Ok(());
            };

            self.write_back(id)?;
            self.slots.pop(&id);
            self.stats.evictions += 1;
            debug!("Evicted page {} from buffer", id);
        }
        Ok(())
    }

    fn write_back(&mut self, id: PageId) -> TreeResult<()> {
        let Some(slot) = self.slots.peek_mut(&id) else {
            return Ok(());
        };
        if !slot.dirty {
            return Ok(());
        }
        let bytes = self.converter.to_bytes(&slot.value)?;
        self.container.update(id, &bytes)?;
        slot.dirty = false;
        self.stats.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::MemoryContainer;
    use crate::converter::BincodeConverter;

    fn buffer_with_pages(capacity: usize, values: &[u64]) -> (Buffer<u64>, Vec<PageId>) {
        let container: Arc<dyn Container> = Arc::new(MemoryContainer::new());
        let converter = Arc::new(BincodeConverter::<u64>::fixed());
        let ids = values
            .iter()
            .map(|v| container.insert(&converter.to_bytes(v).unwrap()).unwrap())
            .collect();
        (Buffer::new(container, converter, capacity), ids)
    }

    #[test]
    fn test_lru_evicts_least_recently_unfixed() {
        let (mut buffer, ids) = buffer_with_pages(2, &[10, 20, 30]);
        let (a, b, c) = (ids[0], ids[1], ids[2]);

        assert_eq!(buffer.fix(a).unwrap(), 10);
        buffer.unfix(a).unwrap();
        assert_eq!(buffer.fix(b).unwrap(), 20);
        buffer.unfix(b).unwrap();
        assert_eq!(buffer.fix(c).unwrap(), 30);

        assert!(!buffer.contains(a));
        assert!(buffer.contains(b));
        assert!(buffer.contains(c));
        assert_eq!(buffer.stats().evictions, 1);
    }

    #[test]
    fn test_pinned_pages_are_not_evicted() {
        let (mut buffer, ids) = buffer_with_pages(2, &[1, 2, 3]);
        buffer.fix(ids[0]).unwrap();
        buffer.fix(ids[1]).unwrap();
        buffer.fix(ids[2]).unwrap();

        assert_eq!(buffer.len(), 3);
        assert!(buffer.is_fixed(ids[0]));
        assert_eq!(buffer.stats().evictions, 0);

        buffer.unfix(ids[0]).unwrap();
        buffer.unfix(ids[1]).unwrap();
        buffer.unfix(ids[2]).unwrap();
        buffer.get(ids[0]).unwrap();
        assert!(buffer.len() <= 3);
    }

    #[test]
    fn test_unfix_without_fix_is_invalid_state() {
        let (mut buffer, ids) = buffer_with_pages(2, &[1]);
        let err = buffer.unfix(ids[0]).unwrap_err();
        assert!(matches!(err, TreeError::InvalidState(_)));

        buffer.fix(ids[0]).unwrap();
        buffer.unfix(ids[0]).unwrap();
        assert!(buffer.unfix(ids[0]).is_err());
    }

    #[test]
    fn test_dirty_page_written_back_on_eviction() {
        let (mut buffer, ids) = buffer_with_pages(1, &[1, 2]);
        buffer.update(ids[0], 100).unwrap();
        assert!(buffer.is_dirty(ids[0]));

        buffer.get(ids[1]).unwrap();
        assert!(!buffer.contains(ids[0]));
        assert_eq!(buffer.stats().writes, 1);

        let raw = buffer.container().get(ids[0]).unwrap();
        assert_eq!(BincodeConverter::<u64>::fixed().from_bytes(&raw).unwrap(), 100);
        assert_eq!(buffer.get(ids[0]).unwrap(), 100);
    }

    #[test]
    fn test_insert_remove_and_flush() {
        let (mut buffer, _) = buffer_with_pages(4, &[]);
        let id = buffer.insert(7).unwrap();
        assert!(buffer.is_dirty(id));
        buffer.flush().unwrap();
        assert!(!buffer.is_dirty(id));
        assert!(buffer.container().get(id).is_ok());

        buffer.remove(id).unwrap();
        assert!(!buffer.contains(id));
        assert!(matches!(buffer.get(id), Err(TreeError::MissingPage(_))));
    }

    #[test]
    fn test_remove_fixed_page_fails() {
        let (mut buffer, ids) = buffer_with_pages(2, &[5]);
        buffer.fix(ids[0]).unwrap();
        assert!(matches!(
            buffer.remove(ids[0]),
            Err(TreeError::InvalidState(_))
        ));
    }

    #[test]
    fn test_hit_and_miss_counters() {
        let (mut buffer, ids) = buffer_with_pages(2, &[5]);
        buffer.get(ids[0]).unwrap();
        buffer.get(ids[0]).unwrap();
        let stats = buffer.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.hit_ratio(), 0.5);
    }
}
