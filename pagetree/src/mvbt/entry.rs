use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::container::PageId;
use crate::converter::{Converter, LifespanConverter};
use crate::errors::TreeResult;
use crate::region::{Lifespan, Version};

/// A versioned key/value pair stored in an MVBT leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MvEntry<K, V> {
    pub key: K,
    pub lifespan: Lifespan,
    pub value: V,
}

impl<K, V> MvEntry<K, V> {
    pub fn new(key: K, lifespan: Lifespan, value: V) -> Self {
        Self {
            key,
            lifespan,
            value,
        }
    }

    pub fn alive_at(&self, v: Version) -> bool {
        self.lifespan.alive_at(v)
    }
}

/// Key, lifespan, value.
pub struct MvEntryConverter<K, V> {
    key: Arc<dyn Converter<K>>,
    value: Arc<dyn Converter<V>>,
}

impl<K, V> MvEntryConverter<K, V> {
    pub fn new(key: Arc<dyn Converter<K>>, value: Arc<dyn Converter<V>>) -> Self {
        Self { key, value }
    }
}

impl<K, V> Converter<MvEntry<K, V>> for MvEntryConverter<K, V> {
    fn write(&self, value: &MvEntry<K, V>, out: &mut Vec<u8>) -> TreeResult<()> {
        self.key.write(&value.key, out)?;
        LifespanConverter.write(&value.lifespan, out)?;
        self.value.write(&value.value, out)
    }

    fn read(&self, input: &mut &[u8]) -> TreeResult<MvEntry<K, V>> {
        let key = self.key.read(input)?;
        let lifespan = LifespanConverter.read(input)?;
        let value = self.value.read(input)?;
        Ok(MvEntry::new(key, lifespan, value))
    }

    fn max_object_size(&self) -> usize {
        self.key.max_object_size()
            + LifespanConverter.max_object_size()
            + self.value.max_object_size()
    }
}

/// One root of the tree together with the versions it served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootRecord {
    pub lifespan: Lifespan,
    pub page: PageId,
    pub height: u32,
}
