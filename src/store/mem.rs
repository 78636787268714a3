use std::collections::BTreeMap;
use std::ops::Bound;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::store::{KvStore, Value};

/// Terminal in-memory ordered store: the persistent end of a session chain.
///
/// `MemStore` holds the authoritative key/value set a chain of sessions
/// buffers against. It never tombstones: an erase removes the entry
/// outright, so `is_deleted` is always false here.
#[derive(Debug, Default)]
pub struct MemStore {
    entries: RwLock<BTreeMap<Bytes, Bytes>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, key: impl AsRef<[u8]>) -> Option<Value> {
        self.entries.read().get(key.as_ref()).cloned()
    }

    pub fn write(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.entries.write().insert(key.into(), value.into());
    }

    pub fn erase(&self, key: impl AsRef<[u8]>) {
        self.entries.write().remove(key.as_ref());
    }

    pub fn contains(&self, key: impl AsRef<[u8]>) -> bool {
        self.entries.read().contains_key(key.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// All entries in key order. Intended for assertions and small stores.
    pub fn entries(&self) -> Vec<(Bytes, Bytes)> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl KvStore for MemStore {
    fn read(&self, key: &[u8]) -> Option<Value> {
        MemStore::read(self, key)
    }

    fn write(&self, key: Bytes, value: Bytes) -> anyhow::Result<()> {
        MemStore::write(self, key, value);
        Ok(())
    }

    fn erase(&self, key: &[u8]) -> anyhow::Result<()> {
        MemStore::erase(self, key);
        Ok(())
    }

    fn contains(&self, key: &[u8]) -> bool {
        MemStore::contains(self, key)
    }

    fn first_key(&self) -> Option<Bytes> {
        self.entries.read().keys().next().cloned()
    }

    fn last_key(&self) -> Option<Bytes> {
        self.entries.read().keys().next_back().cloned()
    }

    fn find_key(&self, key: &[u8]) -> Option<Bytes> {
        self.entries
            .read()
            .get_key_value(key)
            .map(|(k, _)| k.clone())
    }

    fn lower_bound_key(&self, key: &[u8]) -> Option<Bytes> {
        self.entries
            .read()
            .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone())
    }

    fn upper_bound_key(&self, key: &[u8]) -> Option<Bytes> {
        self.entries
            .read()
            .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone())
    }

    fn prev_key(&self, key: &[u8]) -> Option<Bytes> {
        self.entries
            .read()
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
            .next_back()
            .map(|(k, _)| k.clone())
    }

    fn write_batch<I>(&self, pairs: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = (Bytes, Bytes)>,
    {
        let mut guard = self.entries.write();
        for (key, value) in pairs {
            guard.insert(key, value);
        }
        Ok(())
    }

    fn erase_batch<I>(&self, keys: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = Bytes>,
    {
        let mut guard = self.entries.write();
        for key in keys {
            guard.remove(&key);
        }
        Ok(())
    }
}
