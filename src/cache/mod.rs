//! Layer-local write-set cache.
//!
//! Holds the values written at one session layer plus values lazily
//! materialized from the parent during reads. The session decides which of
//! those keys are authoritative (its updated-key set); the cache itself is
//! just an ordered key/value map with a deliberately small API so the
//! representation can change without touching call sites.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::Bound;

use bytes::Bytes;

use crate::store::KvStore;

#[derive(Debug, Default)]
pub struct WriteCache {
    entries: RefCell<BTreeMap<Bytes, Bytes>>,
}

impl WriteCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, key: &[u8]) -> Option<Bytes> {
        self.entries.borrow().get(key).cloned()
    }

    pub fn write(&self, key: Bytes, value: Bytes) {
        self.entries.borrow_mut().insert(key, value);
    }

    pub fn erase(&self, key: &[u8]) {
        self.entries.borrow_mut().remove(key);
    }

    pub fn erase_batch<I>(&self, keys: I)
    where
        I: IntoIterator<Item = Bytes>,
    {
        let mut entries = self.entries.borrow_mut();
        for key in keys {
            entries.remove(&key);
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.borrow().contains_key(key)
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// All cached keys in key order.
    pub fn keys(&self) -> Vec<Bytes> {
        self.entries.borrow().keys().cloned().collect()
    }

    pub fn first_key(&self) -> Option<Bytes> {
        self.entries.borrow().keys().next().cloned()
    }

    pub fn find_key(&self, key: &[u8]) -> Option<Bytes> {
        self.entries
            .borrow()
            .get_key_value(key)
            .map(|(k, _)| k.clone())
    }

    pub fn lower_bound_key(&self, key: &[u8]) -> Option<Bytes> {
        self.entries
            .borrow()
            .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone())
    }

    pub fn upper_bound_key(&self, key: &[u8]) -> Option<Bytes> {
        self.entries
            .borrow()
            .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone())
    }

    pub fn prev_key(&self, key: &[u8]) -> Option<Bytes> {
        self.entries
            .borrow()
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
            .next_back()
            .map(|(k, _)| k.clone())
    }

    /// Copy the selected entries into another store. Keys with no cached
    /// value are skipped.
    pub fn write_to<S, I>(&self, store: &S, keys: I) -> anyhow::Result<()>
    where
        S: KvStore,
        I: IntoIterator<Item = Bytes>,
    {
        let pairs: Vec<(Bytes, Bytes)> = {
            let entries = self.entries.borrow();
            keys.into_iter()
                .filter_map(|key| entries.get(&key).map(|value| (key, value.clone())))
                .collect()
        };
        store.write_batch(pairs)
    }
}
