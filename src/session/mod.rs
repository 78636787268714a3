use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::ops::Bound;

use anyhow::Context;
use bytes::Bytes;
use tracing::{debug, error, trace};

use crate::cache::WriteCache;
use crate::store::{KvStore, Value};

mod iter;

pub use iter::SessionIter;

/// Traversal hints for one key in the iterator cache.
///
/// `next_in_cache` / `previous_in_cache` are promises: when set, the key's
/// immediate neighbor in the merged ordered view is present in the cache.
/// When unset, nothing is known and the neighbor must be recomputed on
/// demand. `deleted` tracks whether the key is tombstoned at this layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterState {
    pub next_in_cache: bool,
    pub previous_in_cache: bool,
    pub deleted: bool,
}

/// How `update_iter_cache` treats the entry it touches.
#[derive(Debug, Clone, Copy)]
struct CacheUpdate {
    /// Only make sure the key exists in the cache; leave hints alone.
    prime_only: bool,
    /// Recompute neighbors even when both hints are already set.
    recalculate: bool,
    mark_deleted: bool,
    /// Apply `mark_deleted` to the entry. This is the only path that
    /// mutates the `deleted` flag.
    overwrite: bool,
}

/// Which initial position the iterator factory asks each data source for.
#[derive(Debug, Clone, Copy)]
enum SeekTo<'k> {
    First,
    Find(&'k [u8]),
    LowerBound(&'k [u8]),
    UpperBound(&'k [u8]),
}

/// One layer of buffered writes and erases over a parent store.
///
/// Semantics:
/// - Reads check the local tombstones, then the write cache, then the
///   parent; parent hits are materialized into the local write cache.
/// - `commit` writes the layer through to the immediate parent (all erases
///   strictly before any write) and clears it; `undo` discards it.
/// - Dropping an attached session **commits** it. Call [`Session::undo`]
///   (or [`Session::detach`]) first to roll back instead.
///
/// A session holds a shared reference to its parent and mutates it only
/// through `&self` interior mutability, which is what lets sessions stack
/// on each other. The engine is single-threaded: `Session` is `!Sync`, and
/// iteration counts as exclusive use of the layer.
pub struct Session<'p, P: KvStore> {
    parent: Cell<Option<&'p P>>,
    cache: WriteCache,
    /// Keys written at this layer; the authoritative write set for commit.
    updated: RefCell<HashSet<Bytes>>,
    /// Keys tombstoned at this layer; masks the parent until commit.
    deleted: RefCell<HashSet<Bytes>>,
    /// Ordered index that accelerates in-order traversal. Holds hint
    /// records, never values.
    iter_cache: RefCell<BTreeMap<Bytes, IterState>>,
}

impl<'p, P: KvStore> Session<'p, P> {
    /// A detached session: reads see nothing, commit is a no-op.
    pub fn new() -> Self {
        Self {
            parent: Cell::new(None),
            cache: WriteCache::new(),
            updated: RefCell::new(HashSet::new()),
            deleted: RefCell::new(HashSet::new()),
            iter_cache: RefCell::new(BTreeMap::new()),
        }
    }

    pub fn with_parent(parent: &'p P) -> Self {
        let session = Self::new();
        session.attach(parent);
        session
    }

    /// Attach to `parent` and prime the iterator cache with its current
    /// smallest and greatest keys. Cached values that this layer did not
    /// write are dropped: they may be stale with respect to the new parent.
    pub fn attach(&self, parent: &'p P) {
        trace!("attaching session layer");
        self.parent.set(Some(parent));
        self.prime_cache();
    }

    /// Clear the parent reference. Local state is kept.
    pub fn detach(&self) {
        self.parent.set(None);
    }

    pub fn is_attached(&self) -> bool {
        self.parent.get().is_some()
    }

    /// Discard the layer: detach, then clear all local state.
    pub fn undo(&self) {
        trace!("discarding session layer");
        self.detach();
        self.clear();
    }

    /// Write the layer through to the immediate parent and clear it.
    ///
    /// Detached sessions and sessions with nothing buffered are no-ops.
    /// All erases reach the parent before any write. On error the local
    /// state is left intact, so the layer can be retried or undone.
    pub fn commit(&self) -> anyhow::Result<()> {
        let Some(parent) = self.parent.get() else {
            return Ok(());
        };
        if self.updated.borrow().is_empty() && self.deleted.borrow().is_empty() {
            return Ok(());
        }

        debug!(
            updated = self.updated.borrow().len(),
            deleted = self.deleted.borrow().len(),
            "committing session layer"
        );

        let deleted: Vec<Bytes> = self.deleted.borrow().iter().cloned().collect();
        parent
            .erase_batch(deleted)
            .context("flush erases to parent")?;

        let updated: Vec<Bytes> = self.updated.borrow().iter().cloned().collect();
        self.cache
            .write_to(parent, updated)
            .context("flush writes to parent")?;

        self.clear();
        Ok(())
    }

    /// Empty all local structures. Does not touch the parent.
    pub fn clear(&self) {
        self.deleted.borrow_mut().clear();
        self.updated.borrow_mut().clear();
        self.cache.clear();
        self.iter_cache.borrow_mut().clear();
    }

    /// Current logical value for `key` at this layer.
    ///
    /// A parent hit is materialized into the local write cache (without
    /// marking the key updated), so repeated reads stay local.
    pub fn read(&self, key: impl AsRef<[u8]>) -> Option<Value> {
        let key = key.as_ref();
        if self.deleted.borrow().contains(key) {
            return None;
        }
        if let Some(value) = self.cache.read(key) {
            return Some(value);
        }

        let value = self.parent.get().and_then(|parent| parent.read(key));
        if let Some(value) = &value {
            let key = Bytes::copy_from_slice(key);
            self.cache.write(key.clone(), value.clone());
            self.update_iter_cache(
                key,
                CacheUpdate {
                    prime_only: false,
                    recalculate: true,
                    mark_deleted: false,
                    overwrite: false,
                },
            );
        }
        value
    }

    pub fn write(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> anyhow::Result<()> {
        let key = key.into();
        self.updated.borrow_mut().insert(key.clone());
        self.deleted.borrow_mut().remove(&key);
        self.cache.write(key.clone(), value.into());
        self.update_iter_cache(
            key,
            CacheUpdate {
                prime_only: false,
                recalculate: true,
                mark_deleted: false,
                overwrite: true,
            },
        );
        Ok(())
    }

    /// Tombstone `key` at this layer. The iterator-cache entry stays (with
    /// its `deleted` flag set) so traversal can keep using its neighbor
    /// hints while skipping the key itself.
    pub fn erase(&self, key: impl Into<Bytes>) -> anyhow::Result<()> {
        let key = key.into();
        self.deleted.borrow_mut().insert(key.clone());
        self.updated.borrow_mut().remove(&key);
        self.cache.erase(&key);
        self.update_iter_cache(
            key,
            CacheUpdate {
                prime_only: false,
                recalculate: true,
                mark_deleted: true,
                overwrite: true,
            },
        );
        Ok(())
    }

    pub fn contains(&self, key: impl AsRef<[u8]>) -> bool {
        let key = key.as_ref();
        if self.deleted.borrow().contains(key) {
            return false;
        }
        if self.cache.contains(key) {
            return true;
        }
        match self.parent.get() {
            Some(parent) if parent.contains(key) => {
                self.update_iter_cache(
                    Bytes::copy_from_slice(key),
                    CacheUpdate {
                        prime_only: false,
                        recalculate: true,
                        mark_deleted: false,
                        overwrite: false,
                    },
                );
                true
            }
            _ => false,
        }
    }

    /// Whether `key` is tombstoned at this layer or, failing a local
    /// verdict, anywhere up the chain. A key this layer wrote is never
    /// deleted, whatever the parent says.
    pub fn is_deleted(&self, key: impl AsRef<[u8]>) -> bool {
        let key = key.as_ref();
        if self.deleted.borrow().contains(key) {
            return true;
        }
        if self.updated.borrow().contains(key) {
            return false;
        }
        match self.parent.get() {
            Some(parent) => parent.is_deleted(key),
            None => false,
        }
    }

    /// Read a batch of keys, partitioned into found pairs and the set of
    /// keys with no logical value.
    pub fn read_batch<I, K>(&self, keys: I) -> (Vec<(Bytes, Value)>, HashSet<Bytes>)
    where
        I: IntoIterator<Item = K>,
        K: Into<Bytes>,
    {
        let mut found = Vec::new();
        let mut missing = HashSet::new();
        for key in keys {
            let key = key.into();
            match self.read(&key) {
                Some(value) => found.push((key, value)),
                None => {
                    missing.insert(key);
                }
            }
        }
        (found, missing)
    }

    pub fn write_batch<I, K, V>(&self, pairs: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Bytes>,
        V: Into<Bytes>,
    {
        for (key, value) in pairs {
            self.write(key, value)?;
        }
        Ok(())
    }

    pub fn erase_batch<I, K>(&self, keys: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = K>,
        K: Into<Bytes>,
    {
        for key in keys {
            self.erase(key)?;
        }
        Ok(())
    }

    /// Copy the logical values of the selected keys into another store.
    /// Keys absent from this layer's view are skipped.
    pub fn write_to<S, I, K>(&self, store: &S, keys: I) -> anyhow::Result<()>
    where
        S: KvStore,
        I: IntoIterator<Item = K>,
        K: Into<Bytes>,
    {
        let mut pairs = Vec::new();
        for key in keys {
            let key = key.into();
            if let Some(value) = self.read(&key) {
                pairs.push((key, value));
            }
        }
        store.write_batch(pairs)
    }

    /// Pull the selected entries of another store into this layer as
    /// ordinary writes.
    pub fn read_from<S, I, K>(&self, store: &S, keys: I) -> anyhow::Result<()>
    where
        S: KvStore,
        I: IntoIterator<Item = K>,
        K: Into<Bytes>,
    {
        for key in keys {
            let key = key.into();
            if let Some(value) = store.read(&key) {
                self.write(key, value)?;
            }
        }
        Ok(())
    }

    pub fn begin(&self) -> SessionIter<'_, 'p, P> {
        self.make_iter(SeekTo::First, false)
    }

    /// The end sentinel. Advancing it wraps to the first cache entry; see
    /// [`SessionIter`].
    pub fn end(&self) -> SessionIter<'_, 'p, P> {
        SessionIter::at_end(self)
    }

    /// Exact lookup. Yields the end sentinel when `key` is absent from the
    /// logical view or tombstoned at this layer.
    pub fn find(&self, key: impl AsRef<[u8]>) -> SessionIter<'_, 'p, P> {
        self.make_iter(SeekTo::Find(key.as_ref()), false)
    }

    /// First key `>= key` in the logical view.
    pub fn lower_bound(&self, key: impl AsRef<[u8]>) -> SessionIter<'_, 'p, P> {
        self.make_iter(SeekTo::LowerBound(key.as_ref()), false)
    }

    /// First key `> key` in the logical view.
    pub fn upper_bound(&self, key: impl AsRef<[u8]>) -> SessionIter<'_, 'p, P> {
        self.make_iter(SeekTo::UpperBound(key.as_ref()), false)
    }

    /// Number of keys written at this layer. Exposed for tests and
    /// introspection; the logical view is reached through reads and
    /// iteration.
    pub fn updated_len(&self) -> usize {
        self.updated.borrow().len()
    }

    pub fn deleted_len(&self) -> usize {
        self.deleted.borrow().len()
    }

    pub fn is_dirty(&self) -> bool {
        !self.updated.borrow().is_empty() || !self.deleted.borrow().is_empty()
    }

    pub(crate) fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Pick one current key from the two data sources (parent chain and
    /// local write cache), skipping keys tombstoned at this layer, then
    /// position an iterator on its cache entry.
    fn make_iter(&self, seek: SeekTo<'_>, prime_only: bool) -> SessionIter<'_, 'p, P> {
        let parent_key = match self.parent.get() {
            Some(parent) => {
                let initial = match seek {
                    SeekTo::First => parent.first_key(),
                    SeekTo::Find(key) => parent.find_key(key),
                    SeekTo::LowerBound(key) => parent.lower_bound_key(key),
                    SeekTo::UpperBound(key) => parent.upper_bound_key(key),
                };
                match seek {
                    // An exact probe that lands on a tombstoned key is a miss.
                    SeekTo::Find(_) => self.skip_deleted(initial, |_| None),
                    _ => self.skip_deleted(initial, |k| parent.upper_bound_key(k)),
                }
            }
            None => None,
        };

        let initial = match seek {
            SeekTo::First => self.cache.first_key(),
            SeekTo::Find(key) => self.cache.find_key(key),
            SeekTo::LowerBound(key) => self.cache.lower_bound_key(key),
            SeekTo::UpperBound(key) => self.cache.upper_bound_key(key),
        };
        let cache_key = match seek {
            SeekTo::Find(_) => self.skip_deleted(initial, |_| None),
            _ => self.skip_deleted(initial, |k| self.cache.upper_bound_key(k)),
        };

        let current = match seek {
            // `find` takes the parent's exact hit when it has one.
            SeekTo::Find(_) => parent_key.or(cache_key),
            _ => match (parent_key, cache_key) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, None) => a,
                (None, b) => b,
            },
        };

        let Some(current) = current else {
            return SessionIter::at_end(self);
        };

        self.update_iter_cache(
            current.clone(),
            CacheUpdate {
                prime_only,
                recalculate: true,
                mark_deleted: false,
                overwrite: false,
            },
        );

        if self
            .iter_state(&current)
            .map_or(false, |state| state.deleted)
        {
            return SessionIter::at_end(self);
        }
        SessionIter::at_key(self, current)
    }

    /// Walk `step` from `candidate` until a key that is not tombstoned at
    /// this layer comes up.
    fn skip_deleted<F>(&self, mut candidate: Option<Bytes>, step: F) -> Option<Bytes>
    where
        F: Fn(&[u8]) -> Option<Bytes>,
    {
        while let Some(key) = candidate {
            if !self.is_deleted(&key) {
                return Some(key);
            }
            candidate = step(&key);
        }
        None
    }

    /// The largest key `< key` and smallest key `> key` over the union of
    /// the parent's logical view and the local write cache, excluding keys
    /// tombstoned at this layer.
    ///
    /// Deliberately non-recursive with respect to this session's own
    /// iterator machinery: it queries the parent contract and the write
    /// cache directly, so it is safe to call from `update_iter_cache`.
    fn bounds(&self, key: &[u8]) -> (Option<Bytes>, Option<Bytes>) {
        let parent = self.parent.get();

        let parent_prev =
            parent.and_then(|p| self.skip_deleted(p.prev_key(key), |k| p.prev_key(k)));
        let cache_prev = self.skip_deleted(self.cache.prev_key(key), |k| self.cache.prev_key(k));
        let lower = std::cmp::max(parent_prev, cache_prev);

        let parent_next = parent
            .and_then(|p| self.skip_deleted(p.upper_bound_key(key), |k| p.upper_bound_key(k)));
        let cache_next = self.skip_deleted(self.cache.upper_bound_key(key), |k| {
            self.cache.upper_bound_key(k)
        });
        let upper = match (parent_next, cache_next) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, None) => a,
            (None, b) => b,
        };

        (lower, upper)
    }

    /// Insert or refresh the iterator-cache entry for `key` and, unless
    /// primed-only, make its neighbor hints true to the logical view:
    /// for every neighbor that exists the neighbor is inserted and the
    /// pairwise flags are set.
    fn update_iter_cache(&self, key: Bytes, params: CacheUpdate) {
        let recalculate = {
            let mut cache = self.iter_cache.borrow_mut();
            let state = cache.entry(key.clone()).or_default();
            if params.prime_only {
                return;
            }
            if params.overwrite {
                state.deleted = params.mark_deleted;
            }
            params.recalculate || !(state.next_in_cache && state.previous_in_cache)
        };
        if !recalculate {
            return;
        }

        // `bounds` walks the parent chain; the borrow above must not be
        // held across it.
        let (lower, upper) = self.bounds(&key);

        let mut cache = self.iter_cache.borrow_mut();
        if let Some(lower) = lower {
            cache.entry(lower).or_default().next_in_cache = true;
            cache.entry(key.clone()).or_default().previous_in_cache = true;
        }
        if let Some(upper) = upper {
            cache.entry(upper).or_default().previous_in_cache = true;
            cache.entry(key).or_default().next_in_cache = true;
        }
    }

    /// Force a neighbor recomputation for `key` without touching its
    /// `deleted` flag. The iterator uses this when a hint is unset.
    fn refresh_neighbors(&self, key: &[u8]) {
        self.update_iter_cache(
            Bytes::copy_from_slice(key),
            CacheUpdate {
                prime_only: false,
                recalculate: true,
                mark_deleted: false,
                overwrite: false,
            },
        );
    }

    fn iter_state(&self, key: &[u8]) -> Option<IterState> {
        self.iter_cache.borrow().get(key).copied()
    }

    fn iter_cache_first(&self) -> Option<(Bytes, IterState)> {
        self.iter_cache
            .borrow()
            .iter()
            .next()
            .map(|(k, s)| (k.clone(), *s))
    }

    fn iter_cache_last(&self) -> Option<(Bytes, IterState)> {
        self.iter_cache
            .borrow()
            .iter()
            .next_back()
            .map(|(k, s)| (k.clone(), *s))
    }

    fn iter_cache_next(&self, key: &[u8]) -> Option<(Bytes, IterState)> {
        self.iter_cache
            .borrow()
            .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(k, s)| (k.clone(), *s))
    }

    fn iter_cache_prev(&self, key: &[u8]) -> Option<(Bytes, IterState)> {
        self.iter_cache
            .borrow()
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
            .next_back()
            .map(|(k, s)| (k.clone(), *s))
    }

    /// Drop values this layer did not write (they may be stale under a new
    /// parent), then seed the iterator cache with the parent's smallest and
    /// greatest keys so traversal has anchors to expand from.
    fn prime_cache(&self) {
        self.iter_cache.borrow_mut().clear();

        let stale: Vec<Bytes> = {
            let updated = self.updated.borrow();
            self.cache
                .keys()
                .into_iter()
                .filter(|key| !updated.contains(key))
                .collect()
        };
        if !stale.is_empty() {
            self.cache.erase_batch(stale);
        }

        if let Some(parent) = self.parent.get() {
            if let Some(first) = parent.first_key() {
                self.update_iter_cache(
                    first,
                    CacheUpdate {
                        prime_only: true,
                        recalculate: false,
                        mark_deleted: false,
                        overwrite: false,
                    },
                );
            }
            if let Some(last) = parent.last_key() {
                self.update_iter_cache(
                    last,
                    CacheUpdate {
                        prime_only: true,
                        recalculate: false,
                        mark_deleted: false,
                        overwrite: false,
                    },
                );
            }
        }
    }
}

impl<P: KvStore> Default for Session<'_, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: KvStore> fmt::Debug for Session<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("attached", &self.is_attached())
            .field("updated", &self.updated.borrow().len())
            .field("deleted", &self.deleted.borrow().len())
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl<P: KvStore> Drop for Session<'_, P> {
    fn drop(&mut self) {
        if let Err(err) = self.commit() {
            error!("commit during session drop failed, discarding layer: {err:#}");
        }
        self.undo();
    }
}

impl<P: KvStore> KvStore for Session<'_, P> {
    fn read(&self, key: &[u8]) -> Option<Value> {
        Session::read(self, key)
    }

    fn write(&self, key: Bytes, value: Bytes) -> anyhow::Result<()> {
        Session::write(self, key, value)
    }

    fn erase(&self, key: &[u8]) -> anyhow::Result<()> {
        Session::erase(self, Bytes::copy_from_slice(key))
    }

    fn contains(&self, key: &[u8]) -> bool {
        Session::contains(self, key)
    }

    fn is_deleted(&self, key: &[u8]) -> bool {
        Session::is_deleted(self, key)
    }

    fn first_key(&self) -> Option<Bytes> {
        self.begin().key().cloned()
    }

    fn last_key(&self) -> Option<Bytes> {
        let mut iter = self.end();
        iter.retreat();
        iter.key().cloned()
    }

    fn find_key(&self, key: &[u8]) -> Option<Bytes> {
        self.find(key).key().cloned()
    }

    fn lower_bound_key(&self, key: &[u8]) -> Option<Bytes> {
        self.lower_bound(key).key().cloned()
    }

    fn upper_bound_key(&self, key: &[u8]) -> Option<Bytes> {
        self.upper_bound(key).key().cloned()
    }

    fn prev_key(&self, key: &[u8]) -> Option<Bytes> {
        self.bounds(key).0
    }
}
