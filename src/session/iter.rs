use std::fmt;

use bytes::Bytes;

use crate::session::Session;
use crate::store::{KvStore, Value};

/// Bidirectional, key-ordered, deletion-skipping iterator over a session's
/// logical view.
///
/// The iterator is **cyclic**: advancing past the last key wraps to the
/// front of the iterator cache (`end().advance()` lands on the first
/// entry), and retreating from the front wraps in from the back. A sweep
/// must therefore terminate by comparing against a captured position,
/// never by waiting for the iterator to stop moving. This also means the
/// entry a rollover lands on can be a tombstoned one; its [`entry`]
/// read-through then yields `None` for the value.
///
/// Positions are held as owned keys into the session's iterator cache, so
/// the cache is free to grow underneath a live iterator (dereferencing and
/// stepping both go through the session).
///
/// [`entry`]: SessionIter::entry
pub struct SessionIter<'a, 'p, P: KvStore> {
    session: &'a Session<'p, P>,
    /// Current iterator-cache key; `None` is the end sentinel.
    key: Option<Bytes>,
}

impl<'a, 'p, P: KvStore> SessionIter<'a, 'p, P> {
    pub(super) fn at_key(session: &'a Session<'p, P>, key: Bytes) -> Self {
        Self {
            session,
            key: Some(key),
        }
    }

    pub(super) fn at_end(session: &'a Session<'p, P>) -> Self {
        Self { session, key: None }
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    pub fn is_end(&self) -> bool {
        self.key.is_none()
    }

    /// Whether the current entry is tombstoned at this layer. False at the
    /// end sentinel.
    pub fn deleted(&self) -> bool {
        match &self.key {
            None => false,
            Some(key) => self
                .session
                .iter_state(key)
                .map_or(false, |state| state.deleted),
        }
    }

    /// The current key and its logical value, read through the session so
    /// the value always reflects the layer's current state. `None` at the
    /// end sentinel.
    pub fn entry(&self) -> Option<(Bytes, Option<Value>)> {
        self.key
            .as_ref()
            .map(|key| (key.clone(), self.session.read(key)))
    }

    pub fn value(&self) -> Option<Value> {
        self.key.as_ref().and_then(|key| self.session.read(key))
    }

    /// Step to the next non-tombstoned key in order.
    ///
    /// Before each step the current entry's `next_in_cache` hint is
    /// checked; an unset hint forces a neighbor recomputation to pull the
    /// successor into the cache. If no successor materializes the iterator
    /// reaches the end and then rolls over to the front of the cache.
    pub fn advance(&mut self) {
        let Some(mut current) = self.key.take() else {
            // end + 1 == begin
            self.key = self.session.iter_cache_first().map(|(key, _)| key);
            return;
        };

        loop {
            let hinted = self
                .session
                .iter_state(&current)
                .map_or(false, |state| state.next_in_cache);
            if !hinted {
                self.session.refresh_neighbors(&current);
                let confirmed = self
                    .session
                    .iter_state(&current)
                    .map_or(false, |state| state.next_in_cache);
                if !confirmed {
                    break;
                }
            }
            match self.session.iter_cache_next(&current) {
                Some((key, state)) => {
                    if !state.deleted {
                        self.key = Some(key);
                        break;
                    }
                    // Tombstoned entry: keep walking, using its hints.
                    current = key;
                }
                None => break,
            }
        }

        if self.key.is_none() {
            // Rollover.
            self.key = self.session.iter_cache_first().map(|(key, _)| key);
        }
    }

    /// Step to the previous non-tombstoned key in order.
    ///
    /// Symmetric to [`advance`](SessionIter::advance), with the rollover
    /// applied first: retreating from the front of the cache wraps in from
    /// the back, and retreating from the end sentinel lands on the last
    /// key.
    pub fn retreat(&mut self) {
        if let Some(current) = &self.key {
            let at_front = self
                .session
                .iter_cache_first()
                .map_or(false, |(first, _)| first == *current);
            if at_front {
                self.key = self.session.iter_cache_last().map(|(key, _)| key);
            }
        }

        loop {
            let hinted = match &self.key {
                // The end sentinel always admits a backward step.
                None => true,
                Some(key) => self
                    .session
                    .iter_state(key)
                    .map_or(false, |state| state.previous_in_cache),
            };
            if !hinted {
                if let Some(key) = self.key.clone() {
                    self.session.refresh_neighbors(&key);
                }
                let confirmed = match &self.key {
                    None => true,
                    Some(key) => self
                        .session
                        .iter_state(key)
                        .map_or(false, |state| state.previous_in_cache),
                };
                if !confirmed {
                    self.key = None;
                    return;
                }
            }
            let stepped = match &self.key {
                None => self.session.iter_cache_last(),
                Some(key) => self.session.iter_cache_prev(key),
            };
            match stepped {
                Some((key, state)) => {
                    let done = !state.deleted;
                    self.key = Some(key);
                    if done {
                        return;
                    }
                }
                None => {
                    self.key = None;
                    return;
                }
            }
        }
    }
}

impl<P: KvStore> Clone for SessionIter<'_, '_, P> {
    fn clone(&self) -> Self {
        Self {
            session: self.session,
            key: self.key.clone(),
        }
    }
}

/// Two iterators are equal iff both are at the end or both point at the
/// same key. The owning session is not part of the comparison.
impl<P: KvStore> PartialEq for SessionIter<'_, '_, P> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<P: KvStore> Eq for SessionIter<'_, '_, P> {}

impl<P: KvStore> fmt::Debug for SessionIter<'_, '_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionIter")
            .field("key", &self.key)
            .finish()
    }
}
