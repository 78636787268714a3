//! The store contract shared by every layer of a session chain.
//!
//! Both the terminal [`MemStore`] and [`Session`](crate::session::Session)
//! implement [`KvStore`], so a session can stack on either. The contract is
//! deliberately cursor-free: ordered traversal across layers only ever needs
//! one neighbor key at a time, so the positioning methods hand back owned
//! keys of the store's *logical* view instead of borrowing iterators. Each
//! layer answers from its own view (parent view plus local writes minus
//! local tombstones), which is what makes the methods compose down a chain.

use bytes::Bytes;

mod mem;

pub use mem::MemStore;

pub type Value = bytes::Bytes;

pub trait KvStore {
    /// Current logical value for `key`, or `None` if absent.
    fn read(&self, key: &[u8]) -> Option<Value>;

    fn write(&self, key: Bytes, value: Bytes) -> anyhow::Result<()>;

    fn erase(&self, key: &[u8]) -> anyhow::Result<()>;

    fn contains(&self, key: &[u8]) -> bool;

    /// Whether `key` is tombstoned at this layer or any layer above the one
    /// that stores it. Terminal stores have no tombstones.
    fn is_deleted(&self, _key: &[u8]) -> bool {
        false
    }

    /// Smallest key of the logical view.
    fn first_key(&self) -> Option<Bytes>;

    /// Greatest key of the logical view.
    fn last_key(&self) -> Option<Bytes>;

    /// The key itself, if present in the logical view.
    fn find_key(&self, key: &[u8]) -> Option<Bytes>;

    /// First key `>= key`.
    fn lower_bound_key(&self, key: &[u8]) -> Option<Bytes>;

    /// First key `> key`.
    fn upper_bound_key(&self, key: &[u8]) -> Option<Bytes>;

    /// Last key `< key`.
    fn prev_key(&self, key: &[u8]) -> Option<Bytes>;

    /// Pointwise batch write. Implementations may override to batch under a
    /// single lock acquisition.
    fn write_batch<I>(&self, pairs: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = (Bytes, Bytes)>,
        Self: Sized,
    {
        for (key, value) in pairs {
            self.write(key, value)?;
        }
        Ok(())
    }

    /// Pointwise batch erase.
    fn erase_batch<I>(&self, keys: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = Bytes>,
        Self: Sized,
    {
        for key in keys {
            self.erase(&key)?;
        }
        Ok(())
    }
}
