//! `overlaydb` is a layered, chainable key-value session engine.
//!
//! A [`Session`] stacks on top of a parent store (another session or a
//! terminal [`MemStore`]) and buffers reads, writes, and deletions locally.
//! The whole layer can then be committed (written through to the immediate
//! parent) or rolled back, atomically with respect to the caller.
//!
//! This crate is intentionally opinionated about correctness first:
//! - Reads walk the chain root-ward and materialize parent values into the
//!   local write cache.
//! - Deletes are tombstones that mask the parent until commit.
//! - Ordered iteration exposes one sorted key view over the union of all
//!   layers minus the layer-local tombstones, driven by a lazily-populated
//!   iterator cache.
//! - Commit flushes erases strictly before writes, then clears the layer.
//!
//! The engine is single-threaded by design; see [`Session`] for the
//! ownership and reentrancy rules.

pub mod cache;
pub mod session;
pub mod store;

pub use cache::WriteCache;
pub use session::{IterState, Session, SessionIter};
pub use store::{KvStore, MemStore, Value};
