//! Transactional key-value collaborator interface plus the in-memory backend.
//!
//! The host treats the KV store as an external collaborator; the only
//! requirements are `get`/`set`/`delete` inside a transaction and `commit`
//! with optimistic-conflict detection. Callers restart from a fresh
//! transaction on [`StoreError::Conflict`].

mod mem;

pub use mem::MemKv;

use std::sync::Arc;

pub type StoreResult<T> = Result<T, StoreError>;
pub type DynKv = Arc<dyn Kv>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("optimistic transaction conflict")]
    Conflict,
    #[error("write in a read-only transaction")]
    ReadOnly,
    #[error("backend error: {0}")]
    Backend(String),
}

/// A transactional key-value store.
pub trait Kv: Send + Sync {
    /// Open a transaction. Read-only transactions reject writes with
    /// [`StoreError::ReadOnly`].
    fn begin(&self, write: bool) -> Box<dyn KvTxn + '_>;
}

/// One open transaction. Reads observe the transaction's own writes.
pub trait KvTxn {
    fn get(&mut self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;
    fn set(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()>;
    fn delete(&mut self, key: &[u8]) -> StoreResult<()>;

    /// Apply the write set. Fails with [`StoreError::Conflict`] when another
    /// transaction committed a key this one has read since it began.
    fn commit(self: Box<Self>) -> StoreResult<()>;
}
