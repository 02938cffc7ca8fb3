//! Persistent symbol table.
//!
//! A symbol table is a durable bidirectional map between opaque byte-string
//! values and non-zero 40-bit integer IDs. Once a value is interned its ID
//! never changes for the table's lifetime, and once an ID is observed every
//! later reverse lookup returns the same value (explicit rebinding through
//! [`SymbolTable::set_symbol_id`] excepted).
//!
//! Persistence goes through the [`orbit_store::Kv`] collaborator; hot paths
//! are served from two in-memory caches over an append-only byte-pool arena.

mod issuer;
mod table;

pub use issuer::{Issuer, KvIssuer, MemIssuer, MIN_ISSUED_ID};
pub use table::{SymbolTable, TableOpts};

pub type SymbolResult<T> = Result<T, SymbolError>;

#[derive(Debug, thiserror::Error)]
pub enum SymbolError {
    #[error("store error: {0}")]
    Store(#[from] orbit_store::StoreError),
    #[error("40-bit symbol ID space exhausted")]
    IdSpaceExhausted,
}
