//! Monotonic symbol ID issuance.

use std::sync::atomic::{AtomicU64, Ordering};

use orbit_proto::SymbolId;
use orbit_store::{DynKv, StoreError};

use crate::{SymbolError, SymbolResult};

/// Auto-issued IDs start here; the low range is left to explicit binds.
pub const MIN_ISSUED_ID: u64 = 1000;

/// Issues fresh symbol IDs, monotonically and durably for the KV-backed
/// implementation.
pub trait Issuer: Send + Sync {
    fn issue_next(&self) -> SymbolResult<SymbolId>;
}

/// Process-local issuer for tables without a backing store.
#[derive(Debug)]
pub struct MemIssuer {
    next: AtomicU64,
}

impl MemIssuer {
    pub fn new() -> MemIssuer {
        MemIssuer {
            next: AtomicU64::new(MIN_ISSUED_ID),
        }
    }
}

impl Default for MemIssuer {
    fn default() -> Self {
        Self::new()
    }
}

impl Issuer for MemIssuer {
    fn issue_next(&self) -> SymbolResult<SymbolId> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        if id > SymbolId::MAX {
            return Err(SymbolError::IdSpaceExhausted);
        }
        Ok(SymbolId(id))
    }
}

/// Issuer persisting the next-ID counter in the KV collaborator, under the
/// table's prefix at `[prefix][0xFF][0xFF]`. Each successful issue advances
/// the stored counter by exactly one.
pub struct KvIssuer {
    kv: DynKv,
    counter_key: [u8; 3],
}

impl KvIssuer {
    pub fn new(kv: DynKv, db_key_prefix: u8) -> KvIssuer {
        KvIssuer {
            kv,
            counter_key: [db_key_prefix, 0xFF, 0xFF],
        }
    }
}

impl Issuer for KvIssuer {
    fn issue_next(&self) -> SymbolResult<SymbolId> {
        loop {
            let mut txn = self.kv.begin(true);
            let next = match txn.get(&self.counter_key)? {
                Some(buf) => decode_counter(&buf),
                None => MIN_ISSUED_ID,
            };
            if next > SymbolId::MAX {
                return Err(SymbolError::IdSpaceExhausted);
            }
            txn.set(&self.counter_key, &(next + 1).to_be_bytes())?;
            match txn.commit() {
                Ok(()) => return Ok(SymbolId(next)),
                Err(StoreError::Conflict) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn decode_counter(buf: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    let n = buf.len().min(8);
    bytes[8 - n..].copy_from_slice(&buf[buf.len() - n..]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_store::MemKv;
    use std::sync::Arc;

    #[test]
    fn mem_issuer_is_monotonic() {
        let issuer = MemIssuer::new();
        let a = issuer.issue_next().unwrap();
        let b = issuer.issue_next().unwrap();
        assert_eq!(a.0, MIN_ISSUED_ID);
        assert_eq!(b.0, MIN_ISSUED_ID + 1);
    }

    #[test]
    fn kv_issuer_persists_counter() {
        let kv = MemKv::new();
        let issuer = KvIssuer::new(Arc::new(kv.clone()), 0x07);
        let a = issuer.issue_next().unwrap();
        let b = issuer.issue_next().unwrap();
        assert_eq!(a.0 + 1, b.0);

        let stored = kv.peek(&[0x07, 0xFF, 0xFF]).unwrap();
        assert_eq!(decode_counter(&stored), b.0 + 1);
    }

    #[test]
    fn fresh_issuer_resumes_from_stored_counter() {
        let kv = MemKv::new();
        {
            let issuer = KvIssuer::new(Arc::new(kv.clone()), 0x07);
            issuer.issue_next().unwrap();
            issuer.issue_next().unwrap();
        }
        let issuer = KvIssuer::new(Arc::new(kv.clone()), 0x07);
        assert_eq!(issuer.issue_next().unwrap().0, MIN_ISSUED_ID + 2);
    }
}
