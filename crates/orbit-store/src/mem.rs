//! In-memory KV backend with per-key version stamps.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::{Kv, KvTxn, StoreError, StoreResult};

#[derive(Debug, Clone)]
struct Slot {
    value: Option<Vec<u8>>,
    /// Commit clock value of the last write to this key.
    version: u64,
}

#[derive(Debug, Default)]
struct Shared {
    map: BTreeMap<Vec<u8>, Slot>,
    clock: u64,
}

impl Shared {
    fn version_of(&self, key: &[u8]) -> u64 {
        self.map.get(key).map(|s| s.version).unwrap_or(0)
    }
}

/// In-memory transactional store. Cloning shares the underlying map, so a
/// host and its planets can hand the same backend around cheaply.
#[derive(Clone, Default)]
pub struct MemKv {
    shared: Arc<RwLock<Shared>>,
}

impl std::fmt::Debug for MemKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.read().unwrap();
        f.debug_struct("MemKv")
            .field("keys", &shared.map.len())
            .field("clock", &shared.clock)
            .finish()
    }
}

impl MemKv {
    pub fn new() -> MemKv {
        MemKv::default()
    }

    /// Snapshot a value outside any transaction (test convenience).
    pub fn peek(&self, key: &[u8]) -> Option<Vec<u8>> {
        let shared = self.shared.read().unwrap();
        shared.map.get(key).and_then(|s| s.value.clone())
    }
}

impl Kv for MemKv {
    fn begin(&self, write: bool) -> Box<dyn KvTxn + '_> {
        Box::new(MemTxn {
            kv: self,
            write,
            reads: HashMap::new(),
            writes: BTreeMap::new(),
        })
    }
}

pub struct MemTxn<'a> {
    kv: &'a MemKv,
    write: bool,
    /// Key -> version observed at first read (0 for absent keys).
    reads: HashMap<Vec<u8>, u64>,
    /// Key -> pending value (`None` = delete).
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl KvTxn for MemTxn<'_> {
    fn get(&mut self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        if let Some(pending) = self.writes.get(key) {
            return Ok(pending.clone());
        }
        let shared = self.kv.shared.read().unwrap();
        self.reads
            .entry(key.to_vec())
            .or_insert_with(|| shared.version_of(key));
        Ok(shared.map.get(key).and_then(|s| s.value.clone()))
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        if !self.write {
            return Err(StoreError::ReadOnly);
        }
        self.writes.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> StoreResult<()> {
        if !self.write {
            return Err(StoreError::ReadOnly);
        }
        self.writes.insert(key.to_vec(), None);
        Ok(())
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        if self.writes.is_empty() {
            return Ok(());
        }
        let mut shared = self.kv.shared.write().unwrap();
        for (key, observed) in &self.reads {
            if shared.version_of(key) != *observed {
                return Err(StoreError::Conflict);
            }
        }
        shared.clock += 1;
        let clock = shared.clock;
        for (key, value) in self.writes {
            shared.map.insert(
                key,
                Slot {
                    value,
                    version: clock,
                },
            );
        }
        Ok(())
    }
}
