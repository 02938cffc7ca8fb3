//! The symbol table proper: KV-backed persistence with two-direction caching.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use orbit_proto::SymbolId;
use orbit_store::{DynKv, StoreError};
use xxhash_rust::xxh3::xxh3_64;

use crate::{Issuer, KvIssuer, MemIssuer, SymbolResult};

/// Key-space discriminator for forward (value -> ID) entries.
const FORWARD_INDEX: u8 = 0xFE;
/// Key-space discriminator under the table prefix.
const ID_INDEX: u8 = 0xFF;

#[derive(Debug, Clone, Copy)]
pub struct TableOpts {
    /// Distinguishes this table's key space in a KV store shared across
    /// planets.
    pub db_key_prefix: u8,
    /// Minimum byte-pool allocation for the cache arena.
    pub pool_sz: u32,
    /// Initial capacity hint for the caches.
    pub working_size_hint: usize,
}

impl Default for TableOpts {
    fn default() -> Self {
        Self {
            db_key_prefix: 0,
            pool_sz: 16 * 1024,
            working_size_hint: 600,
        }
    }
}

/// A cache entry references interned bytes held in the pool arena, so the
/// maps stay flat and the copies stay stable for the table's lifetime.
#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    id: SymbolId,
    pool_idx: u32,
    pool_ofs: u32,
    len: u32,
}

#[derive(Default)]
struct ValueCache {
    /// Keyed by the value's xxh3 hash; collisions probe linearly by
    /// incrementing the key.
    map: HashMap<u64, CacheEntry>,
    /// Append-only arena; pools are never freed while the table lives.
    pools: Vec<Box<[u8]>>,
    cur_pool_used: u32,
}

impl ValueCache {
    fn entry_bytes(&self, e: &CacheEntry) -> &[u8] {
        let start = e.pool_ofs as usize;
        &self.pools[e.pool_idx as usize][start..start + e.len as usize]
    }

    fn matches(&self, e: &CacheEntry, value: &[u8]) -> bool {
        e.len as usize == value.len() && self.entry_bytes(e) == value
    }

    /// Probe for `value`, returning the slot key and the occupying entry.
    /// A tombstoned entry (ID zero) still matches its bytes; callers treat
    /// it as a miss but may rebind the slot in place.
    fn probe(&self, value: &[u8]) -> (u64, Option<CacheEntry>) {
        let mut slot = xxh3_64(value);
        loop {
            match self.map.get(&slot) {
                Some(e) if self.matches(e, value) => return (slot, Some(*e)),
                Some(_) => slot = slot.wrapping_add(1),
                None => return (slot, None),
            }
        }
    }

    /// Copy `value` into the arena, growing it by a fresh pool when the
    /// current one lacks space.
    fn alloc(&mut self, value: &[u8], pool_sz: u32) -> (u32, u32) {
        let len = value.len() as u32;
        let need_fresh = match self.pools.last() {
            Some(pool) => (self.cur_pool_used + len) as usize > pool.len(),
            None => true,
        };
        if need_fresh {
            let alloc = pool_sz.max(len) as usize;
            self.pools.push(vec![0u8; alloc].into_boxed_slice());
            self.cur_pool_used = 0;
        }
        let pool_idx = self.pools.len() - 1;
        let pool_ofs = self.cur_pool_used;
        let start = pool_ofs as usize;
        self.pools[pool_idx][start..start + value.len()].copy_from_slice(value);
        self.cur_pool_used += len;
        (pool_idx as u32, pool_ofs)
    }
}

/// Durable bidirectional map between byte-string values and 40-bit IDs.
///
/// Thread-safe; lookups take read locks and fall through to the KV store on
/// a miss, insertions take the value-cache write lock and then the
/// token-cache write lock.
pub struct SymbolTable {
    opts: TableOpts,
    kv: Option<DynKv>,
    issuer: Arc<dyn Issuer>,
    value_cache: RwLock<ValueCache>,
    token_cache: RwLock<HashMap<SymbolId, CacheEntry>>,
}

impl SymbolTable {
    /// Open a table over a KV collaborator with a durable ID issuer.
    pub fn open(kv: DynKv, opts: TableOpts) -> SymbolTable {
        let issuer = Arc::new(KvIssuer::new(kv.clone(), opts.db_key_prefix));
        Self::with_issuer(Some(kv), issuer, opts)
    }

    /// Open a storeless table; IDs come from a process-local issuer and
    /// nothing persists.
    pub fn storeless(opts: TableOpts) -> SymbolTable {
        Self::with_issuer(None, Arc::new(MemIssuer::new()), opts)
    }

    pub fn with_issuer(
        kv: Option<DynKv>,
        issuer: Arc<dyn Issuer>,
        opts: TableOpts,
    ) -> SymbolTable {
        SymbolTable {
            kv,
            issuer,
            value_cache: RwLock::new(ValueCache::default()),
            token_cache: RwLock::new(HashMap::with_capacity(opts.working_size_hint)),
            opts,
        }
    }

    pub fn issuer(&self) -> &Arc<dyn Issuer> {
        &self.issuer
    }

    /// Returns the ID bound to `value`. With `auto_issue`, a missing binding
    /// is created from a freshly issued ID; without it, zero reports a miss.
    pub fn get_symbol_id(&self, value: &[u8], auto_issue: bool) -> SymbolResult<SymbolId> {
        let cached = self.cached_id(value);
        if !cached.is_none() {
            return Ok(cached);
        }
        self.getset_value_id_pair(value, SymbolId::NONE, auto_issue)
    }

    /// Explicitly bind `value` to `sym_id`, overwriting the forward map and
    /// moving the reverse entry. A zero `sym_id` degenerates to
    /// `get_symbol_id(value, true)`.
    pub fn set_symbol_id(&self, value: &[u8], sym_id: SymbolId) -> SymbolResult<SymbolId> {
        self.getset_value_id_pair(value, sym_id, sym_id.is_none())
    }

    /// Reverse lookup. Zero always yields `None`.
    pub fn lookup_id(&self, id: SymbolId) -> SymbolResult<Option<Vec<u8>>> {
        if id.is_none() {
            return Ok(None);
        }
        let cached = {
            let tc = self.token_cache.read().unwrap();
            tc.get(&id).copied()
        };
        if let Some(entry) = cached {
            let vc = self.value_cache.read().unwrap();
            return Ok(Some(vc.entry_bytes(&entry).to_vec()));
        }
        let Some(kv) = &self.kv else {
            return Ok(None);
        };
        let mut txn = kv.begin(false);
        match txn.get(&self.reverse_key(id))? {
            Some(value) => {
                self.bind_in_cache(&value, id);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn forward_key(&self, value: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(3 + value.len());
        key.extend_from_slice(&[self.opts.db_key_prefix, ID_INDEX, FORWARD_INDEX]);
        key.extend_from_slice(value);
        key
    }

    fn reverse_key(&self, id: SymbolId) -> Vec<u8> {
        let mut key = Vec::with_capacity(2 + SymbolId::WIRE_LEN);
        key.extend_from_slice(&[self.opts.db_key_prefix, ID_INDEX]);
        id.write_to(&mut key);
        key
    }

    fn cached_id(&self, value: &[u8]) -> SymbolId {
        let vc = self.value_cache.read().unwrap();
        match vc.probe(value).1 {
            Some(entry) => entry.id,
            None => SymbolId::NONE,
        }
    }

    /// Load/store the (value, ID) pair per the reassignment table, retrying
    /// the transaction from scratch on optimistic conflict, then refresh the
    /// caches.
    fn getset_value_id_pair(
        &self,
        value: &[u8],
        sym_id: SymbolId,
        map_id: bool,
    ) -> SymbolResult<SymbolId> {
        let effective = match &self.kv {
            None => {
                if sym_id.is_none() {
                    if map_id {
                        self.issuer.issue_next()?
                    } else {
                        SymbolId::NONE
                    }
                } else {
                    sym_id
                }
            }
            Some(kv) => {
                let forward_key = self.forward_key(value);
                loop {
                    let mut txn = kv.begin(true);

                    let mut existing = SymbolId::NONE;
                    if sym_id.is_none() || !map_id {
                        if let Some(buf) = txn.get(&forward_key)? {
                            existing = SymbolId::read_from(&buf).unwrap_or(SymbolId::NONE);
                        }
                    }

                    let mut eff = sym_id;
                    let mut write_forward = false;
                    let mut write_reverse = false;
                    if sym_id.is_none() {
                        if !existing.is_none() {
                            eff = existing;
                        } else if map_id {
                            eff = self.issuer.issue_next()?;
                            write_forward = true;
                            write_reverse = true;
                        }
                    } else if existing.is_none() {
                        write_forward = true;
                        write_reverse = true;
                    } else if sym_id != existing {
                        write_forward = true;
                        if map_id {
                            eff = existing;
                            write_reverse = true;
                        }
                    }

                    if !(write_forward || write_reverse) {
                        break eff;
                    }

                    // Rebinding an ID moves it: the displaced value's forward
                    // entry is dropped so it stops resolving to this ID.
                    let mut displaced: Option<Vec<u8>> = None;
                    if write_reverse {
                        let reverse_key = self.reverse_key(eff);
                        if let Some(old) = txn.get(&reverse_key)? {
                            if old != value {
                                let old_forward = self.forward_key(&old);
                                if let Some(buf) = txn.get(&old_forward)? {
                                    if SymbolId::read_from(&buf) == Some(eff) {
                                        txn.delete(&old_forward)?;
                                        displaced = Some(old);
                                    }
                                }
                            }
                        }
                        txn.set(&reverse_key, value)?;
                    }
                    if write_forward {
                        txn.set(&forward_key, &eff.to_wire())?;
                    }

                    match txn.commit() {
                        Ok(()) => {
                            if let Some(old) = displaced {
                                self.evict_value(&old);
                            }
                            break eff;
                        }
                        Err(StoreError::Conflict) => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        };

        if !effective.is_none() {
            self.bind_in_cache(value, effective);
        }
        Ok(effective)
    }

    /// Place `value` at its probed slot (copying it into the arena if new)
    /// and mirror the entry into the token cache. Lock order: value cache
    /// first, then token cache.
    fn bind_in_cache(&self, value: &[u8], id: SymbolId) -> CacheEntry {
        let mut vc = self.value_cache.write().unwrap();
        let (slot, found) = vc.probe(value);
        let entry = match found {
            Some(entry) if entry.id == id => return entry,
            Some(mut entry) => {
                // Same bytes, new ID: rebind in place, reusing the pool copy.
                entry.id = id;
                vc.map.insert(slot, entry);
                entry
            }
            None => {
                let (pool_idx, pool_ofs) = vc.alloc(value, self.opts.pool_sz);
                let entry = CacheEntry {
                    id,
                    pool_idx,
                    pool_ofs,
                    len: value.len() as u32,
                };
                vc.map.insert(slot, entry);
                entry
            }
        };
        let mut tc = self.token_cache.write().unwrap();
        tc.insert(id, entry);
        entry
    }

    /// Tombstone the cache slot for `value`. The bytes stay in place so
    /// open-addressing probe chains remain intact; a tombstoned slot reports
    /// a miss and falls through to the KV store.
    fn evict_value(&self, value: &[u8]) {
        let mut vc = self.value_cache.write().unwrap();
        let (slot, found) = vc.probe(value);
        if let Some(mut entry) = found {
            entry.id = SymbolId::NONE;
            vc.map.insert(slot, entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_store::MemKv;
    use std::sync::Arc;
    use std::thread;

    fn mem_table(prefix: u8) -> (MemKv, SymbolTable) {
        let kv = MemKv::new();
        let table = SymbolTable::open(
            Arc::new(kv.clone()),
            TableOpts {
                db_key_prefix: prefix,
                ..TableOpts::default()
            },
        );
        (kv, table)
    }

    #[test]
    fn interning_is_idempotent() {
        let (kv, table) = mem_table(1);
        let a = table.get_symbol_id(b"planet/home", true).unwrap();
        let counter = kv.peek(&[1, 0xFF, 0xFF]);
        let b = table.get_symbol_id(b"planet/home", true).unwrap();
        assert!(!a.is_none());
        assert_eq!(a, b);
        // The repeat call left storage untouched.
        assert_eq!(kv.peek(&[1, 0xFF, 0xFF]), counter);
    }

    #[test]
    fn reverse_lookup_returns_interned_value() {
        let (_kv, table) = mem_table(1);
        let id = table.get_symbol_id(b"v1/name", true).unwrap();
        assert_eq!(table.lookup_id(id).unwrap().as_deref(), Some(&b"v1/name"[..]));
        assert_eq!(table.lookup_id(SymbolId::NONE).unwrap(), None);
    }

    #[test]
    fn missing_value_without_auto_issue_reports_zero() {
        let (_kv, table) = mem_table(1);
        assert!(table.get_symbol_id(b"absent", false).unwrap().is_none());
    }

    #[test]
    fn bindings_survive_reopen() {
        let kv = MemKv::new();
        let opts = TableOpts {
            db_key_prefix: 9,
            ..TableOpts::default()
        };
        let id = {
            let table = SymbolTable::open(Arc::new(kv.clone()), opts);
            table.get_symbol_id(b"durable", true).unwrap()
        };
        let table = SymbolTable::open(Arc::new(kv), opts);
        assert_eq!(table.get_symbol_id(b"durable", false).unwrap(), id);
        assert_eq!(
            table.lookup_id(id).unwrap().as_deref(),
            Some(&b"durable"[..])
        );
    }

    #[test]
    fn explicit_rebinding_moves_the_id() {
        let (_kv, table) = mem_table(1);
        let id = SymbolId(7);
        assert_eq!(table.set_symbol_id(b"alpha", id).unwrap(), id);
        assert_eq!(table.set_symbol_id(b"beta", id).unwrap(), id);

        assert_eq!(table.lookup_id(id).unwrap().as_deref(), Some(&b"beta"[..]));
        assert!(table.get_symbol_id(b"alpha", false).unwrap().is_none());
        assert_eq!(table.get_symbol_id(b"beta", false).unwrap(), id);
    }

    #[test]
    fn set_with_zero_id_degenerates_to_auto_issue() {
        let (_kv, table) = mem_table(1);
        let id = table.set_symbol_id(b"gamma", SymbolId::NONE).unwrap();
        assert!(!id.is_none());
        assert_eq!(table.get_symbol_id(b"gamma", false).unwrap(), id);
    }

    #[test]
    fn tiny_pools_grow_without_disturbing_entries() {
        let kv = MemKv::new();
        let table = SymbolTable::open(
            Arc::new(kv),
            TableOpts {
                db_key_prefix: 1,
                pool_sz: 8,
                ..TableOpts::default()
            },
        );
        let values: Vec<Vec<u8>> = (0..64)
            .map(|i| format!("value/{i:04}").into_bytes())
            .collect();
        let ids: Vec<SymbolId> = values
            .iter()
            .map(|v| table.get_symbol_id(v, true).unwrap())
            .collect();
        for (value, id) in values.iter().zip(&ids) {
            assert_eq!(table.lookup_id(*id).unwrap().as_deref(), Some(&value[..]));
        }
    }

    #[test]
    fn storeless_table_issues_and_caches() {
        let table = SymbolTable::storeless(TableOpts::default());
        let id = table.get_symbol_id(b"ephemeral", true).unwrap();
        assert!(!id.is_none());
        assert_eq!(table.get_symbol_id(b"ephemeral", false).unwrap(), id);
        assert_eq!(
            table.lookup_id(id).unwrap().as_deref(),
            Some(&b"ephemeral"[..])
        );
    }

    #[test]
    fn concurrent_interning_issues_distinct_ids_and_counts_exactly() {
        const TASKS: usize = 8;
        const PER_TASK: usize = 125;

        let kv = MemKv::new();
        let table = Arc::new(SymbolTable::open(
            Arc::new(kv.clone()),
            TableOpts {
                db_key_prefix: 3,
                ..TableOpts::default()
            },
        ));

        let before = kv
            .peek(&[3, 0xFF, 0xFF])
            .map(|buf| {
                let mut b = [0u8; 8];
                b.copy_from_slice(&buf);
                u64::from_be_bytes(b)
            })
            .unwrap_or(crate::MIN_ISSUED_ID);

        let mut handles = Vec::new();
        for task in 0..TASKS {
            let table = table.clone();
            handles.push(thread::spawn(move || {
                let mut out = Vec::with_capacity(PER_TASK);
                for i in 0..PER_TASK {
                    let value = format!("concurrent/{task}/{i}").into_bytes();
                    let id = table.get_symbol_id(&value, true).unwrap();
                    out.push((value, id));
                }
                out
            }));
        }

        let mut seen = std::collections::HashMap::new();
        for handle in handles {
            for (value, id) in handle.join().unwrap() {
                assert!(!id.is_none());
                assert!(seen.insert(id, value).is_none(), "duplicate ID issued");
            }
        }
        assert_eq!(seen.len(), TASKS * PER_TASK);

        for (id, value) in &seen {
            assert_eq!(table.lookup_id(*id).unwrap().as_deref(), Some(&value[..]));
        }

        let after_buf = kv.peek(&[3, 0xFF, 0xFF]).unwrap();
        let mut b = [0u8; 8];
        b.copy_from_slice(&after_buf);
        let after = u64::from_be_bytes(b);
        assert_eq!(after - before, (TASKS * PER_TASK) as u64);
    }
}
