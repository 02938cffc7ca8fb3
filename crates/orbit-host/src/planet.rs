//! A planet: a content and governance enclosure owning one symbol table.

use std::sync::Arc;

use orbit_proto::{ErrCode, ReqErr, SymbolId, Uri, DEFAULT_APP_URI};
use orbit_store::DynKv;
use orbit_symbol::{SymbolTable, TableOpts};

use crate::error::HostResult;

pub struct Planet {
    planet_id: u64,
    symbols: SymbolTable,
    /// Interned ID of the `"."` default-app marker, resolved once at open.
    default_app_sym: SymbolId,
}

impl Planet {
    /// Open a planet over the shared KV collaborator. Planets partition the
    /// store by key prefix, derived from the planet ID.
    pub(crate) fn open(planet_id: u64, kv: DynKv) -> HostResult<Arc<Planet>> {
        let opts = TableOpts {
            db_key_prefix: (planet_id & 0xFF) as u8,
            ..TableOpts::default()
        };
        let symbols = SymbolTable::open(kv, opts);
        let default_app_sym = symbols.get_symbol_id(DEFAULT_APP_URI.as_bytes(), true)?;
        Ok(Arc::new(Planet {
            planet_id,
            symbols,
            default_app_sym,
        }))
    }

    pub fn planet_id(&self) -> u64 {
        self.planet_id
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn symbol_id(&self, value: &[u8], auto_issue: bool) -> HostResult<SymbolId> {
        Ok(self.symbols.get_symbol_id(value, auto_issue)?)
    }

    pub fn lookup_id(&self, id: SymbolId) -> HostResult<Option<Vec<u8>>> {
        Ok(self.symbols.lookup_id(id)?)
    }

    pub(crate) fn default_app_sym(&self) -> SymbolId {
        self.default_app_sym
    }

    /// Resolve either form of a URI field to its text.
    pub fn uri_text(&self, uri: &Uri) -> Result<String, ReqErr> {
        match uri {
            Uri::Text(text) => Ok(text.clone()),
            Uri::Sym(sym) => {
                let bytes = self
                    .symbols
                    .lookup_id(*sym)
                    .map_err(|err| ErrCode::DataFailure.err(err.to_string()))?
                    .ok_or_else(|| ErrCode::InvalidUri.err(format!("unknown symbol {sym}")))?;
                String::from_utf8(bytes)
                    .map_err(|_| ErrCode::InvalidUri.err(format!("symbol {sym} is not UTF-8")))
            }
        }
    }
}
