//! The per-session type registry.
//!
//! Clients declare symbols and attribute schemas with `ResolveAndRegister`;
//! the registry interns every URI into the session planet's symbol table,
//! flattens schema inheritance, and stores the result under the
//! client-chosen 32-bit schema ID.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use orbit_proto::{AttrSchema, AttrSpec, Defs, ErrCode, ReqErr, SymbolId, Uri};

use crate::planet::Planet;

#[derive(Default)]
struct Inner {
    /// Resolved, flattened schemas by session-scoped schema ID.
    schemas: HashMap<u32, Arc<AttrSchema>>,
    /// Resolved schemas by schema-name symbol, for inheritance lookups.
    by_name: HashMap<SymbolId, Arc<AttrSchema>>,
    /// Client numeric symbol aliases -> host symbol IDs.
    symbol_aliases: HashMap<u64, SymbolId>,
}

/// Thread-safe: lookups take the read lock, registration the write lock.
pub struct TypeRegistry {
    planet: Arc<Planet>,
    inner: RwLock<Inner>,
}

impl TypeRegistry {
    pub fn new(planet: Arc<Planet>) -> TypeRegistry {
        TypeRegistry {
            planet,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Resolve and register every def. Successful registration is atomic per
    /// call: a failing def leaves the registry unchanged.
    pub fn resolve_and_register(&self, defs: &Defs) -> Result<(), ReqErr> {
        let mut aliases = Vec::with_capacity(defs.symbols.len());
        for symbol in &defs.symbols {
            let host_id = self.intern(&symbol.value)?;
            if symbol.id != 0 {
                aliases.push((symbol.id, host_id));
            }
        }

        // Resolve URI fields first; flattening below compares attr URIs by
        // their interned symbol IDs.
        let mut resolved = Vec::with_capacity(defs.schemas.len());
        for schema in &defs.schemas {
            resolved.push(self.resolve_uris(schema)?);
        }

        let batch_by_name: HashMap<SymbolId, &AttrSchema> = resolved
            .iter()
            .filter_map(|s| s.schema_name.sym().map(|name| (name, s)))
            .collect();

        let mut flattened = Vec::with_capacity(resolved.len());
        {
            let inner = self.inner.read().unwrap();
            for schema in &resolved {
                let name = schema_name_sym(schema)?;
                let mut stack = vec![name];
                let attrs = flatten_attrs(schema, &batch_by_name, &inner.by_name, &mut stack)?;
                let mut flat = schema.clone();
                flat.attrs = attrs;
                flat.inherits_from.clear();
                flattened.push(flat);
            }
        }

        let mut inner = self.inner.write().unwrap();
        // Validate the batch before mutating anything.
        for schema in &flattened {
            if let Some(existing) = inner.schemas.get(&schema.schema_id) {
                if **existing != *schema {
                    return Err(ErrCode::BadSchema.err(format!(
                        "schema ID {} re-registered with divergent content",
                        schema.schema_id
                    )));
                }
            }
        }
        for schema in flattened {
            let name = schema_name_sym(&schema)?;
            let schema = Arc::new(schema);
            match inner.schemas.entry(schema.schema_id) {
                Entry::Occupied(_) => {} // identical re-registration is a no-op
                Entry::Vacant(slot) => {
                    slot.insert(schema.clone());
                    inner.by_name.insert(name, schema);
                }
            }
        }
        for (client_id, host_id) in aliases {
            inner.symbol_aliases.insert(client_id, host_id);
        }
        Ok(())
    }

    /// The resolved schema registered under `schema_id`.
    pub fn schema_by_id(&self, schema_id: u32) -> Result<Arc<AttrSchema>, ReqErr> {
        let inner = self.inner.read().unwrap();
        inner.schemas.get(&schema_id).cloned().ok_or_else(|| {
            ErrCode::TypeNotRegistered.err(format!("schema ID {schema_id} is not registered"))
        })
    }

    /// Host symbol ID for a client-declared numeric alias.
    pub fn symbol_alias(&self, client_id: u64) -> Option<SymbolId> {
        let inner = self.inner.read().unwrap();
        inner.symbol_aliases.get(&client_id).copied()
    }

    fn intern(&self, value: &[u8]) -> Result<SymbolId, ReqErr> {
        self.planet
            .symbol_id(value, true)
            .map_err(|err| ErrCode::DataFailure.err(err.to_string()))
    }

    fn resolve_uri(&self, uri: &Uri) -> Result<Uri, ReqErr> {
        match uri {
            Uri::Sym(_) => Ok(uri.clone()),
            Uri::Text(text) => {
                if text.is_empty() {
                    return Err(ErrCode::InvalidUri.err("empty URI"));
                }
                Ok(Uri::Sym(self.intern(text.as_bytes())?))
            }
        }
    }

    fn resolve_uris(&self, schema: &AttrSchema) -> Result<AttrSchema, ReqErr> {
        let mut out = schema.clone();
        out.app_uri = self.resolve_uri(&schema.app_uri)?;
        out.attr_model_uri = self.resolve_uri(&schema.attr_model_uri)?;
        out.schema_name = self.resolve_uri(&schema.schema_name)?;
        for attr in &mut out.attrs {
            attr.attr_uri = self.resolve_uri(&attr.attr_uri)?;
        }
        for parent in &mut out.inherits_from {
            *parent = self.resolve_uri(parent)?;
        }
        Ok(out)
    }
}

fn schema_name_sym(schema: &AttrSchema) -> Result<SymbolId, ReqErr> {
    schema
        .schema_name
        .sym()
        .ok_or_else(|| ErrCode::BadSchema.err("unresolved schema name"))
}

/// Flatten inheritance: parents contribute their attrs in declaration order,
/// the child wins on attr-URI collision. Cycles and unknown parents fail
/// with `BadSchema`.
fn flatten_attrs(
    schema: &AttrSchema,
    batch: &HashMap<SymbolId, &AttrSchema>,
    registered: &HashMap<SymbolId, Arc<AttrSchema>>,
    stack: &mut Vec<SymbolId>,
) -> Result<Vec<AttrSpec>, ReqErr> {
    let mut merged: Vec<AttrSpec> = Vec::with_capacity(schema.attrs.len());
    for parent_uri in &schema.inherits_from {
        let parent_name = parent_uri
            .sym()
            .ok_or_else(|| ErrCode::BadSchema.err("unresolved parent schema name"))?;
        if stack.contains(&parent_name) {
            return Err(ErrCode::BadSchema.err("schema inheritance cycle"));
        }
        let parent: &AttrSchema = match batch.get(&parent_name) {
            Some(schema) => *schema,
            None => registered
                .get(&parent_name)
                .map(Arc::as_ref)
                .ok_or_else(|| ErrCode::BadSchema.err("unknown parent schema"))?,
        };
        stack.push(parent_name);
        let parent_attrs = flatten_attrs(parent, batch, registered, stack)?;
        stack.pop();
        for attr in parent_attrs {
            merge_attr(&mut merged, attr);
        }
    }
    for attr in &schema.attrs {
        merge_attr(&mut merged, attr.clone());
    }
    Ok(merged)
}

fn merge_attr(merged: &mut Vec<AttrSpec>, attr: AttrSpec) {
    if let Some(slot) = merged.iter_mut().find(|a| a.attr_uri == attr.attr_uri) {
        *slot = attr;
    } else {
        merged.push(attr);
    }
}
