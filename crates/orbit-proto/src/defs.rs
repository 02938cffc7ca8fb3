//! Client-declared schema definitions and request payload records.

use serde::{Deserialize, Serialize};

use crate::{CellId, SymbolId};

/// As an `AttrSchema::app_uri`, selects the default app registered for the
/// schema's data-model URI.
pub const DEFAULT_APP_URI: &str = ".";

/// A URI field of a schema definition. Clients submit text; the host rewrites
/// every field to the interned symbol ID during registration, so a resolved
/// schema carries no strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Uri {
    Text(String),
    Sym(SymbolId),
}

impl Uri {
    pub fn text(&self) -> Option<&str> {
        match self {
            Uri::Text(s) => Some(s),
            Uri::Sym(_) => None,
        }
    }

    pub fn sym(&self) -> Option<SymbolId> {
        match self {
            Uri::Text(_) => None,
            Uri::Sym(id) => Some(*id),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Uri::Sym(_))
    }
}

impl From<&str> for Uri {
    fn from(s: &str) -> Uri {
        Uri::Text(s.to_string())
    }
}

impl From<SymbolId> for Uri {
    fn from(id: SymbolId) -> Uri {
        Uri::Sym(id)
    }
}

/// How an attribute's 64-bit series index is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeriesType {
    /// The attribute always appears at `bound_si`.
    #[default]
    Fixed,
    /// Raw signed integer key.
    I64,
    /// Signed 48.16 fixed seconds, relative.
    Time16,
    /// Signed 48.16 fixed seconds, absolute UTC.
    Utc16,
}

/// One attribute of a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrSpec {
    pub attr_uri: Uri,
    pub attr_id: u32,
    pub series_type: SeriesType,
    pub bound_si: i64,
    pub val_type_id: u16,
}

/// A named collection of attribute specs describing the wire-visible
/// attributes of a cell class. `schema_id` is client-chosen and scopes to the
/// session that registered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrSchema {
    pub app_uri: Uri,
    pub attr_model_uri: Uri,
    pub schema_name: Uri,
    pub schema_id: u32,
    pub attrs: Vec<AttrSpec>,
    #[serde(default)]
    pub inherits_from: Vec<Uri>,
}

impl AttrSchema {
    /// True once every URI field has been rewritten to a symbol ID.
    pub fn is_resolved(&self) -> bool {
        self.app_uri.is_resolved()
            && self.attr_model_uri.is_resolved()
            && self.schema_name.is_resolved()
            && self.attrs.iter().all(|a| a.attr_uri.is_resolved())
            && self.inherits_from.iter().all(Uri::is_resolved)
    }
}

/// A client symbol declaration: `id` is the client's session-scoped numeric
/// alias (zero for none), `value` the byte string to intern host-side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolDef {
    pub id: u64,
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
}

/// The payload of a `ResolveAndRegister` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Defs {
    #[serde(default)]
    pub symbols: Vec<SymbolDef>,
    #[serde(default)]
    pub schemas: Vec<AttrSchema>,
}

/// The payload of a `Login` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginReq {
    #[serde(with = "serde_bytes")]
    pub user_uid: Vec<u8>,
    #[serde(with = "serde_bytes", default)]
    pub challenge_resp: Vec<u8>,
}

/// The payload of a `PinCell` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinReq {
    /// The cell to pin; zero asks the resolving app to choose.
    pub pin_cell: CellId,
    /// Session schema ID describing the pinned cell's own attributes.
    pub content_schema: u32,
    /// Session schema IDs for child cells pushed under this request.
    #[serde(default)]
    pub child_schemas: Vec<u32>,
    /// Optional cell URI for apps that address cells by path.
    #[serde(default)]
    pub cell_uri: String,
    /// Target planet; zero means the session's home planet.
    #[serde(default)]
    pub planet_id: u64,
}
