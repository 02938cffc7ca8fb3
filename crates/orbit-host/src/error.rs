use orbit_proto::{ErrCode, ReqErr};
use thiserror::Error;

pub type HostResult<T> = Result<T, HostError>;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("store error: {0}")]
    Store(#[from] orbit_store::StoreError),
    #[error("symbol table error: {0}")]
    Symbol(#[from] orbit_symbol::SymbolError),
    #[error("wire error: {0}")]
    Wire(#[from] orbit_proto::WireError),
    #[error(transparent)]
    Req(#[from] ReqErr),
    #[error("app '{0}' is already registered")]
    DuplicateApp(String),
    #[error("session closed")]
    SessionClosed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    /// The wire-visible form carried by a terminal `CloseReq`.
    pub fn to_req_err(&self) -> ReqErr {
        match self {
            HostError::Req(err) => err.clone(),
            HostError::Store(err) => ErrCode::DataFailure.err(err.to_string()),
            HostError::Symbol(err) => ErrCode::DataFailure.err(err.to_string()),
            HostError::Wire(err) => ErrCode::BadValue.err(err.to_string()),
            HostError::SessionClosed => ErrCode::Disconnected.err("session closed"),
            HostError::DuplicateApp(uri) => ErrCode::InternalErr.err(format!("duplicate app '{uri}'")),
            HostError::Io(err) => ErrCode::InternalErr.err(err.to_string()),
        }
    }
}
