//! Request error codes and the wire-visible error record.

use serde::{Deserialize, Serialize};

/// Numeric request error codes. The values are wire contract and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
#[repr(u32)]
pub enum ErrCode {
    UnnamedErr = 5000,
    InternalErr = 5001,
    UnsupportedOp = 5002,
    Unimplemented = 5003,
    ReqCanceled = 5004,
    ShuttingDown = 5005,
    Disconnected = 5006,
    InvalidLogin = 5007,
    ReqNotFound = 5010,
    InvalidReq = 5020,
    InvalidUri = 5021,
    BadValue = 5022,
    NothingToCommit = 5030,
    CommitFailed = 5031,
    PlanetNotFound = 5032,
    PlanetFailure = 5033,
    AppNotFound = 5034,
    NoAttrsFound = 5036,
    TypeNotFound = 5050,
    TypeNotRegistered = 5051,
    BadSchema = 5052,
    DataFailure = 5053,
    InvalidCell = 5055,
    NotPinnable = 5056,
    InsufficientPermissions = 5101,
    ChProtocolNotRecognized = 5201,
}

impl ErrCode {
    /// Build a [`ReqErr`] carrying this code.
    pub fn err(self, msg: impl Into<String>) -> ReqErr {
        ReqErr {
            code: self,
            msg: msg.into(),
        }
    }
}

impl From<ErrCode> for u32 {
    fn from(code: ErrCode) -> u32 {
        code as u32
    }
}

impl TryFrom<u32> for ErrCode {
    type Error = String;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        use ErrCode::*;
        Ok(match v {
            5000 => UnnamedErr,
            5001 => InternalErr,
            5002 => UnsupportedOp,
            5003 => Unimplemented,
            5004 => ReqCanceled,
            5005 => ShuttingDown,
            5006 => Disconnected,
            5007 => InvalidLogin,
            5010 => ReqNotFound,
            5020 => InvalidReq,
            5021 => InvalidUri,
            5022 => BadValue,
            5030 => NothingToCommit,
            5031 => CommitFailed,
            5032 => PlanetNotFound,
            5033 => PlanetFailure,
            5034 => AppNotFound,
            5036 => NoAttrsFound,
            5050 => TypeNotFound,
            5051 => TypeNotRegistered,
            5052 => BadSchema,
            5053 => DataFailure,
            5055 => InvalidCell,
            5056 => NotPinnable,
            5101 => InsufficientPermissions,
            5201 => ChProtocolNotRecognized,
            other => return Err(format!("unknown error code {other}")),
        })
    }
}

/// A request-scoped failure as it travels on the wire: a framed (code, message)
/// record carried in a `CloseReq` whose value type is `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code:?}: {msg}")]
pub struct ReqErr {
    pub code: ErrCode,
    pub msg: String,
}

impl ReqErr {
    pub fn new(code: ErrCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
        }
    }

    pub fn code_num(&self) -> u32 {
        self.code as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_numbers_are_fixed() {
        assert_eq!(u32::from(ErrCode::InvalidReq), 5020);
        assert_eq!(u32::from(ErrCode::TypeNotRegistered), 5051);
        assert_eq!(u32::from(ErrCode::InsufficientPermissions), 5101);
        assert_eq!(ErrCode::try_from(5004).unwrap(), ErrCode::ReqCanceled);
        assert!(ErrCode::try_from(4999).is_err());
    }

    #[test]
    fn req_err_payload_roundtrip() {
        let err = ErrCode::BadSchema.err("schema 42 diverges");
        let buf = crate::encode_payload(&err).unwrap();
        let back: ReqErr = crate::decode_payload(&buf).unwrap();
        assert_eq!(back, err);
    }
}
