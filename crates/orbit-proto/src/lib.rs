//! Wire data model for the orbit host.
//!
//! Everything a client and host exchange lives here: the [`Msg`] record and
//! its opcode/value-type numbering, schema definition records ([`Defs`]),
//! time-sortable transaction IDs ([`Tid`]), 40-bit [`SymbolId`]s, and the
//! request error code table ([`ErrCode`]).
//!
//! Records encode as canonical CBOR framed with a `u32` big-endian length
//! prefix; see [`encode_frame`] / [`decode_frame`].

mod defs;
mod err;
mod msg;
mod tid;

pub use defs::{
    AttrSchema, AttrSpec, Defs, LoginReq, PinReq, SeriesType, SymbolDef, Uri, DEFAULT_APP_URI,
};
pub use err::{ErrCode, ReqErr};
pub use msg::{
    decode_body, decode_frame, encode_frame, Msg, MsgBatch, MsgOp, ValType,
    FLAG_CELL_CHECKPOINT, FLAG_VAL_BUF_SHARED, MAX_FRAME_LEN,
};
pub use tid::{Tid, TID_ASCII_LEN, TID_BINARY_LEN};

use serde::{de::DeserializeOwned, Serialize};

/// A cell is a content unit identified by a 64-bit non-zero ID within a planet.
pub type CellId = u64;

/// First cell a session pins; carries schema resolution traffic.
pub const HOST_SESSION_CELL_ID: CellId = 3;
/// Root cell for a user.
pub const ROOT_CELL_ID: CellId = 6;

/// Port the host listens on when exposed over a streaming transport.
pub const DEFAULT_SERVICE_PORT: u16 = 5192;

pub type WireResult<T> = Result<T, WireError>;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("CBOR encoding error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLong(usize),
    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("invalid TID text: {0}")]
    BadTid(String),
}

/// Serialize a payload record (the body of `Msg::val_buf`) as CBOR.
pub fn encode_payload<T: Serialize>(value: &T) -> WireResult<Vec<u8>> {
    Ok(serde_cbor::to_vec(value)?)
}

/// Decode a payload record produced by [`encode_payload`].
pub fn decode_payload<T: DeserializeOwned>(buf: &[u8]) -> WireResult<T> {
    Ok(serde_cbor::from_slice(buf)?)
}

/// Symbol ID: a non-zero unsigned integer confined to 40 bits, serialized
/// big-endian in 5 bytes. Zero means "unassigned".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct SymbolId(pub u64);

impl SymbolId {
    pub const NONE: SymbolId = SymbolId(0);
    /// Largest value representable in the 5-byte wire form.
    pub const MAX: u64 = (1 << 40) - 1;
    pub const WIRE_LEN: usize = 5;

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Append the 5-byte big-endian wire form.
    pub fn write_to(self, out: &mut Vec<u8>) {
        let v = self.0;
        out.extend_from_slice(&[
            (v >> 32) as u8,
            (v >> 24) as u8,
            (v >> 16) as u8,
            (v >> 8) as u8,
            v as u8,
        ]);
    }

    pub fn to_wire(self) -> [u8; Self::WIRE_LEN] {
        let v = self.0;
        [
            (v >> 32) as u8,
            (v >> 24) as u8,
            (v >> 16) as u8,
            (v >> 8) as u8,
            v as u8,
        ]
    }

    /// Read a 5-byte big-endian wire form; `None` if `buf` is short.
    pub fn read_from(buf: &[u8]) -> Option<SymbolId> {
        if buf.len() < Self::WIRE_LEN {
            return None;
        }
        let v = ((buf[0] as u64) << 32)
            | ((buf[1] as u64) << 24)
            | ((buf[2] as u64) << 16)
            | ((buf[3] as u64) << 8)
            | (buf[4] as u64);
        Some(SymbolId(v))
    }
}

impl std::fmt::Display for SymbolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
