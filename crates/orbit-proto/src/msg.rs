//! The `Msg` wire record, opcode and value-type numbering, and framing.

use serde::{Deserialize, Serialize};

use crate::{ReqErr, WireError, WireResult};

/// The buffer in `val_buf` is a borrowed view into a pooled sender; treat it
/// read-only and never let the flag reach the wire.
pub const FLAG_VAL_BUF_SHARED: u32 = 1 << 0;
/// Marks a `Commit` that closes out a cell's initial state push.
pub const FLAG_CELL_CHECKPOINT: u32 = 1 << 1;

/// Hard ceiling on a single wire frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Message opcodes. All other values are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MsgOp {
    Login = 1,
    ResolveAndRegister = 2,
    PinCell = 3,
    PushAttr = 4,
    InsertCell = 5,
    Commit = 6,
    CloseReq = 7,
}

impl From<MsgOp> for u8 {
    fn from(op: MsgOp) -> u8 {
        op as u8
    }
}

impl TryFrom<u8> for MsgOp {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        use MsgOp::*;
        Ok(match v {
            1 => Login,
            2 => ResolveAndRegister,
            3 => PinCell,
            4 => PushAttr,
            5 => InsertCell,
            6 => Commit,
            7 => CloseReq,
            other => return Err(format!("reserved opcode {other}")),
        })
    }
}

/// Value typing for the `val_buf` / `val_int` pair. Values ≥ 1000 are
/// client-bound and pass through the core untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(into = "u16", try_from = "u16")]
pub enum ValType {
    #[default]
    Nil,
    /// Untyped int64 in `val_int`.
    Int,
    /// Raw bytes in `val_buf`.
    Bytes,
    /// UTF-8 in `val_buf`.
    Str,
    /// 30-byte TID in `val_buf`.
    Tid,
    /// Session schema ID in `val_int`.
    SchemaId,
    /// Blob reference in `val_int`.
    Blob,
    /// 48.16 UTC ticks in `val_int`.
    DateTime,
    /// 48.16 delta ticks in `val_int`.
    Duration,
    /// UTF-8 in `val_buf`.
    AssetUri,
    /// UTF-8 in `val_buf`.
    Url,
    /// Framed `ReqErr` record in `val_buf`.
    Err,
    /// Framed `LoginReq` record in `val_buf`.
    LoginReq,
    /// Framed `PinReq` record in `val_buf`.
    PinReq,
    /// Framed `Defs` record in `val_buf`.
    Defs,
    /// Framed transform record in `val_buf`.
    Trs,
    /// Client-bound value type (≥ 1000), opaque to the core.
    Client(u16),
}

impl From<ValType> for u16 {
    fn from(vt: ValType) -> u16 {
        use ValType::*;
        match vt {
            Nil => 0,
            Int => 4,
            Bytes => 6,
            Str => 7,
            Tid => 16,
            SchemaId => 18,
            Blob => 22,
            DateTime => 23,
            Duration => 24,
            AssetUri => 25,
            Url => 26,
            Err => 50,
            LoginReq => 66,
            PinReq => 67,
            Defs => 68,
            Trs => 84,
            Client(v) => v,
        }
    }
}

impl TryFrom<u16> for ValType {
    type Error = String;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        use ValType::*;
        Ok(match v {
            0 => Nil,
            4 => Int,
            6 => Bytes,
            7 => Str,
            16 => Tid,
            18 => SchemaId,
            22 => Blob,
            23 => DateTime,
            24 => Duration,
            25 => AssetUri,
            26 => Url,
            50 => Err,
            66 => LoginReq,
            67 => PinReq,
            68 => Defs,
            84 => Trs,
            v if v >= 1000 => Client(v),
            other => return Result::Err(format!("reserved value type {other}")),
        })
    }
}

impl ValType {
    /// Whether values of this type live in `val_buf` (vs. `val_int`).
    pub fn uses_buf(self) -> bool {
        use ValType::*;
        matches!(
            self,
            Bytes | Str | Tid | AssetUri | Url | Err | LoginReq | PinReq | Defs | Trs
        )
    }
}

/// The wire unit. Field meaning depends on `op`; `val_type` governs which of
/// `val_buf` / `val_int` carries the value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Msg {
    pub op: MsgOp,
    pub req_id: u64,
    pub cell_id: u64,
    pub from_id: u64,
    pub attr_id: u32,
    pub series_index: i64,
    pub val_type: ValType,
    #[serde(with = "serde_bytes")]
    pub val_buf: Vec<u8>,
    pub val_int: i64,
    pub flags: u32,
    pub next: Option<Box<Msg>>,
}

impl Msg {
    pub fn new(op: MsgOp, req_id: u64) -> Msg {
        Msg {
            op,
            req_id,
            cell_id: 0,
            from_id: 0,
            attr_id: 0,
            series_index: 0,
            val_type: ValType::Nil,
            val_buf: Vec::new(),
            val_int: 0,
            flags: 0,
            next: None,
        }
    }

    pub fn set_val_bytes(&mut self, vt: ValType, buf: Vec<u8>) {
        self.val_type = vt;
        self.val_buf = buf;
        self.val_int = 0;
    }

    pub fn set_val_int(&mut self, vt: ValType, v: i64) {
        self.val_type = vt;
        self.val_buf.clear();
        self.val_int = v;
    }

    pub fn set_err(&mut self, err: &ReqErr) {
        // Encoding a ReqErr cannot fail; it is a plain (u32, String) record.
        let buf = crate::encode_payload(err).expect("ReqErr encodes");
        self.set_val_bytes(ValType::Err, buf);
    }

    /// Decode the `ReqErr` payload, if this message carries one.
    pub fn err(&self) -> Option<ReqErr> {
        if self.val_type != ValType::Err {
            return None;
        }
        crate::decode_payload(&self.val_buf).ok()
    }

    pub fn is_checkpoint(&self) -> bool {
        self.flags & FLAG_CELL_CHECKPOINT != 0
    }

    /// Flatten a `next` chain into an ordered sequence. Chains exist only on
    /// the wire; in-memory handling always works on the flattened form.
    pub fn flatten(mut self) -> Vec<Msg> {
        let mut out = Vec::with_capacity(1);
        loop {
            let next = self.next.take();
            out.push(self);
            match next {
                Some(boxed) => self = *boxed,
                None => return out,
            }
        }
    }

    /// Copy for marshaling: shared buffers are owned copies by construction,
    /// so only the flag needs stripping. Applies through the `next` chain.
    fn wire_clone(&self) -> Msg {
        let mut m = self.clone();
        let mut cur = &mut m;
        loop {
            cur.flags &= !FLAG_VAL_BUF_SHARED;
            match cur.next {
                Some(ref mut boxed) => cur = boxed,
                None => break,
            }
        }
        m
    }
}

/// An ordered run of messages, coalesced by the pin engine before flushing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MsgBatch {
    pub msgs: Vec<Msg>,
}

impl MsgBatch {
    pub fn new() -> MsgBatch {
        MsgBatch::default()
    }

    pub fn push(&mut self, msg: Msg) {
        self.msgs.push(msg);
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }
}

impl From<Msg> for MsgBatch {
    fn from(msg: Msg) -> MsgBatch {
        MsgBatch { msgs: vec![msg] }
    }
}

impl IntoIterator for MsgBatch {
    type Item = Msg;
    type IntoIter = std::vec::IntoIter<Msg>;

    fn into_iter(self) -> Self::IntoIter {
        self.msgs.into_iter()
    }
}

/// Append the framed wire form of `msg` to `out`: a `u32` big-endian length
/// prefix followed by the CBOR record. Strips `FLAG_VAL_BUF_SHARED`.
pub fn encode_frame(msg: &Msg, out: &mut Vec<u8>) -> WireResult<()> {
    let body = if msg.flags & FLAG_VAL_BUF_SHARED != 0 || has_shared_next(msg) {
        serde_cbor::to_vec(&msg.wire_clone())?
    } else {
        serde_cbor::to_vec(msg)?
    };
    if body.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLong(body.len()));
    }
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(())
}

fn has_shared_next(msg: &Msg) -> bool {
    let mut cur = msg;
    while let Some(next) = &cur.next {
        if next.flags & FLAG_VAL_BUF_SHARED != 0 {
            return true;
        }
        cur = next;
    }
    false
}

/// Decode a frame body (the CBOR record without its length prefix) into the
/// flattened message chain.
pub fn decode_body(body: &[u8]) -> WireResult<Vec<Msg>> {
    let msg: Msg = serde_cbor::from_slice(body)?;
    Ok(msg.flatten())
}

/// Decode one frame from the front of `buf`, returning the flattened message
/// chain and the number of bytes consumed.
pub fn decode_frame(buf: &[u8]) -> WireResult<(Vec<Msg>, usize)> {
    if buf.len() < 4 {
        return Err(WireError::Truncated {
            need: 4,
            have: buf.len(),
        });
    }
    let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if body_len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLong(body_len));
    }
    let total = 4 + body_len;
    if buf.len() < total {
        return Err(WireError::Truncated {
            need: total,
            have: buf.len(),
        });
    }
    Ok((decode_body(&buf[4..total])?, total))
}
