//! Scripted apps and session harness helpers for integration tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orbit_host::{App, CellReq, CellSub, Host, HostOpts};
use orbit_proto::{
    decode_payload, encode_payload, AttrSchema, AttrSpec, Defs, LoginReq, Msg, MsgBatch, MsgOp,
    PinReq, SeriesType, SymbolDef, Uri, ValType,
};
use orbit_store::MemKv;

/// One step of a [`ScriptedApp`]'s initial state push.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Announce a child cell.
    Insert { cell_id: u64 },
    /// Push one attribute value.
    Attr {
        cell_id: u64,
        attr_id: u32,
        value: i64,
    },
}

/// A deterministic app: resolves any request to its pinned cell and pushes a
/// configured script. With `linger`, it holds the subscription open until
/// cancellation so mid-stream teardown is testable.
#[derive(Debug)]
pub struct ScriptedApp {
    app_uri: String,
    model_uris: Vec<String>,
    script: Vec<ScriptStep>,
    linger: bool,
}

impl ScriptedApp {
    pub fn new(app_uri: &str, model_uri: &str) -> ScriptedApp {
        ScriptedApp {
            app_uri: app_uri.to_string(),
            model_uris: vec![model_uri.to_string()],
            script: Vec::new(),
            linger: false,
        }
    }

    pub fn with_script(mut self, script: Vec<ScriptStep>) -> ScriptedApp {
        self.script = script;
        self
    }

    /// Keep the subscription open after the initial push until canceled.
    pub fn lingering(mut self) -> ScriptedApp {
        self.linger = true;
        self
    }
}

#[async_trait]
impl App for ScriptedApp {
    fn app_uri(&self) -> &str {
        &self.app_uri
    }

    fn data_model_uris(&self) -> Vec<String> {
        self.model_uris.clone()
    }

    async fn resolve_request(&self, req: &mut CellReq) -> anyhow::Result<()> {
        if req.target == 0 {
            req.target = orbit_proto::HOST_SESSION_CELL_ID;
        }
        Ok(())
    }

    async fn push_cell_state(&self, sub: Arc<dyn CellSub>) -> anyhow::Result<()> {
        let req_id = sub.req().req_id;
        let target = sub.req().target;
        let mut batch = MsgBatch::new();
        for step in &self.script {
            match step {
                ScriptStep::Insert { cell_id } => {
                    let mut msg = Msg::new(MsgOp::InsertCell, req_id);
                    msg.cell_id = *cell_id;
                    batch.push(msg);
                }
                ScriptStep::Attr {
                    cell_id,
                    attr_id,
                    value,
                } => {
                    let mut msg = Msg::new(MsgOp::PushAttr, req_id);
                    msg.cell_id = if *cell_id == 0 { target } else { *cell_id };
                    msg.attr_id = *attr_id;
                    msg.set_val_int(ValType::Int, *value);
                    batch.push(msg);
                }
            }
        }
        if !batch.is_empty() {
            sub.push_update(batch).await?;
        }
        if self.linger {
            let sub = sub.clone();
            tokio::spawn(async move {
                sub.canceled().await;
            });
        }
        Ok(())
    }
}

/// A host over a fresh in-memory KV store.
pub fn mem_host() -> Arc<Host> {
    mem_host_with(HostOpts::default())
}

pub fn mem_host_with(opts: HostOpts) -> Arc<Host> {
    Host::start(Arc::new(MemKv::new()), opts).expect("host start")
}

/// Build a `Login` request message.
pub fn login_msg(req_id: u64, user_uid: &[u8]) -> Msg {
    let mut msg = Msg::new(MsgOp::Login, req_id);
    let payload = encode_payload(&LoginReq {
        user_uid: user_uid.to_vec(),
        challenge_resp: Vec::new(),
    })
    .expect("LoginReq encodes");
    msg.set_val_bytes(ValType::LoginReq, payload);
    msg
}

/// Build a `ResolveAndRegister` request message.
pub fn resolve_msg(req_id: u64, defs: &Defs) -> Msg {
    let mut msg = Msg::new(MsgOp::ResolveAndRegister, req_id);
    msg.set_val_bytes(ValType::Defs, encode_payload(defs).expect("Defs encodes"));
    msg
}

/// Build a `PinCell` request message.
pub fn pin_msg(req_id: u64, pin: &PinReq) -> Msg {
    let mut msg = Msg::new(MsgOp::PinCell, req_id);
    msg.set_val_bytes(ValType::PinReq, encode_payload(pin).expect("PinReq encodes"));
    msg
}

/// A one-attribute schema over `model_uri`, in the shape clients submit.
pub fn simple_schema(model_uri: &str, schema_id: u32) -> AttrSchema {
    AttrSchema {
        app_uri: Uri::from(orbit_proto::DEFAULT_APP_URI),
        attr_model_uri: Uri::from(model_uri),
        schema_name: Uri::from("test-schema"),
        schema_id,
        attrs: vec![AttrSpec {
            attr_uri: Uri::from("v1/name"),
            attr_id: 7,
            series_type: SeriesType::Fixed,
            bound_si: 0,
            val_type_id: 7,
        }],
        inherits_from: Vec::new(),
    }
}

/// Standard defs for scenario-style tests: one symbol alias plus one schema.
pub fn simple_defs(model_uri: &str, schema_id: u32) -> Defs {
    Defs {
        symbols: vec![SymbolDef {
            id: 100,
            value: b"v1/name".to_vec(),
        }],
        schemas: vec![simple_schema(model_uri, schema_id)],
    }
}

/// Receive from a session outbox with a bounded wait, panicking on timeout
/// so a hung test fails fast.
pub async fn recv_reply(outbox: &mut tokio::sync::mpsc::Receiver<Msg>) -> Msg {
    tokio::time::timeout(Duration::from_secs(5), outbox.recv())
        .await
        .expect("timed out waiting for an outbound message")
        .expect("session outbox closed")
}

/// Drain outbound messages until one matches `op` on `req_id`, returning the
/// full prefix ending with the match.
pub async fn recv_until(
    outbox: &mut tokio::sync::mpsc::Receiver<Msg>,
    req_id: u64,
    op: MsgOp,
) -> Vec<Msg> {
    let mut seen = Vec::new();
    loop {
        let msg = recv_reply(outbox).await;
        let done = msg.req_id == req_id && msg.op == op;
        seen.push(msg);
        if done {
            return seen;
        }
    }
}

/// Decode the `ReqErr` carried by a message, panicking when absent.
pub fn expect_err(msg: &Msg) -> orbit_proto::ReqErr {
    assert_eq!(msg.val_type, ValType::Err, "expected an Err payload: {msg:?}");
    decode_payload(&msg.val_buf).expect("ReqErr decodes")
}
