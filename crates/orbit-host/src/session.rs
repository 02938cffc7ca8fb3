//! The session multiplexer: one dispatcher task per client session.
//!
//! A session owns an inbox and an outbox of [`Msg`]. The dispatcher parses
//! inbound opcodes and routes them to the type registry or the pin engine;
//! replies and pushed state go out through the outbox. The session ends when
//! either queue closes, cancelling every live pin on the way out.

use std::collections::HashMap;
use std::sync::Arc;

use orbit_proto::{
    decode_payload, Defs, ErrCode, LoginReq, Msg, MsgOp, PinReq, ReqErr, ValType,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::host::Host;
use crate::pin::{self, PinHandle};
use crate::planet::Planet;
use crate::registry::TypeRegistry;

/// Raised by pin tasks back into the dispatcher.
#[derive(Debug)]
pub(crate) enum SessEvent {
    ReqClosed(u64),
}

/// The endpoint a transport (or embedder) drives: push parsed messages into
/// `inbox`, drain replies and cell updates from `outbox`.
pub struct SessionHandle {
    pub inbox: mpsc::Sender<Msg>,
    pub outbox: mpsc::Receiver<Msg>,
    session_id: u64,
    planet: Arc<Planet>,
    registry: Arc<TypeRegistry>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn planet(&self) -> &Arc<Planet> {
        &self.planet
    }

    /// The session's type registry, for in-process callers.
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Abort the dispatcher outright. Dropping the handle's inbox instead
    /// gives the session a graceful close.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Split into the bare queue ends for a transport. Dropping the returned
    /// sender is what closes the session, so transports must not hold a
    /// second copy.
    pub fn into_endpoint(self) -> (mpsc::Sender<Msg>, mpsc::Receiver<Msg>) {
        (self.inbox, self.outbox)
    }
}

pub(crate) fn start(host: Arc<Host>, session_id: u64) -> SessionHandle {
    let opts = host.opts();
    let (inbox_tx, inbox_rx) = mpsc::channel(opts.inbox_depth);
    let (outbox_tx, outbox_rx) = mpsc::channel(opts.outbox_depth);
    let (events_tx, events_rx) = mpsc::channel(32);

    let planet = host.home_planet().clone();
    let registry = Arc::new(TypeRegistry::new(planet.clone()));

    let runner = SessionRunner {
        host,
        planet: planet.clone(),
        registry: registry.clone(),
        outbox: outbox_tx,
        events_tx,
        session_id,
        auth: None,
        pins: HashMap::new(),
    };
    let task = tokio::spawn(runner.run(inbox_rx, events_rx));

    SessionHandle {
        inbox: inbox_tx,
        outbox: outbox_rx,
        session_id,
        planet,
        registry,
        task,
    }
}

struct SessionRunner {
    host: Arc<Host>,
    planet: Arc<Planet>,
    registry: Arc<TypeRegistry>,
    outbox: mpsc::Sender<Msg>,
    events_tx: mpsc::Sender<SessEvent>,
    session_id: u64,
    /// The logged-in user UID, once `Login` succeeds.
    auth: Option<Vec<u8>>,
    pins: HashMap<u64, PinHandle>,
}

impl SessionRunner {
    async fn run(
        mut self,
        mut inbox: mpsc::Receiver<Msg>,
        mut events_rx: mpsc::Receiver<SessEvent>,
    ) {
        tracing::debug!(session = self.session_id, "session started");
        loop {
            tokio::select! {
                // Closed-request events drain first so a request ID freed by
                // a terminal close is reusable by the very next inbound
                // message.
                biased;
                Some(event) = events_rx.recv() => {
                    let SessEvent::ReqClosed(req_id) = event;
                    self.pins.remove(&req_id);
                }
                msg = inbox.recv() => match msg {
                    Some(msg) => {
                        for msg in msg.flatten() {
                            self.dispatch(msg).await;
                        }
                    }
                    None => break,
                },
            }
        }
        // Transport gone: every open request goes down with the session.
        for (_, pin) in self.pins.drain() {
            pin.cancel();
        }
        tracing::debug!(session = self.session_id, "session ended");
    }

    async fn dispatch(&mut self, msg: Msg) {
        let req_id = msg.req_id;
        if let Err(err) = self.dispatch_inner(msg).await {
            self.reply_close_err(req_id, &err).await;
        }
    }

    async fn dispatch_inner(&mut self, msg: Msg) -> Result<(), ReqErr> {
        if msg.op != MsgOp::CloseReq && self.pins.contains_key(&msg.req_id) {
            return Err(ErrCode::InvalidReq
                .err(format!("request ID {} is already in use", msg.req_id)));
        }
        if self.auth.is_none() && !matches!(msg.op, MsgOp::Login | MsgOp::ResolveAndRegister) {
            return Err(ErrCode::InsufficientPermissions.err("login required"));
        }
        match msg.op {
            MsgOp::Login => self.on_login(msg).await,
            MsgOp::ResolveAndRegister => self.on_resolve(msg).await,
            MsgOp::PinCell => self.on_pin(msg),
            MsgOp::CloseReq => self.on_close(&msg),
            other => Err(ErrCode::UnsupportedOp.err(format!("clients may not send {other:?}"))),
        }
    }

    async fn on_login(&mut self, msg: Msg) -> Result<(), ReqErr> {
        if msg.val_type != ValType::LoginReq {
            return Err(ErrCode::InvalidLogin.err("expected a LoginReq payload"));
        }
        let login: LoginReq = decode_payload(&msg.val_buf)
            .map_err(|_| ErrCode::InvalidLogin.err("undecodable LoginReq"))?;
        if login.user_uid.is_empty() {
            return Err(ErrCode::InvalidLogin.err("empty user UID"));
        }
        // Challenge slot: any response is accepted for now.
        self.auth = Some(login.user_uid);
        tracing::info!(session = self.session_id, "login ok");
        self.reply_empty(MsgOp::Login, msg.req_id).await;
        Ok(())
    }

    async fn on_resolve(&mut self, msg: Msg) -> Result<(), ReqErr> {
        if msg.val_type != ValType::Defs {
            return Err(ErrCode::BadValue.err("expected a Defs payload"));
        }
        let defs: Defs = decode_payload(&msg.val_buf)
            .map_err(|err| ErrCode::BadValue.err(format!("undecodable Defs: {err}")))?;
        self.registry.resolve_and_register(&defs)?;
        self.reply_empty(MsgOp::ResolveAndRegister, msg.req_id).await;
        Ok(())
    }

    fn on_pin(&mut self, msg: Msg) -> Result<(), ReqErr> {
        if msg.val_type != ValType::PinReq {
            return Err(ErrCode::BadValue.err("expected a PinReq payload"));
        }
        let pin: PinReq = decode_payload(&msg.val_buf)
            .map_err(|err| ErrCode::BadValue.err(format!("undecodable PinReq: {err}")))?;
        let handle = pin::spawn(
            self.host.clone(),
            self.planet.clone(),
            self.registry.clone(),
            self.outbox.clone(),
            self.events_tx.clone(),
            msg.req_id,
            pin,
        );
        self.pins.insert(msg.req_id, handle);
        Ok(())
    }

    fn on_close(&mut self, msg: &Msg) -> Result<(), ReqErr> {
        match self.pins.get(&msg.req_id) {
            Some(pin) => {
                // The pin task emits the terminal CloseReq reply.
                pin.cancel();
                Ok(())
            }
            None => Err(ErrCode::ReqNotFound.err(format!("no open request {}", msg.req_id))),
        }
    }

    async fn reply_empty(&self, op: MsgOp, req_id: u64) {
        let _ = self.outbox.send(Msg::new(op, req_id)).await;
    }

    async fn reply_close_err(&self, req_id: u64, err: &ReqErr) {
        tracing::debug!(
            session = self.session_id,
            req_id,
            code = err.code_num(),
            %err,
            "request failed"
        );
        let mut close = Msg::new(MsgOp::CloseReq, req_id);
        close.set_err(err);
        let _ = self.outbox.send(close).await;
    }
}
