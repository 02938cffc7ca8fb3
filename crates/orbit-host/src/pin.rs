//! The cell pin engine: one task per pin request.
//!
//! A pin moves through New -> Resolving -> Streaming -> Closing. The engine
//! resolves the request's schemas, selects the app, replies `PinCell` before
//! any push, forwards app updates in order with batching, and always ends
//! with exactly one terminal `CloseReq` on the request ID.

use std::collections::HashSet;
use std::sync::Arc;

use orbit_proto::{
    ErrCode, Msg, MsgBatch, MsgOp, PinReq, ReqErr, FLAG_CELL_CHECKPOINT,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::app::{App, CellReq, CellSub};
use crate::host::Host;
use crate::planet::Planet;
use crate::registry::TypeRegistry;
use crate::session::SessEvent;

/// Session-side handle to a live pin task.
pub(crate) struct PinHandle {
    cancel_tx: watch::Sender<bool>,
}

impl PinHandle {
    /// Mark the request canceled. The pin task stops accepting pushes and
    /// emits its terminal close.
    pub(crate) fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

pub(crate) fn spawn(
    host: Arc<Host>,
    planet: Arc<Planet>,
    registry: Arc<TypeRegistry>,
    outbox: mpsc::Sender<Msg>,
    events: mpsc::Sender<SessEvent>,
    req_id: u64,
    pin: PinReq,
) -> PinHandle {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let runner = PinRunner {
        host,
        planet,
        registry,
        outbox,
        events,
        req_id,
        pin,
        cancel_rx,
    };
    tokio::spawn(runner.run());
    PinHandle { cancel_tx }
}

struct PinRunner {
    host: Arc<Host>,
    planet: Arc<Planet>,
    registry: Arc<TypeRegistry>,
    outbox: mpsc::Sender<Msg>,
    events: mpsc::Sender<SessEvent>,
    req_id: u64,
    pin: PinReq,
    cancel_rx: watch::Receiver<bool>,
}

impl PinRunner {
    async fn run(mut self) {
        let outcome = self.drive().await;
        let mut close = Msg::new(MsgOp::CloseReq, self.req_id);
        if let Err(err) = outcome {
            tracing::debug!(req_id = self.req_id, code = err.code_num(), %err, "pin closed");
            close.set_err(&err);
        }
        // Release the request ID before the client can observe the close, so
        // a conforming client may reuse the ID immediately afterwards.
        let _ = self.events.send(SessEvent::ReqClosed(self.req_id)).await;
        let _ = self.outbox.send(close).await;
    }

    async fn drive(&mut self) -> Result<(), ReqErr> {
        // Resolving: schemas first, then the app.
        if self.pin.planet_id != 0 && self.pin.planet_id != self.planet.planet_id() {
            return Err(ErrCode::PlanetNotFound.err(format!(
                "planet {} is not served by this session",
                self.pin.planet_id
            )));
        }
        let content_schema = self.registry.schema_by_id(self.pin.content_schema)?;
        let mut child_schemas = Vec::with_capacity(self.pin.child_schemas.len());
        for schema_id in &self.pin.child_schemas {
            child_schemas.push(self.registry.schema_by_id(*schema_id)?);
        }
        let app = self
            .host
            .select_app_for_schema(&self.planet, &content_schema)?;

        let mut req = CellReq {
            req_id: self.req_id,
            parent_req_id: None,
            planet_id: self.planet.planet_id(),
            target: self.pin.pin_cell,
            cell_uri: std::mem::take(&mut self.pin.cell_uri),
            content_schema,
            child_schemas,
            app_item: None,
        };
        app.resolve_request(&mut req).await.map_err(app_req_err)?;
        if req.target == 0 {
            return Err(ErrCode::InvalidCell.err("app resolved the request to cell 0"));
        }

        // Streaming. The PinCell reply precedes every push for this request.
        let target = req.target;
        let mut reply = Msg::new(MsgOp::PinCell, self.req_id);
        reply.cell_id = target;
        self.send(reply).await?;

        let opts = self.host.opts().clone();
        let (push_tx, mut push_rx) = mpsc::channel::<MsgBatch>(opts.push_depth);
        let sub: Arc<dyn CellSub> = Arc::new(PinSub {
            req,
            push_tx,
            cancel_rx: self.cancel_rx.clone(),
        });

        let pusher_app = app.clone();
        let mut pusher: JoinHandle<anyhow::Result<()>> =
            tokio::spawn(async move { pusher_app.push_cell_state(sub).await });

        let mut pending: Vec<Msg> = Vec::new();
        let mut inserted: HashSet<u64> = HashSet::from([target]);
        let mut pusher_done = false;
        let mut idle = tokio::time::interval(opts.batch_idle);
        idle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                _ = self.cancel_rx.changed() => {
                    if opts.drain_canceled_pins {
                        while let Ok(batch) = push_rx.try_recv() {
                            self.stage(batch, &mut pending, &mut inserted)?;
                        }
                        self.flush(&mut pending).await?;
                    }
                    break Err(ErrCode::ReqCanceled.err("request canceled"));
                }
                res = &mut pusher, if !pusher_done => {
                    pusher_done = true;
                    match res {
                        Ok(Ok(())) => {
                            // Everything the pusher queued belongs before the
                            // cell checkpoint.
                            while let Ok(batch) = push_rx.try_recv() {
                                self.stage(batch, &mut pending, &mut inserted)?;
                            }
                            self.flush(&mut pending).await?;
                            let mut commit = Msg::new(MsgOp::Commit, self.req_id);
                            commit.cell_id = target;
                            commit.flags |= FLAG_CELL_CHECKPOINT;
                            self.send(commit).await?;
                        }
                        Ok(Err(err)) => break Err(app_req_err(err)),
                        Err(join_err) => {
                            break Err(ErrCode::InternalErr
                                .err(format!("app push task failed: {join_err}")));
                        }
                    }
                }
                batch = push_rx.recv() => {
                    match batch {
                        Some(batch) => {
                            let checkpoint = self.stage(batch, &mut pending, &mut inserted)?;
                            if checkpoint || pending.len() >= opts.batch_size {
                                self.flush(&mut pending).await?;
                            }
                        }
                        // All sub handles dropped: normal completion.
                        None => {
                            self.flush(&mut pending).await?;
                            break Ok(());
                        }
                    }
                }
                _ = idle.tick() => {
                    self.flush(&mut pending).await?;
                }
            }
        };

        pusher.abort();
        result
    }

    /// Validate and stage one update batch; returns whether it carried a
    /// cell checkpoint.
    fn stage(
        &self,
        batch: MsgBatch,
        pending: &mut Vec<Msg>,
        inserted: &mut HashSet<u64>,
    ) -> Result<bool, ReqErr> {
        let mut checkpoint = false;
        for mut msg in batch {
            msg.req_id = self.req_id;
            match msg.op {
                MsgOp::InsertCell => {
                    if msg.cell_id == 0 || !inserted.insert(msg.cell_id) {
                        return Err(ErrCode::InvalidCell
                            .err(format!("cell {} already inserted", msg.cell_id)));
                    }
                }
                MsgOp::PushAttr => {
                    if !inserted.contains(&msg.cell_id) {
                        return Err(ErrCode::InvalidCell.err(format!(
                            "attr push for cell {} before its InsertCell",
                            msg.cell_id
                        )));
                    }
                }
                MsgOp::Commit => {
                    checkpoint |= msg.is_checkpoint();
                }
                other => {
                    return Err(ErrCode::BadValue
                        .err(format!("apps may not push {other:?} messages")));
                }
            }
            pending.push(msg);
        }
        Ok(checkpoint)
    }

    async fn flush(&self, pending: &mut Vec<Msg>) -> Result<(), ReqErr> {
        for msg in pending.drain(..) {
            self.outbox
                .send(msg)
                .await
                .map_err(|_| ErrCode::Disconnected.err("session outbox closed"))?;
        }
        Ok(())
    }

    async fn send(&self, msg: Msg) -> Result<(), ReqErr> {
        self.outbox
            .send(msg)
            .await
            .map_err(|_| ErrCode::Disconnected.err("session outbox closed"))
    }
}

/// Map an app-side failure to its wire form; apps may bail with a `ReqErr`
/// to choose the code, anything else becomes `InternalErr`.
fn app_req_err(err: anyhow::Error) -> ReqErr {
    match err.downcast::<ReqErr>() {
        Ok(req_err) => req_err,
        Err(other) => ErrCode::InternalErr.err(other.to_string()),
    }
}

struct PinSub {
    req: CellReq,
    push_tx: mpsc::Sender<MsgBatch>,
    cancel_rx: watch::Receiver<bool>,
}

#[async_trait::async_trait]
impl CellSub for PinSub {
    fn req(&self) -> &CellReq {
        &self.req
    }

    fn is_canceled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    async fn canceled(&self) {
        let mut rx = self.cancel_rx.clone();
        if *rx.borrow() {
            return;
        }
        // A closed channel means the engine is gone, which counts too.
        let _ = rx.changed().await;
    }

    async fn push_update(&self, batch: MsgBatch) -> anyhow::Result<()> {
        if self.is_canceled() {
            anyhow::bail!(ErrCode::ReqCanceled.err("pin canceled"));
        }
        self.push_tx
            .send(batch)
            .await
            .map_err(|_| anyhow::anyhow!(ErrCode::ReqCanceled.err("pin closed")))?;
        Ok(())
    }
}
