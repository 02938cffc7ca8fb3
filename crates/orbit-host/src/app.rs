//! The capability interface between the host and application plugins.
//!
//! Apps never hold owning references back into the host or session; they see
//! a [`CellReq`] describing the pin and a [`CellSub`] handle for pushing
//! state. Both sides treat `anyhow::Result` as the plugin boundary — an app
//! may bail with a [`orbit_proto::ReqErr`] to pick the wire error code.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use orbit_proto::{AttrSchema, CellId, MsgBatch};

/// App-private state attached to a request by `resolve_request`.
pub type AppItem = Box<dyn Any + Send + Sync>;

/// Per-pin state record handed to the resolving app.
pub struct CellReq {
    pub req_id: u64,
    pub parent_req_id: Option<u64>,
    pub planet_id: u64,
    /// The pinned cell. Zero on entry to `resolve_request` asks the app to
    /// choose; it must be non-zero afterwards.
    pub target: CellId,
    /// Optional path-style address for apps that resolve cells by URI.
    pub cell_uri: String,
    /// Resolved schema for the pinned cell's own attributes.
    pub content_schema: Arc<AttrSchema>,
    /// Resolved schemas for child cells pushed under this request.
    pub child_schemas: Vec<Arc<AttrSchema>>,
    /// Set by the app during `resolve_request` for use in `push_cell_state`.
    pub app_item: Option<AppItem>,
}

/// A live pin subscription, handed to the app for pushing cell state.
#[async_trait]
pub trait CellSub: Send + Sync {
    fn req(&self) -> &CellReq;

    /// True once the client or host canceled the request. Pushes after this
    /// point fail.
    fn is_canceled(&self) -> bool;

    /// Resolves when the request is canceled; long-lived apps park on this
    /// to keep a subscription open.
    async fn canceled(&self);

    /// Push an ordered batch of updates, blocking while the outbound queue
    /// is full.
    async fn push_update(&self, batch: MsgBatch) -> anyhow::Result<()>;
}

/// An application handler. Registered with the host under its app URI and as
/// the default handler for each of its data-model URIs.
#[async_trait]
pub trait App: Send + Sync + std::fmt::Debug {
    /// Identifies this app, usually `"{domain}/{app}/v{MAJOR}.{MINOR}"`.
    fn app_uri(&self) -> &str;

    /// Data-model URIs this app can serve as the default handler for.
    fn data_model_uris(&self) -> Vec<String>;

    /// Resolve the request to its final target cell; typically sets
    /// `req.app_item` so `push_cell_state` has its state ready.
    async fn resolve_request(&self, req: &mut CellReq) -> anyhow::Result<()>;

    /// Push the cell's current state through `sub`. Called once per pin;
    /// the app may retain `sub` to push later updates until cancellation.
    async fn push_cell_state(&self, sub: Arc<dyn CellSub>) -> anyhow::Result<()>;
}
