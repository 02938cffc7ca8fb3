use std::path::PathBuf;
use std::time::Duration;

use orbit_proto::DEFAULT_SERVICE_PORT;

#[derive(Debug, Clone)]
pub struct HostOpts {
    /// Optional directory for durable host state (reserved for file-backed
    /// KV collaborators).
    pub state_path: Option<PathBuf>,
    /// Optional shared cache directory.
    pub cache_path: Option<PathBuf>,
    /// Port used when the host is exposed over a streaming transport.
    pub service_port: u16,
    /// Outbound messages buffered per pin request before a flush is forced.
    pub batch_size: usize,
    /// Idle interval after which a partial batch is flushed anyway.
    pub batch_idle: Duration,
    /// Whether updates already queued when a pin is canceled are still
    /// delivered before the terminal close.
    pub drain_canceled_pins: bool,
    /// Fail `register_app` when a data-model default slot is already taken
    /// instead of replacing it.
    pub strict_app_defaults: bool,
    /// Session inbox queue depth.
    pub inbox_depth: usize,
    /// Session outbox queue depth.
    pub outbox_depth: usize,
    /// Per-pin update queue depth; app pushes block when it fills.
    pub push_depth: usize,
}

impl Default for HostOpts {
    fn default() -> Self {
        Self {
            state_path: None,
            cache_path: None,
            service_port: DEFAULT_SERVICE_PORT,
            batch_size: 16,
            batch_idle: Duration::from_millis(25),
            drain_canceled_pins: false,
            strict_app_defaults: false,
            inbox_depth: 64,
            outbox_depth: 256,
            push_depth: 32,
        }
    }
}
