//! The orbit host runtime.
//!
//! A host multiplexes client sessions over duplex message queues, resolves
//! client-declared schemas into planet-local symbol IDs, and drives pinned
//! cell subscriptions through registered apps. See the crate modules:
//!
//! - [`host`]: the process-wide root (app registry, home planet, sessions)
//! - [`planet`]: a content enclosure owning one symbol table
//! - [`registry`]: the per-session type registry
//! - [`session`]: the inbound opcode dispatcher
//! - [`app`]: the capability interface apps implement
//! - [`transport`]: a length-prefix framed TCP bridge onto a session

pub mod app;
pub mod config;
pub mod error;
pub mod host;
pub mod planet;
pub mod registry;
pub mod session;
pub mod transport;

mod pin;

pub use app::{App, AppItem, CellReq, CellSub};
pub use config::HostOpts;
pub use error::{HostError, HostResult};
pub use host::{Host, HOME_PLANET_ID};
pub use planet::Planet;
pub use registry::TypeRegistry;
pub use session::SessionHandle;
