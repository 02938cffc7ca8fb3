//! Process-global embedding boundary.
//!
//! Embedders that cannot host an async runtime drive the core through five
//! blocking calls: [`session_begin`], [`push_msg`], [`wait_on_msg`],
//! [`session_end`], and [`shutdown`]. A single process-wide session slot is
//! all the core needs; the session owns a private tokio runtime and speaks
//! the same length-prefixed frames as the TCP transport.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use orbit_host::{Host, HostError, HostOpts, SessionHandle};
use orbit_proto::{decode_frame, encode_frame, Msg, WireError};
use orbit_store::MemKv;
use tokio::sync::mpsc;

pub type EmbedResult<T> = Result<T, EmbedError>;

#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("an embedded session is already active")]
    SessionActive,
    #[error("no active embedded session")]
    NoSession,
    #[error("invalid session token")]
    BadToken,
    #[error("embedding layer is shut down")]
    ShuttingDown,
    #[error("session disconnected")]
    Disconnected,
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("host error: {0}")]
    Host(#[from] HostError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque handle returned by [`session_begin`]; non-zero while valid.
pub type SessionToken = u64;

struct LibSession {
    token: SessionToken,
    host: Arc<Host>,
    inbox: mpsc::Sender<Msg>,
    outbox: Arc<Mutex<mpsc::Receiver<Msg>>>,
    // Dropped last; keeps the session and pin tasks alive.
    _runtime: tokio::runtime::Runtime,
}

static SLOT: Mutex<Option<LibSession>> = Mutex::new(None);
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);
static SHUT_DOWN: AtomicBool = AtomicBool::new(false);

/// Start the process-wide embedded session. Only one may exist; a second
/// call without an intervening [`session_end`] fails with `SessionActive`.
pub fn session_begin(
    user_id: &str,
    data_path: &str,
    cache_path: &str,
) -> EmbedResult<SessionToken> {
    if SHUT_DOWN.load(Ordering::SeqCst) {
        return Err(EmbedError::ShuttingDown);
    }
    let mut slot = SLOT.lock().unwrap();
    if slot.is_some() {
        return Err(EmbedError::SessionActive);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;

    let opts = HostOpts {
        state_path: non_empty_path(data_path),
        cache_path: non_empty_path(cache_path),
        ..HostOpts::default()
    };
    let host = Host::start(Arc::new(MemKv::new()), opts)?;

    let session: SessionHandle = {
        let _guard = runtime.enter();
        host.start_session()
    };
    tracing::info!(user_id, session = session.session_id(), "embedded session started");
    let (inbox, outbox) = session.into_endpoint();

    let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    *slot = Some(LibSession {
        token,
        host,
        inbox,
        outbox: Arc::new(Mutex::new(outbox)),
        _runtime: runtime,
    });
    Ok(token)
}

/// Tear down the embedded session. The slot is free for a new
/// [`session_begin`] afterwards.
pub fn session_end(token: SessionToken) -> EmbedResult<()> {
    let taken = {
        let mut slot = SLOT.lock().unwrap();
        match slot.as_ref() {
            None => return Err(EmbedError::NoSession),
            Some(session) if session.token != token => return Err(EmbedError::BadToken),
            Some(_) => slot.take(),
        }
    };
    if let Some(session) = taken {
        session.host.shutdown();
        // Dropping the session drops its inbox and runtime, closing every
        // pin and waking any blocked wait_on_msg with Disconnected.
    }
    Ok(())
}

/// Feed one inbound frame (length prefix included) to the session.
pub fn push_msg(frame: &[u8]) -> EmbedResult<()> {
    let inbox = {
        let slot = SLOT.lock().unwrap();
        match slot.as_ref() {
            Some(session) => session.inbox.clone(),
            None => return Err(current_absence()),
        }
    };
    let (msgs, _) = decode_frame(frame)?;
    for msg in msgs {
        inbox
            .blocking_send(msg)
            .map_err(|_| EmbedError::Disconnected)?;
    }
    Ok(())
}

/// Block until the session emits an outbound message, encoding it as a frame
/// into `out`. Fails with `Disconnected` once the session is gone.
pub fn wait_on_msg(out: &mut Vec<u8>) -> EmbedResult<()> {
    let outbox = {
        let slot = SLOT.lock().unwrap();
        match slot.as_ref() {
            Some(session) => session.outbox.clone(),
            None => return Err(current_absence()),
        }
    };
    let mut outbox = outbox.lock().unwrap();
    let msg = outbox.blocking_recv().ok_or(EmbedError::Disconnected)?;
    out.clear();
    encode_frame(&msg, out)?;
    Ok(())
}

/// Terminal: end any active session and refuse all further calls.
pub fn shutdown() {
    SHUT_DOWN.store(true, Ordering::SeqCst);
    let taken = SLOT.lock().unwrap().take();
    if let Some(session) = taken {
        session.host.shutdown();
    }
}

fn current_absence() -> EmbedError {
    if SHUT_DOWN.load(Ordering::SeqCst) {
        EmbedError::ShuttingDown
    } else {
        EmbedError::NoSession
    }
}

fn non_empty_path(path: &str) -> Option<PathBuf> {
    if path.is_empty() {
        None
    } else {
        Some(PathBuf::from(path))
    }
}
