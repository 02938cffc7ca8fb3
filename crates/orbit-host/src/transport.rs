//! Length-prefix framed TCP bridge onto host sessions.
//!
//! Each accepted connection gets a fresh session plus one reader and one
//! writer task: frames in, through the session dispatcher, frames out. The
//! accept loop drains on the host's shutdown signal.

use std::net::SocketAddr;
use std::sync::Arc;

use orbit_proto::{decode_body, encode_frame, MAX_FRAME_LEN};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::HostResult;
use crate::host::Host;

pub async fn serve(host: Arc<Host>, addr: SocketAddr) -> HostResult<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_listener(host, listener).await
}

/// Serve an already-bound listener (lets callers bind port 0 and read the
/// ephemeral address back).
pub async fn serve_listener(host: Arc<Host>, listener: TcpListener) -> HostResult<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "orbit host listening");
    }
    let mut shutdown = host.subscribe_shutdown();
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("shutdown signal received");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let host = host.clone();
                tokio::spawn(async move {
                    tracing::debug!(%peer, "connection accepted");
                    handle_conn(host, stream).await;
                    tracing::debug!(%peer, "connection closed");
                });
            }
        }
    }
    Ok(())
}

async fn handle_conn(host: Arc<Host>, stream: TcpStream) {
    let session = host.start_session();
    let (inbox, mut outbox) = session.into_endpoint();
    let (mut rd, mut wr) = stream.into_split();

    let reader = tokio::spawn(async move {
        let mut len_buf = [0u8; 4];
        loop {
            if rd.read_exact(&mut len_buf).await.is_err() {
                break;
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            if len > MAX_FRAME_LEN {
                tracing::debug!(len, "oversized frame; closing");
                break;
            }
            let mut body = vec![0u8; len];
            if rd.read_exact(&mut body).await.is_err() {
                break;
            }
            match decode_body(&body) {
                Ok(msgs) => {
                    for msg in msgs {
                        if inbox.send(msg).await.is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    tracing::debug!(error = %err, "undecodable frame; closing");
                    break;
                }
            }
        }
        // Dropping the inbox sender closes the session.
    });

    let writer = tokio::spawn(async move {
        let mut buf = Vec::with_capacity(1024);
        while let Some(msg) = outbox.recv().await {
            buf.clear();
            if let Err(err) = encode_frame(&msg, &mut buf) {
                tracing::warn!(error = %err, "dropping unencodable outbound message");
                continue;
            }
            if wr.write_all(&buf).await.is_err() {
                break;
            }
        }
        let _ = wr.shutdown().await;
    });

    let _ = tokio::join!(reader, writer);
}
