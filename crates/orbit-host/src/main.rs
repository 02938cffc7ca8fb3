//! The orbit host daemon: serve the framed TCP transport until interrupted.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use orbit_host::{transport, Host, HostOpts};
use orbit_store::MemKv;

#[derive(Parser, Debug)]
#[command(name = "orbit-host", about = "Realtime cell-content host")]
struct Args {
    /// Address to listen on; defaults to 0.0.0.0 on the service port.
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let opts = HostOpts::default();
    let addr = args
        .listen
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], opts.service_port)));

    let host = Host::start(Arc::new(MemKv::new()), opts)?;
    {
        let host = host.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                host.shutdown();
            }
        });
    }
    transport::serve(host, addr).await?;
    Ok(())
}
