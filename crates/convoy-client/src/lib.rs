//! Ship-side proxy: an ordinary HTTP/1.1 proxy for browsers whose every job
//! crosses exactly one long-lived TCP link to the offshore server.

mod error;
mod front;
mod job;
mod link;
mod tunnel;
mod worker;

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;

pub use error::ClientError;
use link::Link;

/// Queue capacity: back-pressure and a rough admission-control ceiling.
/// Overflow is answered with 503.
const QUEUE_CAPACITY: usize = 128;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Browser-facing listen address.
    pub listen: SocketAddr,
    /// Offshore server `host:port`.
    pub server: String,
}

/// Bind the browser listener and run until the process exits.
pub async fn run(config: ClientConfig) -> std::io::Result<()> {
    let listener = TcpListener::bind(config.listen).await?;
    info!(
        "ship proxy listening on {}, offshore {}",
        listener.local_addr()?,
        config.server
    );
    serve(listener, config.server).await
}

/// Accept browser connections and funnel their jobs through the single
/// worker task that owns the link.
pub async fn serve(listener: TcpListener, server: String) -> std::io::Result<()> {
    let (jobs_tx, jobs_rx) = mpsc::channel(QUEUE_CAPACITY);
    tokio::spawn(worker::run(Link::new(server), jobs_rx));

    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(front::serve_browser(stream, peer, jobs_tx.clone()));
    }
}
