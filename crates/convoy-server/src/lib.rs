//! Offshore server: accepts ship links and performs the real origin I/O.

mod error;
mod tunnel;
mod upstream;

use std::net::SocketAddr;

use convoy_core::error::FrameError;
use convoy_core::frame::{self, FrameType};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub use error::ServerError;
pub use upstream::UpstreamClient;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}

/// Bind the link listener and run until the process exits.
pub async fn run(config: ServerConfig) -> std::io::Result<()> {
    let listener = TcpListener::bind(config.listen).await?;
    info!("offshore server listening on {}", listener.local_addr()?);
    serve(listener).await
}

/// Accept ship links, one task per link.
pub async fn serve(listener: TcpListener) -> std::io::Result<()> {
    let client = UpstreamClient::new();
    loop {
        let (stream, peer) = listener.accept().await?;
        info!("ship connected from {peer}");
        let client = client.clone();
        tokio::spawn(async move {
            let (r, w) = stream.into_split();
            match serve_link(BufReader::new(r), BufWriter::new(w), client).await {
                Ok(()) => info!("ship {peer} disconnected"),
                Err(err) => warn!("link to {peer} closed: {err}"),
            }
        });
    }
}

/// Process top-level exchanges on one link until clean EOF. `RequestStart`
/// hands off to the HTTP dispatcher (which consumes through `RequestEnd`);
/// `ConnectOpen` hands off to the tunnel dispatcher (which runs until both
/// directions close). Anything else is a protocol error that drops the link.
pub async fn serve_link<R, W>(
    mut reader: R,
    mut writer: W,
    client: UpstreamClient,
) -> Result<(), ServerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let (ty, payload) = match frame::read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(FrameError::UnexpectedEof) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        match ty {
            FrameType::RequestStart => {
                upstream::dispatch(&mut reader, &mut writer, &client, &payload).await?;
            }
            FrameType::ConnectOpen => {
                writer = tunnel::dispatch(&mut reader, writer, &payload).await?;
            }
            other => {
                return Err(ServerError::Protocol(format!(
                    "unexpected top-level frame: {other:?}"
                )));
            }
        }
    }
}
