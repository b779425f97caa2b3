//! CONNECT tunnels, offshore side.
//!
//! During a tunnel the link writer moves into a pump task that is the sole
//! frame writer (ConnectDataS2C / ConnectClose); the main task only reads
//! frames and feeds the remote socket. The writer comes back at the close
//! rendezvous so the link can carry the next exchange.

use std::time::Duration;

use convoy_core::frame::{self, CHUNK_SIZE, ConnectReply, ConnectRequest, FrameType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tracing::{debug, info, warn};

use crate::error::ServerError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const CLOSE_RENDEZVOUS: Duration = Duration::from_secs(10);

/// Handle one `ConnectOpen` exchange. Returns the link writer for the next
/// exchange; an error condemns the whole link.
pub(crate) async fn dispatch<R, W>(
    reader: &mut R,
    mut writer: W,
    open_payload: &[u8],
) -> Result<W, ServerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let request: ConnectRequest = frame::decode_json(open_payload)?;
    let target = target_with_default_port(&request.host);
    info!("CONNECT {target}");

    let remote = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            warn!("CONNECT {target} failed: {err}");
            let reply = ConnectReply {
                ok: false,
                error: Some(err.to_string()),
            };
            frame::write_json_frame(&mut writer, FrameType::ConnectOpenResult, &reply).await?;
            return Ok(writer);
        }
        Err(_) => {
            warn!("CONNECT {target} timed out");
            let reply = ConnectReply {
                ok: false,
                error: Some(format!("connect to {target} timed out")),
            };
            frame::write_json_frame(&mut writer, FrameType::ConnectOpenResult, &reply).await?;
            return Ok(writer);
        }
    };
    let reply = ConnectReply {
        ok: true,
        error: None,
    };
    frame::write_json_frame(&mut writer, FrameType::ConnectOpenResult, &reply).await?;

    let (remote_r, mut remote_w) = remote.into_split();
    let mut pump = tokio::spawn(pump_s2c(remote_r, writer));

    // Ship → origin: frames in, raw bytes out.
    let c2s = async {
        loop {
            let (ty, payload) = frame::read_frame(reader).await?;
            match ty {
                FrameType::ConnectDataC2S => {
                    if payload.is_empty() {
                        continue;
                    }
                    // A dead remote shows up as EOF on its read side and the
                    // pump closes the direction; keep draining frames here.
                    if let Err(err) = remote_w.write_all(&payload).await {
                        debug!("remote write failed mid-tunnel: {err}");
                    }
                }
                FrameType::ConnectClose => {
                    // Ship side is done sending; half-close toward the origin.
                    let _ = remote_w.shutdown().await;
                    return Ok::<_, ServerError>(());
                }
                other => {
                    return Err(ServerError::Protocol(format!(
                        "unexpected frame in tunnel: {other:?}"
                    )));
                }
            }
        }
    };
    let c2s_result = c2s.await;

    let (writer, s2c_result) = match tokio::time::timeout(CLOSE_RENDEZVOUS, &mut pump).await {
        Ok(Ok(pair)) => pair,
        Ok(Err(join_err)) => {
            return Err(ServerError::Protocol(format!(
                "tunnel pump failed: {join_err}"
            )));
        }
        Err(_) => {
            // Outstanding origin bytes are dropped; the writer is gone with
            // the aborted task, so the link cannot continue.
            pump.abort();
            return Err(ServerError::Protocol(
                "tunnel close rendezvous timed out".to_string(),
            ));
        }
    };
    c2s_result?;
    s2c_result?;
    info!("CONNECT {target} closed");
    Ok(writer)
}

/// Port 443 unless the ship named one explicitly.
fn target_with_default_port(host: &str) -> String {
    if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:443")
    }
}

/// Origin → ship: raw bytes in, frames out. EOF or a failed read closes the
/// direction with a `ConnectClose` frame.
async fn pump_s2c<W>(mut remote: OwnedReadHalf, mut writer: W) -> (W, Result<(), ServerError>)
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match remote.read(&mut buf).await {
            Ok(0) | Err(_) => {
                let result = frame::write_frame(&mut writer, FrameType::ConnectClose, &[])
                    .await
                    .map_err(Into::into);
                return (writer, result);
            }
            Ok(n) => {
                if let Err(err) =
                    frame::write_frame(&mut writer, FrameType::ConnectDataS2C, &buf[..n]).await
                {
                    return (writer, Err(err.into()));
                }
            }
        }
    }
}
