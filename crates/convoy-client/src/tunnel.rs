//! CONNECT tunnels, ship side.
//!
//! While a tunnel runs, the worker stays bound to it: the link's read half is
//! loaned to a pump task that copies `ConnectDataS2C` payloads to the browser,
//! and the worker itself turns browser bytes into `ConnectDataC2S` frames.
//! That keeps a single frame writer per direction with no locking.

use std::time::Duration;

use bytes::Bytes;
use convoy_core::frame::{self, CHUNK_SIZE, ConnectReply, ConnectRequest, FrameType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::front;
use crate::job::ConnectJob;
use crate::link::{Link, LinkReader};

const CLOSE_RENDEZVOUS: Duration = Duration::from_secs(10);

/// Append the default TLS port when the browser sent a bare host.
pub(crate) fn normalize_target(target: &str) -> String {
    if target.contains(':') {
        target.to_string()
    } else {
        format!("{target}:443")
    }
}

pub(crate) async fn process(link: &mut Link, job: ConnectJob) {
    let ConnectJob {
        target,
        mut stream,
        leftover,
        done,
    } = job;
    let target = normalize_target(&target);

    if let Err(err) = open(link, &target).await {
        if err.poisons_link() {
            warn!("tunnel open for {target} failed: {err}");
            link.reset();
        } else {
            debug!("tunnel open for {target} refused: {err}");
        }
        let _ = front::write_simple(
            &mut stream,
            502,
            "Bad Gateway",
            &format!("CONNECT failed: {err}"),
        )
        .await;
        let _ = done.send(Err(err));
        return;
    }

    // The browser expects these literal bytes before tunnel data flows.
    let established = async {
        stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        stream.flush().await
    };
    if let Err(err) = established.await {
        debug!("browser gone before tunnel start for {target}: {err}");
        if let Err(err) = close_unused(link).await {
            warn!("tunnel teardown for {target} failed: {err}");
            link.reset();
        }
        let _ = done.send(Err(err.into()));
        return;
    }

    let result = run_tunnel(link, stream, leftover).await;
    match &result {
        Ok(()) => info!("tunnel to {target} closed"),
        Err(err) => {
            warn!("tunnel to {target} failed: {err}");
            link.reset();
        }
    }
    let _ = done.send(result);
}

/// ConnectOpen / ConnectOpenResult handshake.
async fn open(link: &mut Link, target: &str) -> Result<(), ClientError> {
    link.ensure().await?;
    let (reader, writer) = link.io()?;

    let request = ConnectRequest {
        host: target.to_string(),
    };
    frame::write_json_frame(writer, FrameType::ConnectOpen, &request).await?;

    let (ty, payload) = frame::read_frame(reader).await?;
    if ty != FrameType::ConnectOpenResult {
        return Err(ClientError::Protocol(format!(
            "expected connect open result, got {ty:?}"
        )));
    }
    let reply: ConnectReply = frame::decode_json(&payload)?;
    if !reply.ok {
        return Err(ClientError::TunnelOpenFailed(
            reply.error.unwrap_or_else(|| "unknown".to_string()),
        ));
    }
    Ok(())
}

/// Close a tunnel that was opened but never used: send our close, then drain
/// the server direction until its close so the link stays frame-aligned.
async fn close_unused(link: &mut Link) -> Result<(), ClientError> {
    let (reader, writer) = link.io()?;
    frame::write_frame(writer, FrameType::ConnectClose, &[]).await?;
    let drain = async {
        loop {
            let (ty, _) = frame::read_frame(reader).await?;
            match ty {
                FrameType::ConnectDataS2C => continue,
                FrameType::ConnectClose => return Ok(()),
                other => {
                    return Err(ClientError::Protocol(format!(
                        "unexpected frame draining tunnel: {other:?}"
                    )));
                }
            }
        }
    };
    tokio::time::timeout(CLOSE_RENDEZVOUS, drain)
        .await
        .map_err(|_| ClientError::Protocol("tunnel close rendezvous timed out".to_string()))?
}

async fn run_tunnel(link: &mut Link, stream: TcpStream, leftover: Bytes) -> Result<(), ClientError> {
    // Bytes the browser sent on the heels of the CONNECT head (typically the
    // TLS ClientHello) go out before anything else.
    if !leftover.is_empty() {
        let writer = link.writer_mut()?;
        frame::write_frame(writer, FrameType::ConnectDataC2S, &leftover).await?;
    }

    let (mut browser_r, browser_w) = stream.into_split();
    let Some(reader) = link.take_reader() else {
        return Err(ClientError::Protocol("link reader unavailable".to_string()));
    };
    let mut pump = tokio::spawn(pump_s2c(reader, browser_w));

    let c2s_result = pump_c2s(link, &mut browser_r).await;

    match tokio::time::timeout(CLOSE_RENDEZVOUS, &mut pump).await {
        Ok(Ok((reader, s2c_result))) => {
            link.restore_reader(reader);
            c2s_result?;
            s2c_result
        }
        Ok(Err(join_err)) => Err(ClientError::Protocol(format!(
            "tunnel pump failed: {join_err}"
        ))),
        Err(_) => {
            // Outstanding bytes are abandoned rather than re-synchronized;
            // the reader half is gone with the aborted task, so the caller
            // resets the link.
            pump.abort();
            Err(ClientError::Protocol(
                "tunnel close rendezvous timed out".to_string(),
            ))
        }
    }
}

/// Link frames → browser socket. Runs detached; always hands the link reader
/// back so the clean path can reuse the link.
async fn pump_s2c<W>(mut reader: LinkReader, mut browser: W) -> (LinkReader, Result<(), ClientError>)
where
    W: AsyncWrite + Unpin,
{
    let mut browser_gone = false;
    let result = loop {
        match frame::read_frame(&mut reader).await {
            Ok((FrameType::ConnectDataS2C, payload)) => {
                if browser_gone || payload.is_empty() {
                    continue;
                }
                if let Err(err) = write_all_flush(&mut browser, &payload).await {
                    // Keep draining frames so the close handshake still
                    // lines up even though the browser is gone.
                    debug!("browser write failed mid-tunnel: {err}");
                    browser_gone = true;
                }
            }
            Ok((FrameType::ConnectClose, _)) => break Ok(()),
            Ok((other, _)) => {
                break Err(ClientError::Protocol(format!(
                    "unexpected frame in tunnel: {other:?}"
                )));
            }
            Err(err) => break Err(err.into()),
        }
    };
    (reader, result)
}

/// Browser socket → link frames. Browser EOF (or a failed read) becomes a
/// `ConnectClose` frame.
async fn pump_c2s<R>(link: &mut Link, browser: &mut R) -> Result<(), ClientError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match browser.read(&mut buf).await {
            Ok(n) => n,
            Err(err) => {
                debug!("browser read failed mid-tunnel: {err}");
                0
            }
        };
        let writer = link.writer_mut()?;
        if n == 0 {
            frame::write_frame(writer, FrameType::ConnectClose, &[]).await?;
            return Ok(());
        }
        frame::write_frame(writer, FrameType::ConnectDataC2S, &buf[..n]).await?;
    }
}

async fn write_all_flush<W>(w: &mut W, data: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(data).await?;
    w.flush().await
}
