//! The single long-lived TCP connection to the offshore server.

use std::time::Duration;

use tokio::io::{BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info, warn};

use crate::error::ClientError;

pub type LinkReader = BufReader<OwnedReadHalf>;
pub type LinkWriter = BufWriter<OwnedWriteHalf>;

const DIAL_ATTEMPTS: u32 = 5;
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Owned exclusively by the worker task; every frame on the wire goes through
/// the one task holding this value, which is what keeps frames of distinct
/// jobs from interleaving without any locking on the I/O halves.
pub struct Link {
    peer: String,
    reader: Option<LinkReader>,
    writer: Option<LinkWriter>,
}

impl Link {
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            reader: None,
            writer: None,
        }
    }

    /// Dial the offshore peer unless already connected: up to five attempts,
    /// 10 s connect timeout each, exponential backoff between them.
    pub async fn ensure(&mut self) -> Result<(), ClientError> {
        if self.reader.is_some() && self.writer.is_some() {
            return Ok(());
        }
        self.reset();

        let mut last_err = String::new();
        for attempt in 0..DIAL_ATTEMPTS {
            match self.dial().await {
                Ok(()) => {
                    info!("offshore link established to {}", self.peer);
                    return Ok(());
                }
                Err(err) => {
                    warn!("dial {} failed (attempt {attempt}): {err}", self.peer);
                    last_err = err.to_string();
                }
            }
            if attempt + 1 < DIAL_ATTEMPTS {
                tokio::time::sleep(BACKOFF_BASE * (1 << attempt)).await;
            }
        }
        Err(ClientError::LinkUnavailable(last_err))
    }

    async fn dial(&mut self) -> std::io::Result<()> {
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(self.peer.as_str()))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out"))??;
        socket2::SockRef::from(&stream).set_keepalive(true)?;
        let (r, w) = stream.into_split();
        self.reader = Some(BufReader::new(r));
        self.writer = Some(BufWriter::new(w));
        Ok(())
    }

    /// Close the socket and clear both halves; the next `ensure` re-dials.
    /// Safe to call repeatedly and before the link ever existed.
    pub fn reset(&mut self) {
        if self.reader.is_some() || self.writer.is_some() {
            debug!("link to {} reset", self.peer);
        }
        self.reader = None;
        self.writer = None;
    }

    /// Both halves, for a request/response exchange.
    pub fn io(&mut self) -> Result<(&mut LinkReader, &mut LinkWriter), ClientError> {
        match (self.reader.as_mut(), self.writer.as_mut()) {
            (Some(r), Some(w)) => Ok((r, w)),
            _ => Err(ClientError::Protocol("link not connected".into())),
        }
    }

    pub fn writer_mut(&mut self) -> Result<&mut LinkWriter, ClientError> {
        self.writer
            .as_mut()
            .ok_or_else(|| ClientError::Protocol("link not connected".into()))
    }

    /// Loan the read half out (the tunnel's server→browser pump runs it in a
    /// separate task); `restore_reader` gives it back on the clean path.
    pub fn take_reader(&mut self) -> Option<LinkReader> {
        self.reader.take()
    }

    pub fn restore_reader(&mut self, reader: LinkReader) {
        self.reader = Some(reader);
    }
}
