//! Browser work items handed to the link worker.

use bytes::Bytes;
use convoy_core::frame::{RequestHead, ResponseHead};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::error::ClientError;

/// One browser-originated unit of work. A job holds the link exclusively
/// from its first frame until its exchange completes.
pub enum Job {
    Http(HttpJob),
    Connect(ConnectJob),
}

/// A fully buffered HTTP request, ready to be framed onto the link.
pub struct HttpJob {
    /// Hop-by-hop headers already stripped, target already absolute.
    pub head: RequestHead,
    pub body: Bytes,
    /// Fires exactly once: either the decoded response head plus its body
    /// channel, or the error that failed the job.
    pub respond: oneshot::Sender<Result<HttpExchange, ClientError>>,
}

/// The successful half of an HTTP job handed back to the front-end.
pub struct HttpExchange {
    pub head: ResponseHead,
    pub body: mpsc::Receiver<Bytes>,
}

/// A CONNECT tunnel request. The browser connection moves into the job: the
/// worker writes the established (or failure) reply itself and then owns the
/// socket for the tunnel's whole life.
pub struct ConnectJob {
    /// Authority as the browser sent it; the worker appends `:443` when the
    /// port is missing.
    pub target: String,
    pub stream: TcpStream,
    /// Bytes the browser sent together with the CONNECT head (typically the
    /// TLS ClientHello); they must reach the origin first.
    pub leftover: Bytes,
    /// Fires exactly once when the tunnel ends, however it ends.
    pub done: oneshot::Sender<Result<(), ClientError>>,
}
