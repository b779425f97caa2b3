//! Browser-facing HTTP/1.1 proxy front-end.
//!
//! One task per accepted browser connection, with a small hand-rolled head
//! parser on top of `httparse`. Parsing the head ourselves keeps header
//! names exactly as the browser cased them — the link wire format preserves
//! casing, and an HTTP library's normalized `HeaderMap` would lose it. Each
//! request becomes a job on the bounded queue; the task then parks on the
//! job's completion signal while the worker drives the link.

use std::net::SocketAddr;

use bytes::Bytes;
use convoy_core::frame::RequestHead;
use convoy_core::headers::HeaderTable;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::job::{ConnectJob, HttpExchange, HttpJob, Job};

/// Upper bound on a request head; anything larger is answered with 400.
const MAX_HEAD_BYTES: usize = 32 * 1024;
const MAX_HEADERS: usize = 64;

/// One parsed request head, header casing exactly as the browser sent it.
#[derive(Debug)]
struct ParsedRequest {
    method: String,
    target: String,
    header: HeaderTable,
    /// HTTP minor version: 0 for 1.0, 1 for 1.1.
    version: u8,
    head_len: usize,
}

pub(crate) async fn serve_browser(mut stream: TcpStream, peer: SocketAddr, jobs: mpsc::Sender<Job>) {
    // Carry-over buffer: bytes read past the current head or body belong to
    // the next request (or, for CONNECT, to the tunnel).
    let mut buf = Vec::with_capacity(4096);
    loop {
        let parsed = match read_request(&mut stream, &mut buf).await {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return,
            Err(err) => {
                debug!("browser {peer}: {err}");
                let _ =
                    write_simple(&mut stream, 400, "Bad Request", &format!("Bad Request: {err}"))
                        .await;
                return;
            }
        };
        buf.drain(..parsed.head_len);

        if parsed.method.eq_ignore_ascii_case("CONNECT") {
            handle_connect(stream, buf, parsed, peer, jobs).await;
            return;
        }

        match handle_http(&mut stream, &mut buf, &parsed, peer, &jobs).await {
            Ok(true) => continue,
            Ok(false) => return,
            Err(err) => {
                debug!("browser {peer} connection ended: {err}");
                return;
            }
        }
    }
}

/// Read until one full request head is buffered. `Ok(None)` is a clean EOF
/// between requests.
async fn read_request(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<ParsedRequest>> {
    let mut tmp = [0u8; 4096];
    loop {
        if let Some(parsed) = parse_request(buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?
        {
            return Ok(Some(parsed));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&tmp[..n]);
    }
}

/// `Ok(None)` means the head is still incomplete.
fn parse_request(buf: &[u8]) -> Result<Option<ParsedRequest>, httparse::Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let head_len = match req.parse(buf)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(None),
    };
    let mut header = HeaderTable::new();
    for h in req.headers.iter() {
        header.append(h.name, String::from_utf8_lossy(h.value).into_owned());
    }
    Ok(Some(ParsedRequest {
        method: req.method.unwrap_or("").to_string(),
        target: req.path.unwrap_or("").to_string(),
        header,
        version: req.version.unwrap_or(1),
        head_len,
    }))
}

async fn handle_http(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
    parsed: &ParsedRequest,
    peer: SocketAddr,
    jobs: &mpsc::Sender<Job>,
) -> std::io::Result<bool> {
    info!("{peer} {} {}", parsed.method, parsed.target);

    if parsed.header.contains("transfer-encoding") {
        // A body of undeclared length cannot be framed into a buffered job,
        // and skipping it would desynchronize the connection.
        write_simple(
            stream,
            411,
            "Length Required",
            "Length Required: request bodies must carry Content-Length",
        )
        .await?;
        return Ok(false);
    }

    let body = read_body(stream, buf, parsed).await?;

    let (respond, respond_rx) = oneshot::channel();
    let job = Job::Http(HttpJob {
        head: RequestHead {
            method: parsed.method.clone(),
            absolute_url: absolute_url(&parsed.target, &parsed.header),
            header: parsed.header.without_hop_by_hop(),
        },
        body,
        respond,
    });
    match jobs.try_send(job) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("job queue full, rejecting browser request");
            write_simple(
                stream,
                503,
                "Service Unavailable",
                "Service Unavailable: proxy queue is full",
            )
            .await?;
            return Ok(true);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            write_simple(stream, 502, "Bad Gateway", "Bad Gateway: proxy worker unavailable")
                .await?;
            return Ok(false);
        }
    }

    let exchange = match respond_rx.await {
        Ok(Ok(exchange)) => exchange,
        Ok(Err(err)) => {
            write_simple(stream, 502, "Bad Gateway", &format!("Bad Gateway: {err}")).await?;
            return Ok(true);
        }
        Err(_) => {
            write_simple(stream, 502, "Bad Gateway", "Bad Gateway: proxy worker unavailable")
                .await?;
            return Ok(false);
        }
    };

    let browser_close = parsed
        .header
        .get_first("connection")
        .is_some_and(|v| v.eq_ignore_ascii_case("close"));
    let reusable = write_exchange(stream, &parsed.method, exchange).await?;
    Ok(reusable && parsed.version >= 1 && !browser_close)
}

/// GET and HEAD carry no body; otherwise exactly `Content-Length` bytes are
/// read before the job is enqueued. Bodies of undeclared length are not
/// proxied.
async fn read_body(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
    parsed: &ParsedRequest,
) -> std::io::Result<Bytes> {
    if matches!(parsed.method.as_str(), "GET" | "HEAD") {
        return Ok(Bytes::new());
    }
    let Some(len) = parsed
        .header
        .get_first("content-length")
        .and_then(|v| v.trim().parse::<usize>().ok())
    else {
        return Ok(Bytes::new());
    };

    let mut body = Vec::with_capacity(len.min(1024 * 1024));
    let take = len.min(buf.len());
    body.extend_from_slice(&buf[..take]);
    buf.drain(..take);

    let mut tmp = [0u8; 4096];
    while body.len() < len {
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        let want = (len - body.len()).min(n);
        body.extend_from_slice(&tmp[..want]);
        if want < n {
            // Pipelined bytes beyond the body belong to the next request.
            buf.extend_from_slice(&tmp[want..n]);
        }
    }
    Ok(body.into())
}

async fn handle_connect(
    stream: TcpStream,
    leftover: Vec<u8>,
    parsed: ParsedRequest,
    peer: SocketAddr,
    jobs: mpsc::Sender<Job>,
) {
    info!("{peer} CONNECT {}", parsed.target);

    // The whole connection moves into the job: the worker answers the
    // browser itself once the offshore peer accepts or refuses the tunnel.
    let (done, done_rx) = oneshot::channel();
    let job = Job::Connect(ConnectJob {
        target: parsed.target,
        stream,
        leftover: Bytes::from(leftover),
        done,
    });
    match jobs.try_send(job) {
        Ok(()) => {
            if let Ok(Err(err)) = done_rx.await {
                debug!("{peer} CONNECT failed: {err}");
            }
        }
        Err(err) => {
            let (status, reason, message, job) = match err {
                mpsc::error::TrySendError::Full(job) => {
                    warn!("job queue full, rejecting browser request");
                    (503, "Service Unavailable", "Service Unavailable: proxy queue is full", job)
                }
                mpsc::error::TrySendError::Closed(job) => {
                    (502, "Bad Gateway", "Bad Gateway: proxy worker unavailable", job)
                }
            };
            if let Job::Connect(mut job) = job {
                let _ = write_simple(&mut job.stream, status, reason, message).await;
            }
        }
    }
}

/// Write the framed response back: status line with the wire's status text,
/// headers exactly as they crossed the link, then the streamed body chunks,
/// each flushed. Returns whether the connection can carry another request.
async fn write_exchange(
    stream: &mut TcpStream,
    method: &str,
    exchange: HttpExchange,
) -> std::io::Result<bool> {
    let HttpExchange { head, mut body } = exchange;

    let content_length = head
        .header
        .get_first("content-length")
        .and_then(|v| v.trim().parse::<u64>().ok());
    let bodyless = method.eq_ignore_ascii_case("HEAD")
        || head.status_code < 200
        || head.status_code == 204
        || head.status_code == 304;
    // Without a declared length the body can only be delimited by closing.
    let close_after = !bodyless && content_length.is_none();

    let mut head_bytes = format!("HTTP/1.1 {} {}\r\n", head.status_code, head.status).into_bytes();
    for (name, values) in head.header.iter() {
        for value in values {
            head_bytes.extend_from_slice(name.as_bytes());
            head_bytes.extend_from_slice(b": ");
            head_bytes.extend_from_slice(value.as_bytes());
            head_bytes.extend_from_slice(b"\r\n");
        }
    }
    if close_after {
        head_bytes.extend_from_slice(b"Connection: close\r\n");
    }
    head_bytes.extend_from_slice(b"\r\n");
    stream.write_all(&head_bytes).await?;
    stream.flush().await?;

    let mut written = 0u64;
    while let Some(chunk) = body.recv().await {
        if bodyless {
            continue;
        }
        stream.write_all(&chunk).await?;
        stream.flush().await?;
        written += chunk.len() as u64;
    }
    if close_after {
        return Ok(false);
    }
    if !bodyless && content_length.is_some_and(|n| n != written) {
        // Truncated upstream; the browser cannot be resynchronized.
        return Ok(false);
    }
    Ok(true)
}

pub(crate) async fn write_simple(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    body: &str,
) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body.as_bytes()).await?;
    stream.flush().await
}

/// Proxies receive absolute request targets; anything else is rebuilt from
/// the Host header, plain http (https origins go through CONNECT).
fn absolute_url(target: &str, header: &HeaderTable) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        return target.to_string();
    }
    let host = header.get_first("host").unwrap_or("localhost");
    format!("http://{host}{target}")
}
