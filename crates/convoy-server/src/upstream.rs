//! HTTP dispatch: one framed request exchange turned into a real upstream
//! call, response streamed back as frames.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use convoy_core::frame::{self, CHUNK_SIZE, FrameType, RequestHead, ResponseHead};
use convoy_core::headers::HeaderTable;
use http::header::{ACCEPT_LANGUAGE, USER_AGENT};
use http::{Method, Request, Response, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::error::ServerError;

/// Request bodies up to this size are buffered and sent with their exact
/// length; anything larger (or of unknown length) streams.
const MAX_BUFFERED_BODY: usize = 10 * 1024 * 1024;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

// Browser-like defaults keep CDN bot filters from 503ing plain requests.
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36";
const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

type UpstreamBody = BoxBody<Bytes, std::io::Error>;

/// Shared upstream HTTP client. The legacy hyper client never follows
/// redirects and streams bodies in both directions.
#[derive(Clone)]
pub struct UpstreamClient {
    inner: Client<HttpsConnector<HttpConnector>, UpstreamBody>,
}

impl UpstreamClient {
    pub fn new() -> Self {
        let https = match HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder,
            Err(err) => {
                warn!("no native root CA store ({err}), using bundled roots");
                HttpsConnectorBuilder::new().with_webpki_roots()
            }
        };
        let connector = https.https_or_http().enable_http1().build();
        Self {
            inner: Client::builder(TokioExecutor::new()).build(connector),
        }
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle one `RequestStart` exchange: consume body frames through
/// `RequestEnd` on every path, perform the upstream call, frame the response
/// back. Upstream failures become a synthetic 502 so the link stays usable.
pub(crate) async fn dispatch<R, W>(
    reader: &mut R,
    writer: &mut W,
    client: &UpstreamClient,
    start_payload: &[u8],
) -> Result<(), ServerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let head: RequestHead = frame::decode_json(start_payload)?;
    info!("{} {}", head.method, head.absolute_url);

    let content_length = head
        .header
        .get_first("content-length")
        .and_then(|v| v.trim().parse::<usize>().ok());

    let outcome = match content_length {
        Some(n) if n <= MAX_BUFFERED_BODY => {
            let body = read_body_to_end(reader).await?;
            send_buffered(client, &head, body).await
        }
        _ => send_streaming(client, &head, reader).await?,
    };

    match outcome {
        Ok(response) => relay_response(writer, response).await,
        Err(message) => {
            warn!("upstream for {} failed: {message}", head.absolute_url);
            synthetic_bad_gateway(writer, &message).await
        }
    }
}

/// Collect body chunk frames into one buffer, up to `RequestEnd`.
async fn read_body_to_end<R>(reader: &mut R) -> Result<Bytes, ServerError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::new();
    loop {
        let (ty, payload) = frame::read_frame(reader).await?;
        match ty {
            FrameType::RequestBodyChunk => buf.extend_from_slice(&payload),
            FrameType::RequestEnd => return Ok(buf.freeze()),
            other => {
                return Err(ServerError::Protocol(format!(
                    "unexpected frame in request body: {other:?}"
                )));
            }
        }
    }
}

async fn send_buffered(
    client: &UpstreamClient,
    head: &RequestHead,
    body: Bytes,
) -> Result<Response<Incoming>, String> {
    let body = Full::new(body).map_err(|never| match never {}).boxed();
    let request = build_request(head, body)?;
    call_upstream(client, request).await
}

/// Streaming path: the body frames are pumped into the request while the
/// call runs. The pump must reach `RequestEnd` even when the call fails
/// early, or the link desynchronizes.
async fn send_streaming<R>(
    client: &UpstreamClient,
    head: &RequestHead,
    reader: &mut R,
) -> Result<Result<Response<Incoming>, String>, ServerError>
where
    R: AsyncRead + Unpin,
{
    let (chunk_tx, chunk_rx) = mpsc::channel::<Result<Frame<Bytes>, std::io::Error>>(8);
    let body = StreamBody::new(ReceiverStream::new(chunk_rx)).boxed();

    let call = async {
        let request = build_request(head, body)?;
        call_upstream(client, request).await
    };

    let pump = async move {
        loop {
            let (ty, payload) = frame::read_frame(reader).await?;
            match ty {
                FrameType::RequestBodyChunk => {
                    if payload.is_empty() {
                        continue;
                    }
                    // A send error means the upstream stopped reading the
                    // body; the frames still have to be drained.
                    let _ = chunk_tx.send(Ok(Frame::data(payload))).await;
                }
                FrameType::RequestEnd => return Ok(()),
                other => {
                    return Err(ServerError::Protocol(format!(
                        "unexpected frame in request body: {other:?}"
                    )));
                }
            }
        }
    };

    let (outcome, pumped) = tokio::join!(call, pump);
    pumped?;
    Ok(outcome)
}

async fn call_upstream(
    client: &UpstreamClient,
    request: Request<UpstreamBody>,
) -> Result<Response<Incoming>, String> {
    match tokio::time::timeout(UPSTREAM_TIMEOUT, client.inner.request(request)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(err)) => Err(error_chain(&err)),
        Err(_) => Err(format!(
            "upstream timed out after {}s",
            UPSTREAM_TIMEOUT.as_secs()
        )),
    }
}

/// The legacy client's `Display` is terse ("client error (Connect)"); the
/// interesting part lives in the source chain.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn build_request(head: &RequestHead, body: UpstreamBody) -> Result<Request<UpstreamBody>, String> {
    let method = Method::from_bytes(head.method.as_bytes())
        .map_err(|e| format!("bad method {:?}: {e}", head.method))?;
    let uri: Uri = head
        .absolute_url
        .parse()
        .map_err(|e| format!("bad url {:?}: {e}", head.absolute_url))?;
    if uri.scheme().is_none() || uri.authority().is_none() {
        return Err(format!("url {:?} is not absolute", head.absolute_url));
    }

    let mut header = head.header.without_hop_by_hop();
    // The client library derives Host from the URL; a forwarded one could
    // disagree with it.
    header.remove("host");

    let mut builder = Request::builder().method(method).uri(uri);
    for (name, values) in header.iter() {
        if values.is_empty() {
            continue;
        }
        builder = builder.header(name.as_str(), values.join(", "));
    }
    if !header.contains("user-agent") {
        builder = builder.header(USER_AGENT, DEFAULT_USER_AGENT);
    }
    if !header.contains("accept-language") {
        builder = builder.header(ACCEPT_LANGUAGE, DEFAULT_ACCEPT_LANGUAGE);
    }
    builder.body(body).map_err(|e| e.to_string())
}

/// Frame the upstream response back: head, body chunks, end. A body that
/// stalls past the timeout or fails mid-stream is truncated, not fatal.
async fn relay_response<W>(writer: &mut W, response: Response<Incoming>) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin,
{
    let (parts, mut body) = response.into_parts();

    let mut header = HeaderTable::new();
    for (name, value) in &parts.headers {
        match value.to_str() {
            Ok(v) => header.append(name.as_str(), v),
            Err(_) => warn!("dropping non-utf8 value of response header {name}"),
        }
    }
    let head = ResponseHead {
        status_code: parts.status.as_u16(),
        status: parts.status.canonical_reason().unwrap_or("").to_string(),
        header: header.without_hop_by_hop(),
    };
    frame::write_json_frame(writer, FrameType::ResponseStart, &head).await?;

    loop {
        let next = match tokio::time::timeout(UPSTREAM_TIMEOUT, body.frame()).await {
            Ok(next) => next,
            Err(_) => {
                warn!("upstream body stalled, truncating response");
                break;
            }
        };
        match next {
            Some(Ok(piece)) => {
                if let Ok(data) = piece.into_data() {
                    for chunk in data.chunks(CHUNK_SIZE) {
                        frame::write_frame(writer, FrameType::ResponseBodyChunk, chunk).await?;
                    }
                }
                // trailers are dropped
            }
            Some(Err(err)) => {
                warn!("upstream body failed, truncating response: {err}");
                break;
            }
            None => break,
        }
    }
    frame::write_frame(writer, FrameType::ResponseEnd, &[]).await?;
    Ok(())
}

async fn synthetic_bad_gateway<W>(writer: &mut W, message: &str) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin,
{
    let mut header = HeaderTable::new();
    header.append("Content-Type", "text/plain");
    let head = ResponseHead {
        status_code: 502,
        status: "Bad Gateway".to_string(),
        header,
    };
    frame::write_json_frame(writer, FrameType::ResponseStart, &head).await?;
    let body = format!("Bad Gateway: {message}");
    frame::write_frame(writer, FrameType::ResponseBodyChunk, body.as_bytes()).await?;
    frame::write_frame(writer, FrameType::ResponseEnd, &[]).await?;
    Ok(())
}
