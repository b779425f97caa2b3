//! The single task that performs all link I/O on the ship side.

use bytes::Bytes;
use convoy_core::frame::{self, CHUNK_SIZE, FrameType, RequestHead, ResponseHead};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::job::{HttpExchange, HttpJob, Job};
use crate::link::Link;
use crate::tunnel;

/// Capacity of the per-response body channel between the worker and the
/// browser-facing task. Bounded so a slow browser back-pressures the link
/// instead of buffering the whole response.
const BODY_CHANNEL: usize = 32;

/// Dequeue jobs and process them strictly one at a time, in arrival order.
/// Only this task ever touches the link, so frames of distinct jobs cannot
/// interleave.
pub async fn run(mut link: Link, mut jobs: mpsc::Receiver<Job>) {
    while let Some(job) = jobs.recv().await {
        match job {
            Job::Http(job) => process_http(&mut link, job).await,
            Job::Connect(job) => tunnel::process(&mut link, job).await,
        }
    }
    debug!("job queue closed, worker exiting");
}

async fn process_http(link: &mut Link, job: HttpJob) {
    let HttpJob {
        head,
        body,
        respond,
    } = job;

    match open_exchange(link, &head, &body).await {
        Ok(resp_head) => {
            let (chunk_tx, chunk_rx) = mpsc::channel(BODY_CHANNEL);
            let browser_gone = respond
                .send(Ok(HttpExchange {
                    head: resp_head,
                    body: chunk_rx,
                }))
                .is_err();
            // Even with the browser gone the remaining response frames must
            // be drained so the link stays aligned for the next job.
            if let Err(err) = stream_response(link, chunk_tx, browser_gone).await {
                warn!("response stream for {} failed: {err}", head.absolute_url);
                link.reset();
            }
        }
        Err(err) => {
            if err.poisons_link() {
                warn!("exchange for {} failed: {err}", head.absolute_url);
                link.reset();
            } else {
                debug!("exchange for {} failed: {err}", head.absolute_url);
            }
            let _ = respond.send(Err(err));
        }
    }
}

/// Frame the request onto the link and read the response head.
async fn open_exchange(
    link: &mut Link,
    head: &RequestHead,
    body: &Bytes,
) -> Result<ResponseHead, ClientError> {
    link.ensure().await?;
    let (reader, writer) = link.io()?;

    frame::write_json_frame(writer, FrameType::RequestStart, head).await?;
    for chunk in body.chunks(CHUNK_SIZE) {
        frame::write_frame(writer, FrameType::RequestBodyChunk, chunk).await?;
    }
    frame::write_frame(writer, FrameType::RequestEnd, &[]).await?;

    let (ty, payload) = frame::read_frame(reader).await?;
    if ty != FrameType::ResponseStart {
        return Err(ClientError::Protocol(format!(
            "expected response start, got {ty:?}"
        )));
    }
    Ok(frame::decode_json(&payload)?)
}

/// Forward response body frames to the browser task until `ResponseEnd`.
async fn stream_response(
    link: &mut Link,
    chunk_tx: mpsc::Sender<Bytes>,
    mut browser_gone: bool,
) -> Result<(), ClientError> {
    let (reader, _) = link.io()?;
    loop {
        let (ty, payload) = frame::read_frame(reader).await?;
        match ty {
            FrameType::ResponseBodyChunk => {
                if browser_gone || payload.is_empty() {
                    continue;
                }
                if chunk_tx.send(payload).await.is_err() {
                    debug!("browser went away mid-response, draining remaining frames");
                    browser_gone = true;
                }
            }
            FrameType::ResponseEnd => return Ok(()),
            other => {
                return Err(ClientError::Protocol(format!(
                    "unexpected frame in response stream: {other:?}"
                )));
            }
        }
    }
}
