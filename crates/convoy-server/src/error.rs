use convoy_core::error::FrameError;
use thiserror::Error;

/// Anything that reaches the connection loop closes that link. Upstream
/// failures never become a `ServerError`; they turn into synthetic 502
/// response frames so the link survives.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("link protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
