use convoy_core::error::FrameError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("offshore link unavailable: {0}")]
    LinkUnavailable(String),
    #[error("link protocol error: {0}")]
    Protocol(String),
    #[error("tunnel open refused: {0}")]
    TunnelOpenFailed(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Whether the link can no longer be trusted to be frame-aligned. Such
    /// errors make the worker reset the link so the next job re-dials.
    pub fn poisons_link(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Frame(_) | Self::Io(_))
    }
}
