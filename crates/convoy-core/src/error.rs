use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unexpected eof on link")]
    UnexpectedEof,
    #[error("frame payload of {len} bytes exceeds the {max} byte cap")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("unknown frame type {0}")]
    UnknownType(u8),
    #[error("link i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame payload: {0}")]
    Json(#[from] serde_json::Error),
}
