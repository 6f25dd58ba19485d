use thiserror::Error;

/// Failures surfaced by the streaming manager.
///
/// Socket and protocol problems are recovered locally and delivered as one of
/// these kinds, either as a rejected `connect`/`warmup` or through the event
/// stream. Audio forwarding never produces one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamingError {
    #[error("no session start from server within {0} ms")]
    ConnectionTimeout(u64),
    #[error("server error: {0}")]
    Protocol(String),
    #[error("connection lost ({code}): {reason}")]
    ConnectionLost { code: u16, reason: String },
    #[error("warmup failed: {0}")]
    WarmupFailed(String),
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),
    #[error("a session is already connecting or active")]
    AlreadyConnected,
    #[error("a streaming token is required")]
    MissingToken,
    #[error("operation cancelled by disconnect")]
    Cancelled,
}

impl StreamingError {
    /// Close code reported when the socket ended without a close frame.
    pub const ABNORMAL_CLOSE: u16 = 1006;

    pub fn is_connection_loss(&self) -> bool {
        matches!(self, StreamingError::ConnectionLost { .. })
    }
}
