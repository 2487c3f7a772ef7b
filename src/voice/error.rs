use thiserror::Error;

/// Failures reported by `InterviewSession::start_streaming` and the pipeline.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("precondition failed: {0}")]
    PreconditionFailure(String),

    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("audio stream error: {0}")]
    Audio(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (status {s})")).unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("send failed{}: {message}", status_suffix(.status))]
    SendFailed { status: Option<u16>, message: String },

    #[error("event channel lost: {0}")]
    ConnectionLost(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// A malformed inbound frame. Logged and dropped, never fatal.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("PCM16 payload has odd byte length {0}")]
    OddLength(usize),

    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported mime type: {0}")]
    UnsupportedMime(String),

    #[error("frame is neither media nor a turn signal")]
    UnknownFrame,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("silence threshold must be in (0, 1], got {0}")]
    Threshold(f32),

    #[error("trailing window ({trailing_ms}ms) exceeds energy history ({history_ms}ms)")]
    TrailingWindow { trailing_ms: u64, history_ms: u64 },

    #[error("base url must start with http:// or https://, got {0:?}")]
    BaseUrl(String),
}
