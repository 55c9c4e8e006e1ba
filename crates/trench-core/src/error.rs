use thiserror::Error;

/// Errors produced by the trench signaling layer.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("media capability error: {0}")]
    Capability(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for SignalError {
    fn from(e: serde_json::Error) -> Self {
        SignalError::MalformedEnvelope(e.to_string())
    }
}

pub type SignalResult<T> = Result<T, SignalError>;
