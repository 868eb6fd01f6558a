use thiserror::Error;

/// Core error types for weightline
#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsupported data type: {0}")]
    UnsupportedDType(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Ambiguous vocabulary encoding: {0}")]
    AmbiguousEncoding(String),

    #[error("Missing field: {0}")]
    MissingField(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid model format: {0}")]
    InvalidFormat(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether a family profile may log this and fall back to defaults.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::MissingField(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
