use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Source unreachable or timed out.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A single frame could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Model or embedding failure.
    #[error("Recognition error: {0}")]
    Recognition(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Job error: {0}")]
    Job(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("In use: {0}")]
    InUse(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Io(format!("Image processing failed: {}", err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Look for a domain error inside an `anyhow` chain.
pub fn domain_error(err: &anyhow::Error) -> Option<&Error> {
    err.chain().find_map(|cause| cause.downcast_ref::<Error>())
}
