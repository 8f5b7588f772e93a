//! Error types for lanewatch

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while polling lanes or maintaining the cache
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client construction error
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    /// Compression failed
    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    /// Decompression failed
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),

    /// A cached payload could not be decoded back to text
    #[error("Cached payload is not valid UTF-8: {0}")]
    CachedPayloadEncoding(#[from] std::string::FromUtf8Error),

    /// The storage backend refused a write (quota exceeded or I/O)
    #[error("Storage backend write failed for key {key}: {reason}")]
    StorageWrite { key: String, reason: String },

    /// A payload did not have the shape the interpreter expected
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}
