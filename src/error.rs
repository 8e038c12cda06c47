use http::StatusCode;
use std::io;

/// Boxed error type used for errors of inner bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error produced while reading a decompressed request body.
#[derive(Debug, thiserror::Error)]
pub enum DecompressError {
    /// The body is not a valid LZ4 frame.
    #[error("malformed lz4 request body: {0}")]
    Corrupt(#[source] io::Error),

    /// The body ended before the LZ4 frame was complete.
    #[error("lz4 request body ended mid-frame")]
    Truncated,

    /// Reading the underlying request body failed.
    #[error("failed to read request body: {0}")]
    Body(#[source] BoxError),
}

impl DecompressError {
    /// Status code a handler should answer with when it hits this error.
    ///
    /// Every variant is the client's fault, so all map to `400 Bad Request`.
    pub fn status(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }
}
