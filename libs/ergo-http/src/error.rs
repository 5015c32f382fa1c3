use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Boxed error used at the transport and serialization seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Classification of URL validation failures.
///
/// Provides programmatic matching for different failure modes without
/// relying on unstable error message strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidUriKind {
    /// No URL was given at all
    Empty,
    /// URL could not be parsed (malformed syntax)
    ParseError,
    /// URL is missing required host/authority component
    MissingAuthority,
    /// URL scheme is not `http` or `https`
    UnsupportedScheme,
}

/// HTTP client error types
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    /// Request building failed
    #[error("Failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    /// Invalid header name
    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// Invalid header value
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// Invalid URL (empty, failed to parse, or unsupported)
    ///
    /// Use the `kind` field for programmatic matching. The `reason` field contains
    /// a diagnostic message intended for logging only.
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUri {
        /// The URL that failed validation
        url: String,
        /// Structured failure classification for programmatic matching
        kind: InvalidUriKind,
        /// Diagnostic message (unstable format, for logging only)
        reason: String,
    },

    /// Error value supplied by the caller as a request option
    #[error("Request aborted: {0}")]
    Caller(#[source] BoxError),

    /// Single request attempt timed out
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Deadline carried by the request context expired
    #[error("Request context deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// Request context was cancelled
    #[error("Request cancelled")]
    Cancelled,

    /// Transport error (network, connection, etc)
    #[error("Transport error: {0}")]
    Transport(#[source] BoxError),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[source] BoxError),

    /// Response body exceeded size limit
    #[error("Response body too large: limit {limit} bytes, got {actual} bytes")]
    BodyTooLarge { limit: usize, actual: usize },

    /// Reading or decoding the response body failed.
    ///
    /// The failure is remembered by the response; every later read returns
    /// this same error instead of an empty body.
    #[error("Failed to read response body: {0}")]
    Body(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// Response body was released by `close()` or consumed by a streaming accessor
    #[error("Response body already closed")]
    BodyClosed,

    /// HTTP non-2xx status
    #[error("HTTP {status}")]
    HttpStatus {
        status: http::StatusCode,
        content_type: Option<String>,
    },

    /// Redirect response without a usable `Location` header
    #[error("Redirect response {status} has no Location header")]
    MissingLocation { status: http::StatusCode },

    /// JSON encoding or decoding error
    #[error("JSON processing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// XML encoding or decoding error
    #[error("XML processing failed: {0}")]
    Xml(#[source] BoxError),

    /// Form URL encoding error
    #[error("Form encoding failed: {0}")]
    FormEncode(#[from] serde_urlencoded::ser::Error),

    /// Reading an upload stream failed while framing a multipart body
    #[error("Failed to read upload '{file_name}': {source}")]
    Upload {
        file_name: String,
        #[source]
        source: std::io::Error,
    },

    /// Local file could not be opened, created or written
    #[error("File error at '{}': {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Charset label is not known to the converter
    #[error("Unknown charset '{0}'")]
    UnknownCharset(String),

    /// Service overloaded (request buffer full, fail-fast)
    #[error("Service overloaded: request buffer is full")]
    Overloaded,

    /// Internal service failure (buffer worker died, channel closed)
    #[error("Service unavailable: internal failure")]
    ServiceClosed,
}

impl HttpError {
    /// Wraps an arbitrary caller error so it can be passed as a request option.
    pub fn caller(err: impl Into<BoxError>) -> Self {
        HttpError::Caller(err.into())
    }
}

impl From<hyper::Error> for HttpError {
    fn from(err: hyper::Error) -> Self {
        HttpError::Transport(Box::new(err))
    }
}

impl From<hyper_util::client::legacy::Error> for HttpError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        HttpError::Transport(Box::new(err))
    }
}
