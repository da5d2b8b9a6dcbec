//! Error types for the download engine.
//!
//! Strategies report failures as [`FetchError`] values; only the session
//! decides whether a failure is retried, escalated to the next proxy, or
//! terminal. That decision is driven by [`FetchError::class`] and
//! [`FetchError::escalates`].

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for engine operations.
pub type FetchResult<T> = Result<T, FetchError>;

/// Coarse classification used by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network-level or origin soft-blocking failure. Retry with backoff.
    Transient,
    /// The transfer finished but produced something that is not the package.
    /// Retry after deleting the artifact.
    ContentInvalid,
    /// No retry can help.
    Permanent,
}

/// Errors that can occur while fetching an artifact.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Could not connect to the origin or the proxy.
    #[error("connection to {url} failed: {reason}")]
    Connection { url: String, reason: String },

    /// The body ended or broke before the expected size was reached.
    #[error("transfer from {url} truncated at {bytes} bytes: {reason}")]
    Truncated {
        url: String,
        bytes: u64,
        reason: String,
    },

    /// Throughput dropped below the minimum acceptable speed.
    #[error("throughput collapsed to {bytes_per_sec:.0} B/s at {bytes} bytes")]
    SpeedCollapse { bytes_per_sec: f64, bytes: u64 },

    /// The origin answered with its blocked-address sentinel body.
    #[error("origin returned the 'error' sentinel body for {url}")]
    SentinelBody { url: String },

    /// The origin redirected to a loopback address (bot detection).
    #[error("redirected to loopback address {location}")]
    LoopbackRedirect { location: String },

    /// The origin served an HTML page instead of a package.
    #[error("origin served {content_type} instead of a package")]
    HtmlBody { content_type: String },

    /// Unexpected HTTP status.
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// The request exceeded its computed timeout.
    #[error("request to {url} timed out after {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },

    /// The browser never signalled that a download started.
    #[error("browser showed no download intent for {url} within {waited_secs}s")]
    NoDownloadSignal { url: String, waited_secs: u64 },

    /// The browser download stopped making progress.
    #[error("browser download stalled after {waited_secs}s")]
    BrowserStalled { waited_secs: u64 },

    /// The browser channel failed (connection, protocol, or command error).
    #[error("browser channel error: {0}")]
    Browser(String),

    /// The artifact did not pass the integrity gate.
    #[error("integrity check failed for {}: {reason}", path.display())]
    Integrity { path: PathBuf, reason: String },

    /// The destination cannot be created or written.
    #[error("destination {} is not writable: {source}", path.display())]
    Unwritable { path: PathBuf, source: io::Error },

    /// Failed to read a local file.
    #[error("failed to read {}: {source}", path.display())]
    ReadFailed { path: PathBuf, source: io::Error },

    /// The caller cancelled the download.
    #[error("download cancelled")]
    Cancelled,

    /// A proxy descriptor could not be parsed.
    #[error("invalid proxy descriptor {0:?}")]
    InvalidProxy(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    Client(String),
}

impl FetchError {
    /// Classify the error for the retry policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Connection { .. }
            | Self::Truncated { .. }
            | Self::SpeedCollapse { .. }
            | Self::SentinelBody { .. }
            | Self::LoopbackRedirect { .. }
            | Self::Timeout { .. }
            | Self::NoDownloadSignal { .. }
            | Self::BrowserStalled { .. }
            | Self::Browser(_) => ErrorClass::Transient,
            Self::HttpStatus { status, .. } => match status {
                404 | 410 => ErrorClass::Permanent,
                _ => ErrorClass::Transient,
            },
            Self::Integrity { .. } | Self::HtmlBody { .. } => ErrorClass::ContentInvalid,
            Self::Unwritable { .. }
            | Self::ReadFailed { .. }
            | Self::Cancelled
            | Self::InvalidProxy(_)
            | Self::InvalidConfig(_)
            | Self::Client(_) => ErrorClass::Permanent,
        }
    }

    /// Whether the session may retry after this error.
    pub fn is_retryable(&self) -> bool {
        self.class() != ErrorClass::Permanent
    }

    /// Whether the origin is blocking the current egress address.
    ///
    /// Escalating errors skip the remaining attempts on the current endpoint
    /// and move straight to the next proxy.
    pub fn escalates(&self) -> bool {
        match self {
            Self::SentinelBody { .. } | Self::LoopbackRedirect { .. } => true,
            Self::HttpStatus { status, .. } => matches!(status, 403 | 429),
            _ => false,
        }
    }

    /// Whether the error means the endpoint itself could not be reached.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Map a reqwest error to an engine error for the given URL.
    pub(crate) fn from_reqwest(url: &str, err: reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
                timeout_secs,
            }
        } else if err.is_builder() {
            Self::Client(err.to_string())
        } else if err.is_connect() || err.is_request() {
            Self::Connection {
                url: url.to_string(),
                reason: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            Self::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }
        } else {
            Self::Connection {
                url: url.to_string(),
                reason: err.to_string(),
            }
        }
    }
}
