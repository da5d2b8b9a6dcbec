//! Transfer strategies.
//!
//! A strategy performs one attempt to bring the artifact onto local disk
//! through one outbound endpoint. Strategies never retry across attempts or
//! switch proxies; they report a [`FetchError`](crate::error::FetchError) and
//! leave those decisions to the session.
//!
//! # Strategies
//!
//! - [`HttpTransfer`] - resumable, speed-governed HTTP GET into `<dest>.part`
//! - [`BrowserTransfer`] - drives a browser and locates the file it saved

mod browser;
mod governor;
mod http;
mod markers;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub use browser::BrowserTransfer;
pub use governor::{GovernorAction, RefreshReason, ThroughputGovernor};
pub use http::{is_loopback_url, HttpTransfer};
pub use markers::{scan_directory, DirectoryScan};

use crate::clock::BoxFuture;
use crate::error::FetchResult;
use crate::proxy::ProxyDescriptor;
use crate::task::DownloadTask;

/// Progress callback: `(bytes_on_disk, total_bytes)`; total is 0 if unknown.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Which strategy an attempt uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    Browser,
    Http,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Browser => write!(f, "browser"),
            Self::Http => write!(f, "http"),
        }
    }
}

/// Inputs of one transfer attempt.
pub struct TransferRequest<'a> {
    /// URL to fetch (already resolved if it was an indirection link).
    pub url: &'a str,
    pub task: &'a DownloadTask,
    pub proxy: &'a ProxyDescriptor,
    pub cancel: &'a CancellationToken,
    pub progress: Option<ProgressCallback>,
}

/// Result of a successful transfer attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferReport {
    /// Where the bytes are. The session validates and finalizes this file.
    pub path: PathBuf,
    /// Size of the file.
    pub bytes: u64,
}

/// One way of transferring an artifact.
pub trait TransferStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Perform one attempt.
    fn transfer<'a>(&'a self, request: TransferRequest<'a>) -> BoxFuture<'a, FetchResult<TransferReport>>;
}

/// Turns an indirection link into the real artifact URL.
pub trait UrlResolver: Send + Sync {
    fn resolve<'a>(
        &'a self,
        url: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, FetchResult<String>>;
}
