//! Browser channel abstraction.
//!
//! The browser strategy only needs a handful of capabilities: point the
//! download sink somewhere, navigate, observe download events and cancel a
//! download. [`BrowserConnector`] opens a fresh [`BrowserChannel`] per
//! attempt; [`CdpConnector`] is the implementation for Chromium's DevTools
//! protocol.

mod cdp;

use std::path::PathBuf;

use tokio::sync::mpsc;

pub use cdp::{parse_event, CdpChannel, CdpConnector, DEFAULT_DEBUGGER_URL};

use crate::clock::BoxFuture;
use crate::error::FetchResult;

/// Where the browser should put downloads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DownloadSink {
    /// Save into this directory.
    Allow(PathBuf),
    /// Refuse downloads (resolve-only mode).
    Deny,
}

/// State reported by a progress event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadState {
    InProgress,
    Completed,
    Canceled,
}

/// Download lifecycle event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DownloadEvent {
    /// The browser decided to download a resource.
    WillBegin {
        guid: String,
        url: String,
        suggested_filename: String,
    },
    /// Progress of an ongoing download. `total` is 0 when unknown.
    Progress {
        guid: String,
        received: u64,
        total: u64,
        state: DownloadState,
    },
}

impl DownloadEvent {
    pub fn guid(&self) -> &str {
        match self {
            Self::WillBegin { guid, .. } | Self::Progress { guid, .. } => guid,
        }
    }
}

/// Control surface of one browser tab.
pub trait BrowserChannel: Send {
    /// Configure where downloads go.
    fn set_download_sink<'a>(&'a mut self, sink: &'a DownloadSink) -> BoxFuture<'a, FetchResult<()>>;

    /// Load a URL.
    fn navigate<'a>(&'a mut self, url: &'a str) -> BoxFuture<'a, FetchResult<()>>;

    /// Download event stream. Best effort: `None` if the channel cannot
    /// deliver events, in which case callers rely on filesystem polling.
    fn subscribe(&mut self) -> Option<mpsc::UnboundedReceiver<DownloadEvent>>;

    /// Cancel an in-flight download.
    fn cancel_download<'a>(&'a mut self, guid: &'a str) -> BoxFuture<'a, FetchResult<()>>;

    /// Release the tab.
    fn close(self: Box<Self>) -> BoxFuture<'static, FetchResult<()>>;
}

/// Opens browser channels.
pub trait BrowserConnector: Send + Sync {
    fn open(&self) -> BoxFuture<'_, FetchResult<Box<dyn BrowserChannel>>>;
}
