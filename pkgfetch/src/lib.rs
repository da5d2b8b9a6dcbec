//! pkgfetch - Resilient single-file package downloads
//!
//! This library fetches one large archive from an unreliable origin that
//! throttles, serves decoy bodies, or only releases files to a real browser.
//! A [`DownloadSession`] drives one [`DownloadTask`] to an [`Outcome`],
//! alternating between a browser-driven strategy and a resumable HTTP
//! strategy, rotating through a [`ProxyPool`], and accepting only files that
//! pass the [`IntegrityValidator`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use pkgfetch::{DownloadSession, DownloadTask, EngineConfig, ProxyPool};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() {
//! let session = DownloadSession::new(EngineConfig::default(), Arc::new(ProxyPool::direct()));
//! let task = DownloadTask::new("https://mirror.example.com/app.apk", "downloads/app.apk");
//! let outcome = session.run(&task, CancellationToken::new()).await;
//! println!("{:?}", outcome);
//! # }
//! ```

pub mod browser;
pub mod clock;
pub mod completion;
pub mod config;
pub mod error;
pub mod headers;
pub mod integrity;
pub mod logging;
pub mod proxy;
pub mod session;
pub mod task;
pub mod transfer;

pub use config::EngineConfig;
pub use error::{ErrorClass, FetchError, FetchResult};
pub use integrity::{IntegrityValidator, Verdict};
pub use proxy::{ProxyDescriptor, ProxyPool};
pub use session::DownloadSession;
pub use task::{DownloadTask, Outcome};
