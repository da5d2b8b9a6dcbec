//! Download session: one task from request to terminal outcome.
//!
//! The session owns every retry decision. Strategies report what went wrong;
//! [`RetryState::on_failure`] turns that into a decision; the session
//! performs it:
//!
//! ```text
//! preflight ─► already valid? ─► resolve indirection ─► attempt ─► validate ─► Completed
//!                                                          ▲  │
//!                      backoff / fall back / next proxy ───┘  └─► Failed*
//! ```
//!
//! HTTP attempts write to `<destination>.part`, which is only renamed onto
//! the destination after the integrity gate passes.

mod retry;

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use retry::{RetryDecision, RetryPolicy, RetryState, DEFAULT_BACKOFF_CAP_SECS};

use crate::browser::CdpConnector;
use crate::clock::{Clock, TokioClock};
use crate::config::EngineConfig;
use crate::error::{ErrorClass, FetchError, FetchResult};
use crate::integrity::{IntegrityValidator, Verdict};
use crate::proxy::{ProxyDescriptor, ProxyPool, LOCAL_PROXY_TIMEOUT};
use crate::task::{DownloadTask, Outcome};
use crate::transfer::{
    BrowserTransfer, HttpTransfer, ProgressCallback, StrategyKind, TransferReport,
    TransferRequest, TransferStrategy, UrlResolver,
};

/// Reason carried by the outcome of a cancelled session.
pub const CANCELLED_REASON: &str = "cancelled";

/// Runs download tasks with failover between strategies and proxies.
pub struct DownloadSession {
    config: EngineConfig,
    pool: Arc<ProxyPool>,
    http: Arc<dyn TransferStrategy>,
    browser: Option<Arc<dyn TransferStrategy>>,
    resolver: Option<Arc<dyn UrlResolver>>,
    validator: IntegrityValidator,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    progress: Option<ProgressCallback>,
}

impl DownloadSession {
    /// Create a session with the HTTP strategy only.
    pub fn new(config: EngineConfig, pool: Arc<ProxyPool>) -> Self {
        Self {
            http: Arc::new(HttpTransfer::new(&config)),
            browser: None,
            resolver: None,
            validator: IntegrityValidator::new(&config.integrity),
            policy: RetryPolicy::from_config(&config),
            clock: Arc::new(TokioClock),
            progress: None,
            pool,
            config,
        }
    }

    /// Create a session from configuration alone.
    ///
    /// Builds the proxy pool from `config.proxies` and, when a debugger URL
    /// is configured, the browser strategy and resolver. With an empty proxy
    /// list and `detect_local_proxy` set, a local proxy found on a loopback
    /// port is added to the pool.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed proxy entries or if the browser
    /// connector cannot be created.
    pub async fn from_config(config: EngineConfig) -> FetchResult<Self> {
        let mut proxies = config
            .proxies
            .iter()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(ProxyDescriptor::parse)
            .collect::<FetchResult<Vec<_>>>()?;
        if proxies.is_empty() && config.detect_local_proxy {
            proxies.extend(ProxyPool::detect_local(LOCAL_PROXY_TIMEOUT).await);
        }
        let pool = Arc::new(ProxyPool::new(proxies));

        let debugger_url = config.browser.debugger_url.clone();
        let mut session = Self::new(config, pool);
        if let Some(url) = debugger_url {
            let connector = Arc::new(CdpConnector::new(url)?);
            let browser = Arc::new(BrowserTransfer::new(connector, &session.config));
            session = session
                .with_browser_strategy(browser.clone())
                .with_resolver(browser);
        }
        Ok(session)
    }

    /// Replace the HTTP strategy.
    pub fn with_http_strategy(mut self, strategy: Arc<dyn TransferStrategy>) -> Self {
        self.http = strategy;
        self
    }

    /// Enable the browser strategy; it is tried first on the initial endpoint.
    pub fn with_browser_strategy(mut self, strategy: Arc<dyn TransferStrategy>) -> Self {
        self.browser = Some(strategy);
        self
    }

    /// Enable resolution of indirection links.
    pub fn with_resolver(mut self, resolver: Arc<dyn UrlResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Replace the clock used for backoff waits.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Report transfer progress.
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    /// The shared proxy pool.
    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    /// Run a task to completion.
    ///
    /// Never panics and never returns early without an outcome; cancellation
    /// yields `FailedPermanently` with the partial left in place.
    pub async fn run(&self, task: &DownloadTask, cancel: CancellationToken) -> Outcome {
        info!(
            url = %task.source_url,
            dest = %task.destination.display(),
            expected = task.expected_size,
            "Starting download"
        );

        if let Err(e) = preflight(task).await {
            warn!(error = %e, "Destination is not usable");
            return Outcome::FailedPermanently {
                reason: e.to_string(),
            };
        }

        if let Some(size) = self.already_complete(task).await {
            info!(path = %task.destination.display(), size, "Artifact already present");
            return Outcome::Completed {
                path: task.destination.clone(),
                size_bytes: size,
            };
        }

        let url = match self.resolve(task, &cancel).await {
            Ok(url) => url,
            Err(_) => return cancelled(),
        };

        let first_strategy = if self.browser.is_some() {
            StrategyKind::Browser
        } else {
            StrategyKind::Http
        };
        let mut state = RetryState::new(self.pool.first(), first_strategy);

        loop {
            if cancel.is_cancelled() {
                return cancelled();
            }

            let strategy = self.strategy_for(state.current_strategy);
            debug!(
                attempt = state.attempt_count + 1,
                strategy = %strategy.kind(),
                proxy = %state.current_proxy,
                "Starting attempt"
            );

            let result = strategy
                .transfer(TransferRequest {
                    url: &url,
                    task,
                    proxy: &state.current_proxy,
                    cancel: &cancel,
                    progress: self.progress.clone(),
                })
                .await;

            let error = match result {
                Ok(report) => match self.finalize(task, report).await {
                    Ok(outcome) => {
                        info!(
                            path = %task.destination.display(),
                            attempts = state.attempt_count + 1,
                            "Download complete"
                        );
                        return outcome;
                    }
                    Err(e) => e,
                },
                Err(e) => e,
            };

            if matches!(error, FetchError::Cancelled) {
                info!(partial = %task.partial_path().display(), "Download cancelled");
                return cancelled();
            }

            warn!(
                attempt = state.attempt_count + 1,
                strategy = %state.current_strategy,
                proxy = %state.current_proxy,
                error = %error,
                "Attempt failed"
            );
            self.apply_partial_policy(task, &error).await;

            match state.on_failure(error, &self.policy) {
                RetryDecision::GiveUp => {
                    return Outcome::FailedPermanently {
                        reason: state.last_reason(),
                    };
                }
                RetryDecision::FallBackToHttp => {
                    info!("Falling back to HTTP");
                    state.fall_back_to_http();
                }
                RetryDecision::Retry { delay } => {
                    debug!(delay_secs = delay.as_secs(), "Backing off");
                    let slept = tokio::select! {
                        _ = cancel.cancelled() => false,
                        _ = self.clock.sleep(delay) => true,
                    };
                    if !slept {
                        return cancelled();
                    }
                }
                RetryDecision::SwitchProxy => {
                    if self.config.retry.drop_unreachable_proxies && state.endpoint_unreachable() {
                        self.pool.remove(&state.current_proxy);
                    }
                    match self.next_untried(&state) {
                        Some(proxy) => {
                            info!(from = %state.current_proxy, to = %proxy, "Switching endpoint");
                            state.switch_endpoint(proxy);
                        }
                        None => {
                            warn!(attempts = state.attempt_count, "All endpoints exhausted");
                            return Outcome::FailedRetryableExhausted {
                                reason: format!(
                                    "all endpoints exhausted after {} attempts: {}",
                                    state.attempt_count,
                                    state.last_reason()
                                ),
                            };
                        }
                    }
                }
            }
        }
    }

    fn strategy_for(&self, kind: StrategyKind) -> &Arc<dyn TransferStrategy> {
        match (kind, &self.browser) {
            (StrategyKind::Browser, Some(browser)) => browser,
            _ => &self.http,
        }
    }

    /// Resolve indirection links; a failed resolution keeps the original URL.
    ///
    /// Only cancellation is reported as an error.
    async fn resolve(&self, task: &DownloadTask, cancel: &CancellationToken) -> FetchResult<String> {
        let url = task.source_url.as_str();
        if !self.config.browser.is_indirection(url) {
            return Ok(url.to_string());
        }
        let Some(resolver) = &self.resolver else {
            debug!(url, "Indirection link but no resolver configured");
            return Ok(url.to_string());
        };
        match resolver.resolve(url, cancel).await {
            Ok(real) => Ok(real),
            Err(FetchError::Cancelled) => Err(FetchError::Cancelled),
            Err(e) => {
                warn!(url, error = %e, "Resolution failed, keeping guessed URL");
                Ok(url.to_string())
            }
        }
    }

    /// Next pool entry not yet used by this session.
    fn next_untried(&self, state: &RetryState) -> Option<ProxyDescriptor> {
        (0..self.pool.len())
            .map(|_| self.pool.next())
            .find(|proxy| !state.was_tried(proxy))
    }

    async fn validate(&self, path: &Path, task: &DownloadTask) -> FetchResult<Verdict> {
        let validator = self.validator.clone();
        let path_buf = path.to_path_buf();
        let expected = task.expected_size;
        let sha256 = task.expected_sha256.clone();
        tokio::task::spawn_blocking(move || validator.validate(&path_buf, expected, sha256.as_deref()))
            .await
            .map_err(|e| FetchError::Integrity {
                path: path.to_path_buf(),
                reason: format!("validation task failed: {}", e),
            })?
    }

    /// Integrity gate, then move the artifact onto the destination.
    async fn finalize(&self, task: &DownloadTask, report: TransferReport) -> FetchResult<Outcome> {
        let size = self
            .validate(&report.path, task)
            .await?
            .into_result(&report.path)?;

        if report.path != task.destination {
            tokio::fs::rename(&report.path, &task.destination)
                .await
                .map_err(|source| FetchError::Unwritable {
                    path: task.destination.clone(),
                    source,
                })?;
        }

        Ok(Outcome::Completed {
            path: task.destination.clone(),
            size_bytes: size,
        })
    }

    async fn already_complete(&self, task: &DownloadTask) -> Option<u64> {
        if !task.destination.is_file() {
            return None;
        }
        match self.validate(&task.destination, task).await {
            Ok(Verdict::Valid { size }) => Some(size),
            Ok(Verdict::Invalid { reason }) => {
                debug!(%reason, "Existing destination is not a valid artifact");
                None
            }
            Err(e) => {
                debug!(error = %e, "Cannot inspect existing destination");
                None
            }
        }
    }

    /// Delete artifacts that must not be resumed.
    ///
    /// Content-invalid and sentinel failures always discard what was written.
    /// Otherwise the partial is discarded only when it is too small to be
    /// worth resuming and not close to the expected size.
    async fn apply_partial_policy(&self, task: &DownloadTask, error: &FetchError) {
        let partial = task.partial_path();
        let poisoned = error.class() == ErrorClass::ContentInvalid
            || matches!(error, FetchError::SentinelBody { .. });

        if poisoned {
            remove_if_exists(&partial).await;
            remove_if_exists(&task.destination).await;
            return;
        }

        let Ok(meta) = tokio::fs::metadata(&partial).await else {
            return;
        };
        let size = meta.len();
        let near_complete = task.expected_size > 0
            && size as f64 >= task.expected_size as f64 * self.config.integrity.completeness_ratio;
        if size < self.config.integrity.keep_partial_min && !near_complete {
            debug!(path = %partial.display(), size, "Discarding small partial");
            remove_if_exists(&partial).await;
        } else {
            debug!(path = %partial.display(), size, "Keeping partial for resume");
        }
    }
}

fn cancelled() -> Outcome {
    Outcome::FailedPermanently {
        reason: CANCELLED_REASON.to_string(),
    }
}

/// Make sure the destination directory exists and accepts new files.
async fn preflight(task: &DownloadTask) -> FetchResult<()> {
    let dir = task.destination_dir();
    let unwritable = |source| FetchError::Unwritable {
        path: dir.to_path_buf(),
        source,
    };
    tokio::fs::create_dir_all(dir).await.map_err(unwritable)?;

    let file_name = task
        .destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    let probe = dir.join(format!(".{}.pkgfetch-probe", file_name));
    tokio::fs::write(&probe, b"").await.map_err(unwritable)?;
    remove_if_exists(&probe).await;
    Ok(())
}

async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove file"),
    }
}
