//! Browser-driven transfer.
//!
//! Some links only produce a download after the origin's JavaScript runs.
//! This strategy points a browser tab at the URL and watches two signal
//! sources at once: download events from the channel (when available) and
//! the filesystem, where the browser keeps an in-progress marker file until
//! the download is done. Events are never trusted on their own; the
//! filesystem has the final word.
//!
//! Completion rules, in priority order:
//!
//! 1. Marker gone and a non-empty finished file present, confirmed by a
//!    short debounce re-scan. Only counts once the browser has shown it is
//!    downloading (an event or a marker), and never for files that were
//!    already in the directory before navigation
//! 2. A "completed" event only triggers a re-scan after a settle delay
//! 3. Progress at 100 % while the marker lingers for the grace period
//! 4. No event and no marker within the intent timeout means the page never
//!    started a download
//!
//! The same tab can also be used in resolve-only mode to turn an
//! indirection link into the real artifact URL without downloading it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::markers::{scan_directory, Baseline, DirectoryScan};
use super::{ProgressCallback, StrategyKind, TransferReport, TransferRequest, TransferStrategy, UrlResolver};
use crate::browser::{BrowserChannel, BrowserConnector, DownloadEvent, DownloadSink, DownloadState};
use crate::clock::BoxFuture;
use crate::completion::{CompletionDetector, CompletionState, Observation};
use crate::config::{BrowserConfig, CompletionConfig, EngineConfig};
use crate::error::{FetchError, FetchResult};
use crate::task::DownloadTask;

/// Browser-driven transfer strategy and URL resolver.
pub struct BrowserTransfer {
    connector: Arc<dyn BrowserConnector>,
    config: BrowserConfig,
    completion: CompletionConfig,
    min_speed: f64,
}

/// What woke the decision loop.
enum Wake {
    Cancelled,
    Event(Option<DownloadEvent>),
    Tick,
}

/// Signals gathered during one attempt.
#[derive(Default)]
struct Signals {
    intent: bool,
    received: u64,
    event_total: u64,
    full_since: Option<Instant>,
}

impl BrowserTransfer {
    pub fn new(connector: Arc<dyn BrowserConnector>, config: &EngineConfig) -> Self {
        Self {
            connector,
            config: config.browser.clone(),
            completion: config.completion.clone(),
            min_speed: config.http.min_speed_bytes_per_sec,
        }
    }

    /// Directories the browser may drop the artifact into.
    fn watched_dirs<'a>(&'a self, dest_dir: &'a Path) -> impl Iterator<Item = &'a Path> {
        let fallback = self
            .config
            .fallback_download_dir
            .as_deref()
            .filter(|dir| *dir != dest_dir);
        std::iter::once(dest_dir).chain(fallback)
    }

    fn scan(&self, dest_dir: &Path, since: SystemTime, baseline: &Baseline) -> DirectoryScan {
        let suffix = self.config.marker_suffix.as_str();
        let ext = self.config.artifact_extension.as_deref();
        self.watched_dirs(dest_dir)
            .map(|dir| scan_directory(dir, suffix, ext, since, baseline))
            .reduce(DirectoryScan::merge)
            .unwrap_or_default()
    }

    async fn run(&self, request: TransferRequest<'_>) -> FetchResult<TransferReport> {
        if !request.proxy.is_direct() {
            debug!(proxy = %request.proxy, "Browser strategy uses the browser's own network settings");
        }

        let mut channel = self.connector.open().await?;
        let located = self
            .drive(
                channel.as_mut(),
                request.url,
                request.task,
                request.cancel,
                request.progress.as_ref(),
            )
            .await;
        if let Err(e) = channel.close().await {
            debug!(error = %e, "Closing browser channel failed");
        }

        let artifact = located?;
        let bytes = move_into_place(&artifact, &request.task.destination).await?;
        info!(
            path = %request.task.destination.display(),
            bytes,
            "Browser download finished"
        );
        Ok(TransferReport {
            path: request.task.destination.clone(),
            bytes,
        })
    }

    /// Navigate and wait until the artifact is on disk; returns its location.
    async fn drive(
        &self,
        channel: &mut dyn BrowserChannel,
        url: &str,
        task: &DownloadTask,
        cancel: &CancellationToken,
        progress: Option<&ProgressCallback>,
    ) -> FetchResult<PathBuf> {
        let dest_dir = task.destination_dir().to_path_buf();
        let since = SystemTime::now()
            .checked_sub(self.config.mtime_slack)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let started = Instant::now();

        channel
            .set_download_sink(&DownloadSink::Allow(dest_dir.clone()))
            .await?;
        let mut events = channel.subscribe();
        let baseline = Baseline::capture(self.watched_dirs(&dest_dir));
        channel.navigate(url).await?;

        let hard_cap = started + self.config.max_wait;
        let mut deadline = started + self.config.wait_bound(task.expected_size, self.min_speed);
        let mut detector =
            CompletionDetector::new(&self.completion, self.config.liveness_window, started);
        let mut signals = Signals::default();

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(url, dir = %dest_dir.display(), "Waiting for browser download");

        loop {
            let wake = tokio::select! {
                _ = cancel.cancelled() => Wake::Cancelled,
                event = next_event(&mut events) => Wake::Event(event),
                _ = ticker.tick() => Wake::Tick,
            };

            match wake {
                Wake::Cancelled => return Err(FetchError::Cancelled),
                Wake::Event(None) => {
                    debug!("Browser event stream closed, relying on filesystem");
                    events = None;
                }
                Wake::Event(Some(event)) => {
                    // Rule 2: a completed event only triggers a re-check
                    // once the browser has had time to rename the marker.
                    if self.record_event(&event, &mut signals)? {
                        debug!("Browser reported completion, re-checking after settle delay");
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                            _ = tokio::time::sleep(self.config.completed_settle) => {}
                        }
                    }
                }
                Wake::Tick => {}
            }

            let now = Instant::now();
            let scan = self.scan(&dest_dir, since, &baseline);
            let marker = scan.has_marker();
            let final_file = scan.final_file().filter(|(_, size)| *size > 0);
            if marker {
                signals.intent = true;
            }

            let bytes = if marker {
                scan.marker_bytes()
            } else {
                final_file.map(|(_, size)| size).unwrap_or(0)
            };
            let expected = if task.expected_size > 0 {
                task.expected_size
            } else {
                signals.event_total
            };
            if let Some(cb) = progress {
                cb(bytes.max(signals.received), expected);
            }

            // Rule 1: the marker is gone and a finished file exists.
            if signals.intent && !marker {
                if let Some((path, size)) = final_file {
                    let path = path.to_path_buf();
                    if self.confirm_final(&dest_dir, since, &baseline, &path, cancel).await? {
                        info!(path = %path.display(), size, "Marker gone, download complete");
                        return Ok(path);
                    }
                    continue;
                }
            }

            // Rule 3: progress says done but the marker lingers.
            let reported_done = (signals.event_total > 0 && signals.received >= signals.event_total)
                || (expected > 0 && bytes >= expected);
            if marker && reported_done {
                let full_since = *signals.full_since.get_or_insert(now);
                if now.saturating_duration_since(full_since) >= self.config.marker_grace {
                    let path = artifact_from(&scan);
                    warn!(path = ?path, "Marker persisted after full progress, accepting");
                    if let Some(path) = path {
                        return Ok(path);
                    }
                }
            } else {
                signals.full_since = None;
            }

            // Rule 4: nothing ever started.
            let elapsed = now.saturating_duration_since(started);
            if !signals.intent && elapsed >= self.config.intent_timeout {
                return Err(FetchError::NoDownloadSignal {
                    url: url.to_string(),
                    waited_secs: elapsed.as_secs(),
                });
            }

            let observation = Observation {
                bytes,
                expected: task.expected_size,
                marker_present: marker,
            };
            if signals.intent && detector.observe(observation, now) == CompletionState::LikelyComplete {
                if let Some(path) = artifact_from(&scan) {
                    info!(path = %path.display(), bytes, "Size stable, treating download as complete");
                    return Ok(path);
                }
            }

            if now >= deadline {
                if detector.progressed_within(self.config.liveness_window, now) && deadline < hard_cap {
                    deadline = (deadline + self.config.wait_extension).min(hard_cap);
                    info!(
                        extended_by_secs = self.config.wait_extension.as_secs(),
                        bytes,
                        "Browser download still progressing, extending wait"
                    );
                } else {
                    return Err(FetchError::BrowserStalled {
                        waited_secs: elapsed.as_secs(),
                    });
                }
            }
        }
    }

    /// Fold an event into the signals; returns `true` for a completed event.
    fn record_event(&self, event: &DownloadEvent, signals: &mut Signals) -> FetchResult<bool> {
        signals.intent = true;
        match event {
            DownloadEvent::WillBegin {
                suggested_filename, ..
            } => {
                debug!(file = %suggested_filename, "Browser download started");
            }
            DownloadEvent::Progress {
                received,
                total,
                state,
                ..
            } => {
                signals.received = signals.received.max(*received);
                if *total > 0 {
                    signals.event_total = *total;
                }
                match state {
                    DownloadState::InProgress => {}
                    DownloadState::Completed => return Ok(true),
                    DownloadState::Canceled => {
                        return Err(FetchError::Browser("download canceled by browser".to_string()));
                    }
                }
            }
        }
        Ok(false)
    }

    /// Re-scan after the debounce delay to make sure the marker is really gone.
    async fn confirm_final(
        &self,
        dest_dir: &Path,
        since: SystemTime,
        baseline: &Baseline,
        path: &Path,
        cancel: &CancellationToken,
    ) -> FetchResult<bool> {
        tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            _ = tokio::time::sleep(self.config.marker_debounce) => {}
        }
        let again = self.scan(dest_dir, since, baseline);
        let confirmed = !again.has_marker()
            && again
                .final_file()
                .map(|(p, size)| p == path && size > 0)
                .unwrap_or(false);
        if !confirmed {
            debug!(path = %path.display(), "Finished file not confirmed, continuing to wait");
        }
        Ok(confirmed)
    }

    /// Resolve-only mode: capture the URL the browser would download.
    async fn capture(
        &self,
        channel: &mut dyn BrowserChannel,
        url: &str,
        cancel: &CancellationToken,
    ) -> FetchResult<String> {
        channel.set_download_sink(&DownloadSink::Deny).await?;
        let mut events = channel
            .subscribe()
            .ok_or_else(|| FetchError::Browser("channel offers no download events".to_string()))?;
        channel.navigate(url).await?;

        let timeout = tokio::time::sleep(self.config.resolve_timeout);
        tokio::pin!(timeout);

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = &mut timeout => {
                    return Err(FetchError::NoDownloadSignal {
                        url: url.to_string(),
                        waited_secs: self.config.resolve_timeout.as_secs(),
                    });
                }
                event = events.recv() => event,
            };

            match event {
                Some(DownloadEvent::WillBegin { guid, url: real, .. }) => {
                    if let Err(e) = channel.cancel_download(&guid).await {
                        debug!(error = %e, "Cancelling captured download failed");
                    }
                    if let Err(e) = channel.navigate("about:blank").await {
                        debug!(error = %e, "Navigating away failed");
                    }
                    return Ok(real);
                }
                Some(_) => {}
                None => return Err(FetchError::Browser("event stream closed".to_string())),
            }
        }
    }

    async fn resolve_url(&self, url: &str, cancel: &CancellationToken) -> FetchResult<String> {
        let mut channel = self.connector.open().await?;
        let result = self.capture(channel.as_mut(), url, cancel).await;
        if let Err(e) = channel.close().await {
            debug!(error = %e, "Closing browser channel failed");
        }
        let real = result?;
        info!(from = url, to = %real, "Resolved download URL");
        Ok(real)
    }
}

impl TransferStrategy for BrowserTransfer {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Browser
    }

    fn transfer<'a>(&'a self, request: TransferRequest<'a>) -> BoxFuture<'a, FetchResult<TransferReport>> {
        Box::pin(self.run(request))
    }
}

impl UrlResolver for BrowserTransfer {
    fn resolve<'a>(
        &'a self,
        url: &'a str,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, FetchResult<String>> {
        Box::pin(self.resolve_url(url, cancel))
    }
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<DownloadEvent>>) -> Option<DownloadEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Finished file if there is one, else the largest marker.
fn artifact_from(scan: &DirectoryScan) -> Option<PathBuf> {
    scan.final_file()
        .filter(|(_, size)| *size > 0)
        .map(|(path, _)| path.to_path_buf())
        .or_else(|| scan.largest_marker().map(|(path, _)| path.clone()))
}

/// Move the located artifact onto the destination path.
///
/// Falls back to copy and remove when a rename crosses filesystems.
async fn move_into_place(from: &Path, to: &Path) -> FetchResult<u64> {
    let unwritable = |source| FetchError::Unwritable {
        path: to.to_path_buf(),
        source,
    };
    if from != to {
        if let Err(e) = tokio::fs::rename(from, to).await {
            debug!(error = %e, "Rename failed, copying instead");
            tokio::fs::copy(from, to).await.map_err(unwritable)?;
            if let Err(e) = tokio::fs::remove_file(from).await {
                warn!(path = %from.display(), error = %e, "Could not remove browser download after copy");
            }
        }
    }
    let meta = tokio::fs::metadata(to).await.map_err(unwritable)?;
    Ok(meta.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyDescriptor;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Clone)]
    enum Behavior {
        /// Never start a download.
        Nothing,
        /// Write a marker, then rename it to the final file.
        Download { name: &'static str, data: Vec<u8> },
        /// Announce a download of `url`.
        Announce { url: &'static str },
        /// Drop an unrelated file into the directory without any download signal.
        Unrelated { name: &'static str },
    }

    struct FakeChannel {
        behavior: Behavior,
        sink: Option<PathBuf>,
        tx: Option<mpsc::UnboundedSender<DownloadEvent>>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl BrowserChannel for FakeChannel {
        fn set_download_sink<'a>(&'a mut self, sink: &'a DownloadSink) -> BoxFuture<'a, FetchResult<()>> {
            self.sink = match sink {
                DownloadSink::Allow(dir) => Some(dir.clone()),
                DownloadSink::Deny => None,
            };
            self.log.lock().push(format!("sink {:?}", sink));
            Box::pin(async { Ok(()) })
        }

        fn navigate<'a>(&'a mut self, url: &'a str) -> BoxFuture<'a, FetchResult<()>> {
            self.log.lock().push(format!("navigate {}", url));
            if url != "about:blank" {
                match self.behavior.clone() {
                    Behavior::Nothing => {}
                    Behavior::Download { name, data } => {
                        let dir = self.sink.clone().unwrap();
                        let tx = self.tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            let marker = dir.join(format!("{}.crdownload", name));
                            std::fs::write(&marker, &data[..data.len() / 2]).unwrap();
                            if let Some(tx) = &tx {
                                let _ = tx.send(DownloadEvent::Progress {
                                    guid: "g".to_string(),
                                    received: data.len() as u64 / 2,
                                    total: data.len() as u64 * 10,
                                    state: DownloadState::InProgress,
                                });
                            }
                            tokio::time::sleep(Duration::from_millis(300)).await;
                            std::fs::write(&marker, &data).unwrap();
                            std::fs::rename(&marker, dir.join(name)).unwrap();
                        });
                    }
                    Behavior::Unrelated { name } => {
                        let dir = self.sink.clone().unwrap();
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            std::fs::write(dir.join(name), b"PK other package").unwrap();
                        });
                    }
                    Behavior::Announce { url } => {
                        if let Some(tx) = &self.tx {
                            let _ = tx.send(DownloadEvent::WillBegin {
                                guid: "g-42".to_string(),
                                url: url.to_string(),
                                suggested_filename: "pkg.apk".to_string(),
                            });
                        }
                    }
                }
            }
            Box::pin(async { Ok(()) })
        }

        fn subscribe(&mut self) -> Option<mpsc::UnboundedReceiver<DownloadEvent>> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.tx = Some(tx);
            Some(rx)
        }

        fn cancel_download<'a>(&'a mut self, guid: &'a str) -> BoxFuture<'a, FetchResult<()>> {
            self.log.lock().push(format!("cancel {}", guid));
            Box::pin(async { Ok(()) })
        }

        fn close(self: Box<Self>) -> BoxFuture<'static, FetchResult<()>> {
            self.log.lock().push("close".to_string());
            Box::pin(async { Ok(()) })
        }
    }

    struct FakeConnector {
        behavior: Behavior,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl BrowserConnector for FakeConnector {
        fn open(&self) -> BoxFuture<'_, FetchResult<Box<dyn BrowserChannel>>> {
            let channel = FakeChannel {
                behavior: self.behavior.clone(),
                sink: None,
                tx: None,
                log: Arc::clone(&self.log),
            };
            Box::pin(async move { Ok(Box::new(channel) as Box<dyn BrowserChannel>) })
        }
    }

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.browser.poll_interval = Duration::from_millis(50);
        config.browser.marker_debounce = Duration::from_millis(50);
        config.browser.intent_timeout = Duration::from_millis(400);
        config.browser.resolve_timeout = Duration::from_millis(400);
        config.browser.fallback_download_dir = None;
        config
    }

    fn strategy(behavior: Behavior) -> (BrowserTransfer, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let connector = FakeConnector {
            behavior,
            log: Arc::clone(&log),
        };
        (BrowserTransfer::new(Arc::new(connector), &fast_config()), log)
    }

    #[tokio::test]
    async fn test_marker_absence_wins_over_progress_events() {
        let mut data = vec![1u8; 4096];
        data[..2].copy_from_slice(b"PK");
        let (browser, log) = strategy(Behavior::Download {
            name: "server-name.apk",
            data: data.clone(),
        });

        let dir = TempDir::new().unwrap();
        let task = DownloadTask::new("https://store.example.com/app/1", dir.path().join("game.apk"));
        let cancel = CancellationToken::new();

        let report = browser
            .transfer(TransferRequest {
                url: &task.source_url,
                task: &task,
                proxy: &ProxyDescriptor::Direct,
                cancel: &cancel,
                progress: None,
            })
            .await
            .unwrap();

        assert_eq!(report.path, task.destination);
        assert_eq!(report.bytes, 4096);
        assert_eq!(std::fs::read(&task.destination).unwrap(), data);
        assert!(!dir.path().join("server-name.apk").exists());
        assert_eq!(log.lock().last().map(String::as_str), Some("close"));
    }

    #[tokio::test]
    async fn test_no_signal_is_reported() {
        let (browser, log) = strategy(Behavior::Nothing);
        let dir = TempDir::new().unwrap();
        let task = DownloadTask::new("https://store.example.com/app/1", dir.path().join("game.apk"));
        let cancel = CancellationToken::new();

        let err = browser
            .transfer(TransferRequest {
                url: &task.source_url,
                task: &task,
                proxy: &ProxyDescriptor::Direct,
                cancel: &cancel,
                progress: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::NoDownloadSignal { .. }));
        assert!(log.lock().contains(&"close".to_string()));
    }

    #[tokio::test]
    async fn test_preexisting_sibling_is_not_taken() {
        let (browser, _log) = strategy(Behavior::Nothing);
        let dir = TempDir::new().unwrap();
        let sibling = dir.path().join("game_a.apk");
        std::fs::write(&sibling, b"PK sibling package").unwrap();
        let task = DownloadTask::new("https://store.example.com/app/2", dir.path().join("game_b.apk"));
        let cancel = CancellationToken::new();

        let err = browser
            .transfer(TransferRequest {
                url: &task.source_url,
                task: &task,
                proxy: &ProxyDescriptor::Direct,
                cancel: &cancel,
                progress: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::NoDownloadSignal { .. }));
        assert_eq!(std::fs::read(&sibling).unwrap(), b"PK sibling package");
        assert!(!task.destination.exists());
    }

    #[tokio::test]
    async fn test_file_without_download_signal_is_not_taken() {
        let (browser, _log) = strategy(Behavior::Unrelated { name: "game_a.apk" });
        let dir = TempDir::new().unwrap();
        let task = DownloadTask::new("https://store.example.com/app/2", dir.path().join("game_b.apk"));
        let cancel = CancellationToken::new();

        let err = browser
            .transfer(TransferRequest {
                url: &task.source_url,
                task: &task,
                proxy: &ProxyDescriptor::Direct,
                cancel: &cancel,
                progress: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::NoDownloadSignal { .. }));
        assert!(dir.path().join("game_a.apk").exists());
        assert!(!task.destination.exists());
    }

    #[tokio::test]
    async fn test_download_next_to_preexisting_sibling() {
        let mut data = vec![7u8; 2048];
        data[..2].copy_from_slice(b"PK");
        let (browser, _log) = strategy(Behavior::Download {
            name: "server-name.apk",
            data: data.clone(),
        });
        let dir = TempDir::new().unwrap();
        let sibling = dir.path().join("game_a.apk");
        std::fs::write(&sibling, b"PK sibling package").unwrap();
        let task = DownloadTask::new("https://store.example.com/app/2", dir.path().join("game_b.apk"));
        let cancel = CancellationToken::new();

        browser
            .transfer(TransferRequest {
                url: &task.source_url,
                task: &task,
                proxy: &ProxyDescriptor::Direct,
                cancel: &cancel,
                progress: None,
            })
            .await
            .unwrap();

        assert_eq!(std::fs::read(&task.destination).unwrap(), data);
        assert_eq!(std::fs::read(&sibling).unwrap(), b"PK sibling package");
    }

    #[tokio::test]
    async fn test_resolve_only_captures_url_and_cancels() {
        let (browser, log) = strategy(Behavior::Announce {
            url: "https://cdn.example.com/real/pkg.apk",
        });
        let cancel = CancellationToken::new();

        let real = browser
            .resolve("https://api.example.com/adown/123", &cancel)
            .await
            .unwrap();

        assert_eq!(real, "https://cdn.example.com/real/pkg.apk");
        let log = log.lock();
        assert_eq!(log[0], "sink Deny");
        assert!(log.contains(&"cancel g-42".to_string()));
        assert!(log.contains(&"navigate about:blank".to_string()));
    }

    #[tokio::test]
    async fn test_cancellation_stops_waiting() {
        let (browser, _log) = strategy(Behavior::Nothing);
        let dir = TempDir::new().unwrap();
        let task = DownloadTask::new("https://store.example.com/app/1", dir.path().join("game.apk"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = browser
            .transfer(TransferRequest {
                url: &task.source_url,
                task: &task,
                proxy: &ProxyDescriptor::Direct,
                cancel: &cancel,
                progress: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
    }
}
