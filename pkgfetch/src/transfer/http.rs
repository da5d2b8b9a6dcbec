//! HTTP transfer with resume, speed governance and auto-reconnect.
//!
//! One attempt streams the artifact into `<destination>.part`:
//!
//! 1. HEAD probe for size, range support and content type (405/501 tolerated)
//! 2. GET with `Range: bytes=<on disk>-`, interpreted like a proper client
//!    (206 resumes, 200 restarts, 416 at the total means done)
//! 3. Stream through a buffered writer while the [`ThroughputGovernor`]
//!    watches each measurement window
//! 4. Reconnect with a Range request on governor refreshes and on mechanical
//!    faults (reset, truncation, premature EOF), up to a bound
//!
//! Redirects to loopback addresses are the origin's bot detection and are
//! never followed.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Instant;

use futures::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE};
use reqwest::redirect::Policy;
use reqwest::{Client, Response, Url};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::governor::{GovernorAction, RefreshReason, ThroughputGovernor};
use super::{ProgressCallback, StrategyKind, TransferReport, TransferRequest, TransferStrategy};
use crate::clock::BoxFuture;
use crate::completion::{CompletionDetector, CompletionState, Observation};
use crate::config::{CompletionConfig, EngineConfig, HttpConfig};
use crate::error::{FetchError, FetchResult};
use crate::headers::{browser_headers, random_user_agent};
use crate::integrity::SENTINEL_PREFIX;
use crate::proxy::ProxyDescriptor;

/// HTTP transfer strategy.
#[derive(Debug, Clone)]
pub struct HttpTransfer {
    config: HttpConfig,
    completion: CompletionConfig,
}

/// What the HEAD probe learned.
#[derive(Debug, Default, Clone, Copy)]
struct ProbeInfo {
    content_length: u64,
    accept_ranges: bool,
}

/// Result of opening a GET connection.
enum Opened {
    /// Body streaming from `start`.
    Stream {
        response: Response,
        start: u64,
        total: u64,
        partial: bool,
        /// Content type, when the server labelled the body as HTML.
        html: Option<String>,
    },
    /// The server reports the local file already covers the whole resource.
    Complete { total: u64 },
    /// The local partial is larger than the resource and must be discarded.
    Restart { total: u64 },
}

/// Why a streaming connection ended.
enum StreamEnd {
    Finished,
    Refresh(RefreshReason),
    Fault(String),
}

/// Per-connection streaming inputs.
struct StreamContext<'a> {
    url: &'a str,
    part: &'a Path,
    total: u64,
    check_sentinel: bool,
    html: Option<&'a str>,
    ranges: bool,
    cancel: &'a CancellationToken,
    progress: Option<&'a ProgressCallback>,
}

impl HttpTransfer {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            config: config.http.clone(),
            completion: config.completion.clone(),
        }
    }

    /// Build a client for one endpoint.
    fn build_client(&self, proxy: &ProxyDescriptor, referer: Option<&str>) -> FetchResult<Client> {
        let builder = Client::builder()
            .user_agent(random_user_agent())
            .default_headers(browser_headers(referer))
            .cookie_store(true)
            .connect_timeout(self.config.connect_timeout)
            .redirect(loopback_guard(self.config.max_redirects));

        let builder = match proxy.to_reqwest_proxy()? {
            Some(p) => builder.proxy(p),
            None => builder.no_proxy(),
        };

        builder.build().map_err(|e| FetchError::Client(e.to_string()))
    }

    /// Query size and range support via HEAD.
    async fn probe(&self, client: &Client, url: &str) -> FetchResult<ProbeInfo> {
        let timeout_secs = self.config.probe_timeout.as_secs();
        let response = match client
            .head(url)
            .timeout(self.config.probe_timeout)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                let err = FetchError::from_reqwest(url, e, timeout_secs);
                if err.is_connection_failure() {
                    return Err(err);
                }
                warn!(url, error = %err, "Metadata probe failed, continuing without it");
                return Ok(ProbeInfo::default());
            }
        };

        let status = response.status();
        if status.is_redirection() {
            return Err(redirect_error(&response, url));
        }
        if !status.is_success() {
            // 405/501 from servers that refuse HEAD; any other status is
            // left for the GET to report.
            debug!(url, status = status.as_u16(), "HEAD not usable");
            return Ok(ProbeInfo::default());
        }

        if let Some(content_type) = html_content_type(response.headers()) {
            debug!(url, content_type, "HEAD reports an HTML body, deciding on the GET");
        }

        let content_length = header_u64(response.headers(), CONTENT_LENGTH.as_str()).unwrap_or(0);
        let accept_ranges = response
            .headers()
            .get("accept-ranges")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

        debug!(
            url,
            final_url = %response.url(),
            content_length,
            accept_ranges,
            "Probed resource"
        );

        Ok(ProbeInfo {
            content_length,
            accept_ranges,
        })
    }

    /// Issue a Range GET starting at `offset`.
    async fn open(&self, client: &Client, url: &str, offset: u64, total: u64) -> FetchResult<Opened> {
        let timeout = self.config.timeout_for(total.saturating_sub(offset));
        let response = client
            .get(url)
            .header(RANGE, format!("bytes={}-", offset))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e, timeout.as_secs()))?;

        let status = response.status();
        if status.is_redirection() {
            return Err(redirect_error(&response, url));
        }

        match status.as_u16() {
            206 => {
                let html = html_content_type(response.headers());
                let (start, range_total) = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .map(parse_content_range)
                    .unwrap_or((None, 0));
                let start = start.unwrap_or(offset);
                if start > offset {
                    return Err(FetchError::Truncated {
                        url: url.to_string(),
                        bytes: offset,
                        reason: format!("server resumed at {} past local {}", start, offset),
                    });
                }
                Ok(Opened::Stream {
                    response,
                    start,
                    total: range_total,
                    partial: true,
                    html,
                })
            }
            200 => {
                let html = html_content_type(response.headers());
                if offset > 0 {
                    info!(url, offset, "Server ignored range request, restarting from zero");
                }
                let total = header_u64(response.headers(), CONTENT_LENGTH.as_str()).unwrap_or(0);
                Ok(Opened::Stream {
                    response,
                    start: 0,
                    total,
                    partial: false,
                    html,
                })
            }
            416 => {
                let (_, remote_total) = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .map(parse_content_range)
                    .unwrap_or((None, 0));
                let remote_total = if remote_total > 0 { remote_total } else { total };
                if remote_total > 0 && offset == remote_total {
                    Ok(Opened::Complete {
                        total: remote_total,
                    })
                } else if remote_total > 0 && offset > remote_total {
                    Ok(Opened::Restart {
                        total: remote_total,
                    })
                } else {
                    Err(FetchError::HttpStatus {
                        status: 416,
                        url: url.to_string(),
                    })
                }
            }
            _ => Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }),
        }
    }

    /// Stream one response body to disk until it ends or the governor intervenes.
    ///
    /// The first bytes are held back until they rule out the origin's
    /// sentinel. A body labelled as HTML is rejected once it proves not to be
    /// the sentinel, so a blocked address still escalates to a proxy switch.
    async fn pump(
        &self,
        response: Response,
        writer: &mut BufWriter<File>,
        written: &mut u64,
        governor: &mut ThroughputGovernor,
        ctx: &StreamContext<'_>,
    ) -> FetchResult<StreamEnd> {
        let mut stream = response.bytes_stream();
        let mut held: Option<Vec<u8>> = (ctx.check_sentinel || ctx.html.is_some()).then(Vec::new);
        let mut detector =
            CompletionDetector::new(&self.completion, self.config.stall_timeout, Instant::now());

        let period = self.config.speed_check_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    flush(writer, ctx.part).await?;
                    return Err(FetchError::Cancelled);
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        match held.as_mut() {
                            Some(buf) => {
                                buf.extend_from_slice(&bytes);
                                if buf.len() < SENTINEL_PREFIX.len() {
                                    continue;
                                }
                                if ctx.check_sentinel && buf.starts_with(SENTINEL_PREFIX) {
                                    return Err(FetchError::SentinelBody {
                                        url: ctx.url.to_string(),
                                    });
                                }
                                if let Some(content_type) = ctx.html {
                                    return Err(html_body(content_type));
                                }
                                let data = std::mem::take(buf);
                                held = None;
                                write_chunk(writer, &data, ctx.part).await?;
                                *written += data.len() as u64;
                            }
                            None => {
                                write_chunk(writer, &bytes, ctx.part).await?;
                                *written += bytes.len() as u64;
                            }
                        }
                        if let Some(cb) = ctx.progress {
                            cb(*written, ctx.total);
                        }
                    }
                    Some(Err(e)) => {
                        flush(writer, ctx.part).await?;
                        return Ok(StreamEnd::Fault(e.to_string()));
                    }
                    None => {
                        if let Some(content_type) = ctx.html {
                            return Err(html_body(content_type));
                        }
                        if let Some(buf) = held.take().filter(|b| !b.is_empty()) {
                            write_chunk(writer, &buf, ctx.part).await?;
                            *written += buf.len() as u64;
                        }
                        flush(writer, ctx.part).await?;
                        let state = detector.observe(
                            Observation {
                                bytes: *written,
                                expected: ctx.total,
                                marker_present: false,
                            },
                            Instant::now(),
                        );
                        if state != CompletionState::LikelyComplete {
                            return Ok(StreamEnd::Fault("empty body".to_string()));
                        }
                        return Ok(StreamEnd::Finished);
                    }
                },
                _ = ticker.tick() => {
                    let now = Instant::now();
                    match governor.sample(now, *written, ctx.total) {
                        GovernorAction::Continue => {}
                        GovernorAction::Refresh(reason) if ctx.ranges => {
                            flush(writer, ctx.part).await?;
                            return Ok(StreamEnd::Refresh(reason));
                        }
                        GovernorAction::Refresh(reason) => {
                            debug!(?reason, "Refresh skipped, server does not support ranges");
                        }
                        GovernorAction::Abort { bytes_per_sec } => {
                            flush(writer, ctx.part).await?;
                            return Err(FetchError::SpeedCollapse {
                                bytes_per_sec,
                                bytes: *written,
                            });
                        }
                    }
                    let observation = Observation {
                        bytes: *written,
                        expected: ctx.total,
                        marker_present: true,
                    };
                    if detector.observe(observation, now) == CompletionState::Stalled {
                        flush(writer, ctx.part).await?;
                        return Ok(StreamEnd::Fault("stream stalled".to_string()));
                    }
                }
            }
        }
    }

    async fn run(&self, request: TransferRequest<'_>) -> FetchResult<TransferReport> {
        let task = request.task;
        let url = request.url;
        let cancel = request.cancel;
        let part = task.partial_path();
        let referer = task
            .referer
            .as_deref()
            .or(self.config.default_referer.as_deref());
        let client = self.build_client(request.proxy, referer)?;

        let probe = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            probe = self.probe(&client, url) => probe?,
        };

        let mut written = partial_len(&part).await?;
        let (mut total, mut server_total) = if probe.content_length > 0 {
            (probe.content_length, true)
        } else {
            (task.expected_size, false)
        };
        let mut ranges = probe.accept_ranges;
        let mut reconnects = 0u32;
        let mut connected_once = false;
        let mut governor = ThroughputGovernor::new(&self.config, Instant::now(), written);

        info!(
            url,
            proxy = %request.proxy,
            resume_from = written,
            total,
            "Starting HTTP transfer"
        );

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            if server_total && total > 0 && written == total {
                break;
            }
            let offset = if server_total && written > total { 0 } else { written };

            let opened = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                opened = self.open(&client, url, offset, total) => opened,
            };

            let fault = match opened {
                Ok(Opened::Complete { total: remote_total }) => {
                    debug!(url, total = remote_total, "Range not satisfiable, partial is complete");
                    written = remote_total;
                    break;
                }
                Ok(Opened::Restart { total: remote_total }) => {
                    warn!(url, local = written, remote = remote_total, "Partial larger than resource, discarding");
                    open_partial(&part, 0).await?;
                    written = 0;
                    total = remote_total;
                    server_total = true;
                    "partial larger than resource".to_string()
                }
                Ok(Opened::Stream {
                    response,
                    start,
                    total: response_total,
                    partial,
                    html,
                }) => {
                    connected_once = true;
                    if response_total > 0 {
                        total = response_total;
                        server_total = true;
                    }
                    ranges |= partial;

                    let file = open_partial(&part, start).await?;
                    let mut writer = BufWriter::with_capacity(self.config.chunk_size, file);
                    written = start;
                    governor.on_reconnect(Instant::now(), written);

                    let ctx = StreamContext {
                        url,
                        part: &part,
                        total,
                        check_sentinel: !partial,
                        html: html.as_deref(),
                        ranges,
                        cancel,
                        progress: request.progress.as_ref(),
                    };
                    match self
                        .pump(response, &mut writer, &mut written, &mut governor, &ctx)
                        .await?
                    {
                        StreamEnd::Finished if server_total && written < total => {
                            format!("premature end of body at {} of {}", written, total)
                        }
                        StreamEnd::Finished => break,
                        StreamEnd::Refresh(reason) => {
                            info!(url, ?reason, bytes = written, "Refreshing connection");
                            continue;
                        }
                        StreamEnd::Fault(reason) => reason,
                    }
                }
                Err(e) if connected_once && is_mechanical(&e) => e.to_string(),
                Err(e) => return Err(e),
            };

            if reconnects >= self.config.max_reconnects {
                return Err(FetchError::Truncated {
                    url: url.to_string(),
                    bytes: written,
                    reason: fault,
                });
            }
            reconnects += 1;
            warn!(
                url,
                bytes = written,
                reconnect = reconnects,
                max = self.config.max_reconnects,
                reason = %fault,
                "Connection fault, resuming"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(self.config.reconnect_pause) => {}
            }
        }

        info!(url, bytes = written, "HTTP transfer finished");
        Ok(TransferReport {
            path: part,
            bytes: written,
        })
    }
}

impl TransferStrategy for HttpTransfer {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Http
    }

    fn transfer<'a>(&'a self, request: TransferRequest<'a>) -> BoxFuture<'a, FetchResult<TransferReport>> {
        Box::pin(self.run(request))
    }
}

/// Redirect policy that refuses to follow redirects to loopback hosts.
///
/// The stopped 3xx response is returned to the caller, which reports it as
/// [`FetchError::LoopbackRedirect`].
fn loopback_guard(max_redirects: usize) -> Policy {
    Policy::custom(move |attempt| {
        if attempt.previous().len() >= max_redirects {
            attempt.error("too many redirects")
        } else if is_loopback_url(attempt.url()) {
            attempt.stop()
        } else {
            attempt.follow()
        }
    })
}

/// Whether a URL points at a loopback or unspecified address.
pub fn is_loopback_url(url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.eq_ignore_ascii_case("localhost") || host.to_ascii_lowercase().ends_with(".localhost") {
        return true;
    }
    host.parse::<IpAddr>()
        .map(|ip| ip.is_loopback() || ip.is_unspecified())
        .unwrap_or(false)
}

fn redirect_error(response: &Response, url: &str) -> FetchError {
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|loc| response.url().join(loc).ok());
    match location {
        Some(target) if is_loopback_url(&target) => FetchError::LoopbackRedirect {
            location: target.to_string(),
        },
        _ => FetchError::HttpStatus {
            status: response.status().as_u16(),
            url: url.to_string(),
        },
    }
}

/// Content type of an HTML response, `None` for anything else.
fn html_content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|ct| ct.to_ascii_lowercase().contains("text/html"))
        .map(str::to_string)
}

fn html_body(content_type: &str) -> FetchError {
    FetchError::HtmlBody {
        content_type: content_type.to_string(),
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

/// Parse `Content-Range` into `(start, total)`; total is 0 when unknown.
fn parse_content_range(value: &str) -> (Option<u64>, u64) {
    let Some(spec) = value.trim().strip_prefix("bytes") else {
        return (None, 0);
    };
    let spec = spec.trim();
    let (range, total) = spec.split_once('/').unwrap_or((spec, "*"));
    let total = total.trim().parse().unwrap_or(0);
    let start = range
        .split_once('-')
        .and_then(|(start, _)| start.trim().parse().ok());
    (start, total)
}

fn is_mechanical(err: &FetchError) -> bool {
    matches!(
        err,
        FetchError::Connection { .. } | FetchError::Timeout { .. } | FetchError::Truncated { .. }
    )
}

async fn partial_len(path: &Path) -> FetchResult<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(source) => Err(FetchError::ReadFailed {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Open the partial for appending after truncating it to `start`.
async fn open_partial(path: &Path, start: u64) -> FetchResult<File> {
    let unwritable = |source| FetchError::Unwritable {
        path: PathBuf::from(path),
        source,
    };
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(unwritable)?;
    file.set_len(start).await.map_err(unwritable)?;
    Ok(file)
}

async fn write_chunk(writer: &mut BufWriter<File>, data: &[u8], path: &Path) -> FetchResult<()> {
    writer
        .write_all(data)
        .await
        .map_err(|source| FetchError::Unwritable {
            path: path.to_path_buf(),
            source,
        })
}

async fn flush(writer: &mut BufWriter<File>, path: &Path) -> FetchResult<()> {
    writer.flush().await.map_err(|source| FetchError::Unwritable {
        path: path.to_path_buf(),
        source,
    })
}
