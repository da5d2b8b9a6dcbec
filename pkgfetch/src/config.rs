//! Engine configuration.
//!
//! `EngineConfig` combines the settings of every component. All values have
//! defaults tuned for a throttling origin; an INI file can override any of
//! them:
//!
//! ```ini
//! [http]
//! min_speed_bytes_per_sec = 104857
//! refresh_interval_secs = 120
//!
//! [browser]
//! debugger_url = http://127.0.0.1:9222
//!
//! [retry]
//! max_attempts_per_endpoint = 5
//!
//! [proxy]
//! list_file = /etc/pkgfetch/proxies.txt
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::{Ini, Properties};

use crate::error::{FetchError, FetchResult};

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Minimum acceptable throughput (0.1 MiB/s).
pub const DEFAULT_MIN_SPEED_BYTES_PER_SEC: f64 = 0.1 * MIB as f64;

/// Lowest configurable minimum speed, one byte per second.
pub const MIN_SPEED_FLOOR: f64 = 1.0;

/// Floor for every computed transfer timeout.
pub const DEFAULT_BASE_TIMEOUT_SECS: u64 = 600;

/// Upper bound for the browser wait.
pub const DEFAULT_BROWSER_MAX_WAIT_SECS: u64 = 7200;

/// Indirection URL fragment that needs JavaScript to reveal the real link.
pub const DEFAULT_INDIRECTION_PATTERN: &str = "/adown/";

/// Settings for the HTTP transfer strategy.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    /// Write buffer size for the streamed body.
    pub chunk_size: usize,
    /// Minimum acceptable throughput in bytes per second.
    pub min_speed_bytes_per_sec: f64,
    /// Length of one throughput measurement window.
    pub speed_check_interval: Duration,
    /// Below this fraction of the initial speed a window counts as degraded.
    pub degradation_ratio: f64,
    /// Consecutive degraded windows that trigger a reconnect.
    pub degradation_windows: u32,
    /// Connection age that triggers a scheduled reconnect.
    pub refresh_interval: Duration,
    /// Scheduled refresh only happens below this fraction of the total.
    pub refresh_ceiling: f64,
    /// Speed abort only happens below this fraction of the total.
    pub abort_ceiling: f64,
    /// Floor for the computed request timeout.
    pub base_timeout: Duration,
    /// Safety factor applied to the estimated transfer time.
    pub timeout_factor: f64,
    /// Range-resume reconnects after mechanical faults within one attempt.
    pub max_reconnects: u32,
    /// A stream with no growth for this long counts as a mechanical fault.
    pub stall_timeout: Duration,
    /// Pause before a mechanical reconnect.
    pub reconnect_pause: Duration,
    /// Timeout of the metadata probe.
    pub probe_timeout: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Redirect hops followed before giving up.
    pub max_redirects: usize,
    /// Referer used when the task carries none.
    pub default_referer: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16 * 1024,
            min_speed_bytes_per_sec: DEFAULT_MIN_SPEED_BYTES_PER_SEC,
            speed_check_interval: Duration::from_secs(30),
            degradation_ratio: 0.5,
            degradation_windows: 2,
            refresh_interval: Duration::from_secs(120),
            refresh_ceiling: 0.95,
            abort_ceiling: 0.9,
            base_timeout: Duration::from_secs(DEFAULT_BASE_TIMEOUT_SECS),
            timeout_factor: 1.5,
            max_reconnects: 5,
            stall_timeout: Duration::from_secs(60),
            reconnect_pause: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            max_redirects: 10,
            default_referer: None,
        }
    }
}

impl HttpConfig {
    /// Compute the request timeout for the given number of remaining bytes.
    ///
    /// `max(base_timeout, remaining / min_speed * timeout_factor)`; unknown
    /// sizes (0) get the base timeout.
    pub fn timeout_for(&self, remaining_bytes: u64) -> Duration {
        if remaining_bytes == 0 || self.min_speed_bytes_per_sec <= 0.0 {
            return self.base_timeout;
        }
        let estimated = remaining_bytes as f64 / self.min_speed_bytes_per_sec;
        let scaled = Duration::try_from_secs_f64(estimated * self.timeout_factor)
            .unwrap_or(Duration::MAX);
        scaled.max(self.base_timeout)
    }
}

/// Settings for the browser-driven strategy.
#[derive(Clone, Debug)]
pub struct BrowserConfig {
    /// DevTools HTTP endpoint. `None` disables the browser strategy.
    pub debugger_url: Option<String>,
    /// Filesystem poll tick.
    pub poll_interval: Duration,
    /// Time allowed for any download intent to show up.
    pub intent_timeout: Duration,
    /// Time allowed for the resolve-only mode to capture a URL.
    pub resolve_timeout: Duration,
    /// Marker persistence tolerated after 100 % progress.
    pub marker_grace: Duration,
    /// Delay before re-checking the marker after a "completed" event.
    pub completed_settle: Duration,
    /// Debounce re-check before trusting a vanished marker.
    pub marker_debounce: Duration,
    /// Floor of the overall wait.
    pub base_wait: Duration,
    /// Cap of the overall wait, including extensions.
    pub max_wait: Duration,
    /// Extension applied while the transfer is alive.
    pub wait_extension: Duration,
    /// Progress this recent counts as alive.
    pub liveness_window: Duration,
    /// Suffix of the in-progress marker file.
    pub marker_suffix: String,
    /// Extension the final artifact must carry, if any.
    pub artifact_extension: Option<String>,
    /// Slack applied to the attempt start when filtering files by mtime.
    pub mtime_slack: Duration,
    /// Platform download directory checked as a fallback.
    pub fallback_download_dir: Option<PathBuf>,
    /// Browser attempts before falling back to HTTP.
    pub max_attempts: u32,
    /// URL fragments that mark indirection links needing resolution.
    pub indirection_patterns: Vec<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            debugger_url: None,
            poll_interval: Duration::from_millis(500),
            intent_timeout: Duration::from_secs(30),
            resolve_timeout: Duration::from_secs(10),
            marker_grace: Duration::from_secs(10),
            completed_settle: Duration::from_millis(1500),
            marker_debounce: Duration::from_millis(500),
            base_wait: Duration::from_secs(DEFAULT_BASE_TIMEOUT_SECS),
            max_wait: Duration::from_secs(DEFAULT_BROWSER_MAX_WAIT_SECS),
            wait_extension: Duration::from_secs(300),
            liveness_window: Duration::from_secs(60),
            marker_suffix: ".crdownload".to_string(),
            artifact_extension: None,
            mtime_slack: Duration::from_secs(10),
            fallback_download_dir: dirs::download_dir(),
            max_attempts: 1,
            indirection_patterns: vec![DEFAULT_INDIRECTION_PATTERN.to_string()],
        }
    }
}

impl BrowserConfig {
    /// Initial wait bound for an artifact of the given size.
    ///
    /// `max(base_wait, min(estimated, max_wait))` where the estimate assumes
    /// the minimum acceptable speed.
    pub fn wait_bound(&self, expected_size: u64, min_speed_bytes_per_sec: f64) -> Duration {
        if expected_size == 0 || min_speed_bytes_per_sec <= 0.0 {
            return self.base_wait;
        }
        let estimated = Duration::try_from_secs_f64(expected_size as f64 / min_speed_bytes_per_sec)
            .unwrap_or(Duration::MAX);
        estimated.min(self.max_wait).max(self.base_wait)
    }

    /// Whether a URL is an indirection link.
    pub fn is_indirection(&self, url: &str) -> bool {
        self.indirection_patterns.iter().any(|p| url.contains(p.as_str()))
    }
}

/// Settings for the session retry loop.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// HTTP failures tolerated on one endpoint before switching proxy.
    pub max_attempts_per_endpoint: u32,
    /// Upper bound for the exponential backoff.
    pub backoff_cap: Duration,
    /// Remove proxies whose every attempt failed to connect.
    pub drop_unreachable_proxies: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_endpoint: 5,
            backoff_cap: Duration::from_secs(32),
            drop_unreachable_proxies: true,
        }
    }
}

/// Settings for the completion heuristics.
#[derive(Clone, Debug)]
pub struct CompletionConfig {
    /// Interval between stability samples.
    pub stability_poll: Duration,
    /// Unchanged samples needed when no size hint exists.
    pub stable_polls_required: u32,
    /// Minimum elapsed time before the stability heuristic may fire.
    pub min_elapsed: Duration,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            stability_poll: Duration::from_secs(2),
            stable_polls_required: 5,
            min_elapsed: Duration::from_secs(30),
        }
    }
}

/// Settings for the integrity gate and partial-file policy.
#[derive(Clone, Debug)]
pub struct IntegrityConfig {
    /// Below this size a file is assumed to be an error page.
    pub min_size: u64,
    /// Fraction of the expected size a file must reach.
    pub completeness_ratio: f64,
    /// Partials smaller than this may be discarded after a failure.
    pub keep_partial_min: u64,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            min_size: 1024,
            completeness_ratio: 0.95,
            keep_partial_min: MIB,
        }
    }
}

/// Complete engine configuration.
#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    pub http: HttpConfig,
    pub browser: BrowserConfig,
    pub retry: RetryConfig,
    pub completion: CompletionConfig,
    pub integrity: IntegrityConfig,
    /// Proxy descriptors, one per entry. Empty means direct only.
    pub proxies: Vec<String>,
    /// With no proxies configured, look for a proxy listening on a
    /// well-known loopback port and add it to the pool.
    pub detect_local_proxy: bool,
}

impl EngineConfig {
    /// Enable the browser strategy against a DevTools endpoint.
    pub fn with_debugger_url(mut self, url: impl Into<String>) -> Self {
        self.browser.debugger_url = Some(url.into());
        self
    }

    /// Replace the proxy list.
    pub fn with_proxies<I, S>(mut self, proxies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.proxies = proxies.into_iter().map(Into::into).collect();
        self
    }

    /// Load configuration from an INI file, starting from the defaults.
    pub fn load(path: &Path) -> FetchResult<Self> {
        let ini = Ini::load_from_file(path)
            .map_err(|e| FetchError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        Self::from_ini(&ini)
    }

    /// Parse configuration from INI text.
    pub fn from_ini_str(text: &str) -> FetchResult<Self> {
        let ini = Ini::load_from_str(text).map_err(|e| FetchError::InvalidConfig(e.to_string()))?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> FetchResult<Self> {
        let mut config = Self::default();

        if let Some(section) = ini.section(Some("http")) {
            let http = &mut config.http;
            set_parsed(section, "chunk_size", &mut http.chunk_size)?;
            set_parsed(
                section,
                "min_speed_bytes_per_sec",
                &mut http.min_speed_bytes_per_sec,
            )?;
            if !http.min_speed_bytes_per_sec.is_finite()
                || http.min_speed_bytes_per_sec < MIN_SPEED_FLOOR
            {
                return Err(FetchError::InvalidConfig(format!(
                    "min_speed_bytes_per_sec must be at least {}",
                    MIN_SPEED_FLOOR
                )));
            }
            set_period(section, "speed_check_interval_secs", &mut http.speed_check_interval)?;
            set_parsed(section, "degradation_ratio", &mut http.degradation_ratio)?;
            check_ratio("degradation_ratio", http.degradation_ratio)?;
            set_parsed(section, "degradation_windows", &mut http.degradation_windows)?;
            set_period(section, "refresh_interval_secs", &mut http.refresh_interval)?;
            set_period(section, "base_timeout_secs", &mut http.base_timeout)?;
            set_parsed(section, "max_reconnects", &mut http.max_reconnects)?;
            set_period(section, "stall_timeout_secs", &mut http.stall_timeout)?;
            set_period(section, "probe_timeout_secs", &mut http.probe_timeout)?;
            set_parsed(section, "max_redirects", &mut http.max_redirects)?;
            if let Some(referer) = section.get("default_referer") {
                http.default_referer = Some(referer.to_string());
            }
        }

        if let Some(section) = ini.section(Some("browser")) {
            let browser = &mut config.browser;
            if let Some(url) = section.get("debugger_url") {
                browser.debugger_url = (!url.trim().is_empty()).then(|| url.trim().to_string());
            }
            set_period(section, "intent_timeout_secs", &mut browser.intent_timeout)?;
            set_secs(section, "marker_grace_secs", &mut browser.marker_grace)?;
            set_period(section, "base_wait_secs", &mut browser.base_wait)?;
            set_period(section, "max_wait_secs", &mut browser.max_wait)?;
            set_parsed(section, "max_attempts", &mut browser.max_attempts)?;
            if let Some(suffix) = section.get("marker_suffix") {
                browser.marker_suffix = suffix.to_string();
            }
            if let Some(ext) = section.get("artifact_extension") {
                browser.artifact_extension = Some(ext.trim_start_matches('.').to_string());
            }
            if let Some(dir) = section.get("fallback_download_dir") {
                browser.fallback_download_dir = Some(PathBuf::from(dir));
            }
            if let Some(patterns) = section.get("indirection_patterns") {
                browser.indirection_patterns = patterns
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect();
            }
        }

        if let Some(section) = ini.section(Some("retry")) {
            let retry = &mut config.retry;
            set_parsed(
                section,
                "max_attempts_per_endpoint",
                &mut retry.max_attempts_per_endpoint,
            )?;
            set_secs(section, "backoff_cap_secs", &mut retry.backoff_cap)?;
            set_parsed(
                section,
                "drop_unreachable_proxies",
                &mut retry.drop_unreachable_proxies,
            )?;
        }

        if let Some(section) = ini.section(Some("completion")) {
            let completion = &mut config.completion;
            set_period(section, "stability_poll_secs", &mut completion.stability_poll)?;
            set_parsed(
                section,
                "stable_polls_required",
                &mut completion.stable_polls_required,
            )?;
            set_secs(section, "min_elapsed_secs", &mut completion.min_elapsed)?;
        }

        if let Some(section) = ini.section(Some("integrity")) {
            let integrity = &mut config.integrity;
            set_parsed(section, "min_size", &mut integrity.min_size)?;
            set_parsed(section, "completeness_ratio", &mut integrity.completeness_ratio)?;
            check_ratio("completeness_ratio", integrity.completeness_ratio)?;
            set_parsed(section, "keep_partial_min", &mut integrity.keep_partial_min)?;
        }

        if let Some(section) = ini.section(Some("proxy")) {
            set_parsed(section, "detect_local", &mut config.detect_local_proxy)?;
            if let Some(single) = section.get("proxy") {
                config.proxies.push(single.to_string());
            }
            if let Some(list_file) = section.get("list_file") {
                let path = PathBuf::from(list_file);
                let text = std::fs::read_to_string(&path)
                    .map_err(|source| FetchError::ReadFailed { path, source })?;
                config.proxies.extend(text.lines().map(String::from));
            }
        }

        Ok(config)
    }
}

fn set_parsed<T: FromStr>(section: &Properties, key: &str, target: &mut T) -> FetchResult<()> {
    if let Some(raw) = section.get(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| FetchError::InvalidConfig(format!("{} = {:?}", key, raw)))?;
    }
    Ok(())
}

/// Like [`set_secs`], but zero is rejected; used for polling periods and timeouts.
fn set_period(section: &Properties, key: &str, target: &mut Duration) -> FetchResult<()> {
    set_secs(section, key, target)?;
    if target.is_zero() {
        return Err(FetchError::InvalidConfig(format!("{} must be > 0", key)));
    }
    Ok(())
}

fn check_ratio(key: &str, value: f64) -> FetchResult<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(FetchError::InvalidConfig(format!("{} must be in (0, 1]", key)))
    }
}

fn set_secs(section: &Properties, key: &str, target: &mut Duration) -> FetchResult<()> {
    let mut secs = target.as_secs_f64();
    set_parsed(section, key, &mut secs)?;
    if secs < 0.0 || !secs.is_finite() {
        return Err(FetchError::InvalidConfig(format!("{} must be >= 0", key)));
    }
    *target = Duration::from_secs_f64(secs);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_timeout_floor() {
        let http = HttpConfig::default();
        assert_eq!(http.timeout_for(0), Duration::from_secs(600));
        // 10 MiB at 0.1 MiB/s = 100s, * 1.5 = 150s, below the floor
        assert_eq!(http.timeout_for(10 * MIB), Duration::from_secs(600));
    }

    #[test]
    fn test_http_timeout_scales_with_size() {
        let http = HttpConfig::default();
        // 100 MiB at 0.1 MiB/s = 1000s, * 1.5 = 1500s
        let timeout = http.timeout_for(100 * MIB);
        assert!((timeout.as_secs_f64() - 1500.0).abs() < 1.0);
    }

    #[test]
    fn test_browser_wait_bound() {
        let browser = BrowserConfig::default();
        let speed = DEFAULT_MIN_SPEED_BYTES_PER_SEC;
        assert_eq!(browser.wait_bound(0, speed), Duration::from_secs(600));
        assert_eq!(browser.wait_bound(10 * MIB, speed), Duration::from_secs(600));
        let mid = browser.wait_bound(200 * MIB, speed);
        assert!((mid.as_secs_f64() - 2000.0).abs() < 1.0);
        assert_eq!(
            browser.wait_bound(10_000 * MIB, speed),
            Duration::from_secs(7200)
        );
    }

    #[test]
    fn test_indirection_detection() {
        let browser = BrowserConfig::default();
        assert!(browser.is_indirection("https://api.example.com/adown/12345"));
        assert!(!browser.is_indirection("https://cdn.example.com/pkg.apk"));
    }

    #[test]
    fn test_from_ini_overrides() {
        let config = EngineConfig::from_ini_str(
            "[http]\nrefresh_interval_secs = 60\nmax_reconnects = 3\n\
             [browser]\ndebugger_url = http://127.0.0.1:9333\nartifact_extension = .apk\n\
             [retry]\nmax_attempts_per_endpoint = 2\n\
             [proxy]\nproxy = 10.0.0.1:8080\n",
        )
        .unwrap();

        assert_eq!(config.http.refresh_interval, Duration::from_secs(60));
        assert_eq!(config.http.max_reconnects, 3);
        assert_eq!(
            config.browser.debugger_url.as_deref(),
            Some("http://127.0.0.1:9333")
        );
        assert_eq!(config.browser.artifact_extension.as_deref(), Some("apk"));
        assert_eq!(config.retry.max_attempts_per_endpoint, 2);
        assert_eq!(config.proxies, vec!["10.0.0.1:8080".to_string()]);
        // Untouched values keep their defaults
        assert_eq!(config.http.chunk_size, 16 * 1024);
    }

    #[test]
    fn test_from_ini_rejects_malformed_values() {
        let result = EngineConfig::from_ini_str("[retry]\nmax_attempts_per_endpoint = many\n");
        assert!(matches!(result, Err(FetchError::InvalidConfig(_))));
    }

    #[test]
    fn test_from_ini_rejects_zero_periods() {
        for text in [
            "[http]\nspeed_check_interval_secs = 0\n",
            "[http]\nrefresh_interval_secs = 0\n",
            "[completion]\nstability_poll_secs = 0\n",
        ] {
            let result = EngineConfig::from_ini_str(text);
            assert!(matches!(result, Err(FetchError::InvalidConfig(_))), "{}", text);
        }
    }

    #[test]
    fn test_from_ini_rejects_unusable_speed() {
        for speed in ["0", "-5", "1e-300", "NaN", "inf"] {
            let text = format!("[http]\nmin_speed_bytes_per_sec = {}\n", speed);
            let result = EngineConfig::from_ini_str(&text);
            assert!(matches!(result, Err(FetchError::InvalidConfig(_))), "{}", speed);
        }
        let config = EngineConfig::from_ini_str("[http]\nmin_speed_bytes_per_sec = 2048\n").unwrap();
        assert_eq!(config.http.min_speed_bytes_per_sec, 2048.0);
    }

    #[test]
    fn test_from_ini_rejects_ratio_out_of_range() {
        let result = EngineConfig::from_ini_str("[integrity]\ncompleteness_ratio = 1.5\n");
        assert!(matches!(result, Err(FetchError::InvalidConfig(_))));
    }

    #[test]
    fn test_timeout_saturates_for_tiny_speed() {
        let http = HttpConfig {
            min_speed_bytes_per_sec: 1e-300,
            ..HttpConfig::default()
        };
        assert_eq!(http.timeout_for(u64::MAX), Duration::MAX);
        let browser = BrowserConfig::default();
        assert_eq!(browser.wait_bound(u64::MAX, 1e-300), browser.max_wait);
    }

    #[test]
    fn test_detect_local_flag() {
        assert!(!EngineConfig::default().detect_local_proxy);
        let config = EngineConfig::from_ini_str("[proxy]\ndetect_local = true\n").unwrap();
        assert!(config.detect_local_proxy);
    }

    #[test]
    fn test_default_has_no_browser() {
        let config = EngineConfig::default();
        assert!(config.browser.debugger_url.is_none());
        assert!(config.proxies.is_empty());
    }
}
