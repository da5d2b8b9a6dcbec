//! Retry state and the pure failure policy.
//!
//! Strategy and endpoint are orthogonal retry axes. A failure is first
//! absorbed by the current strategy (browser attempts fall back to HTTP),
//! then by backoff on the current endpoint, and finally by switching to the
//! next untried proxy. `on_failure` only updates counters and returns a
//! decision; the session performs it.

use std::collections::HashSet;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::FetchError;
use crate::proxy::ProxyDescriptor;
use crate::transfer::StrategyKind;

// =============================================================================
// Retry Policy Constants
// =============================================================================

/// Default upper bound for the backoff delay (32 seconds).
pub const DEFAULT_BACKOFF_CAP_SECS: u64 = 32;

/// Limits applied by [`RetryState::on_failure`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// HTTP failures tolerated on one endpoint; the next one switches proxy.
    pub max_attempts_per_endpoint: u32,
    /// Upper bound for the backoff delay.
    pub backoff_cap: Duration,
    /// Browser failures tolerated before falling back to HTTP.
    pub browser_max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts_per_endpoint: 5,
            backoff_cap: Duration::from_secs(DEFAULT_BACKOFF_CAP_SECS),
            browser_max_attempts: 1,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts_per_endpoint: config.retry.max_attempts_per_endpoint,
            backoff_cap: config.retry.backoff_cap,
            browser_max_attempts: config.browser.max_attempts.max(1),
        }
    }

    /// Delay before the retry following the `failures`-th failure:
    /// `min(2^(failures-1), cap)` seconds.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let secs = 1u64.checked_shl(failures - 1).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(self.backoff_cap)
    }
}

/// What the session should do after a failed attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry with the same strategy and endpoint after waiting.
    Retry { delay: Duration },
    /// Continue on the same endpoint with the HTTP strategy, immediately.
    FallBackToHttp,
    /// Move to the next untried proxy.
    SwitchProxy,
    /// The failure cannot be fixed by retrying.
    GiveUp,
}

/// Retry bookkeeping for one session.
#[derive(Debug)]
pub struct RetryState {
    /// Attempts made in this session. Never reset.
    pub attempt_count: u32,
    /// HTTP failures on the current endpoint. Reset on proxy switch.
    pub endpoint_attempts: u32,
    /// Connection failures among `endpoint_attempts`.
    pub endpoint_connection_failures: u32,
    /// Ordinal of the current endpoint within this session (0 = first).
    pub current_proxy_index: usize,
    pub current_proxy: ProxyDescriptor,
    pub current_strategy: StrategyKind,
    /// Browser failures so far.
    pub browser_failures: u32,
    pub last_error: Option<FetchError>,
    tried: HashSet<ProxyDescriptor>,
}

impl RetryState {
    /// Start on `first_proxy` with `strategy`.
    pub fn new(first_proxy: ProxyDescriptor, strategy: StrategyKind) -> Self {
        let mut tried = HashSet::new();
        tried.insert(first_proxy.clone());
        Self {
            attempt_count: 0,
            endpoint_attempts: 0,
            endpoint_connection_failures: 0,
            current_proxy_index: 0,
            current_proxy: first_proxy,
            current_strategy: strategy,
            browser_failures: 0,
            last_error: None,
            tried,
        }
    }

    /// Record a failed attempt and decide what to do next.
    pub fn on_failure(&mut self, error: FetchError, policy: &RetryPolicy) -> RetryDecision {
        self.attempt_count += 1;

        let decision = if !error.is_retryable() {
            RetryDecision::GiveUp
        } else if self.current_strategy == StrategyKind::Browser {
            self.browser_failures += 1;
            if matches!(error, FetchError::NoDownloadSignal { .. })
                || self.browser_failures >= policy.browser_max_attempts
            {
                RetryDecision::FallBackToHttp
            } else {
                RetryDecision::Retry {
                    delay: policy.backoff_delay(self.browser_failures),
                }
            }
        } else {
            self.endpoint_attempts += 1;
            if error.is_connection_failure() {
                self.endpoint_connection_failures += 1;
            }
            if error.escalates() || self.endpoint_attempts > policy.max_attempts_per_endpoint {
                RetryDecision::SwitchProxy
            } else {
                RetryDecision::Retry {
                    delay: policy.backoff_delay(self.endpoint_attempts),
                }
            }
        };

        self.last_error = Some(error);
        decision
    }

    /// Switch the remaining attempts to HTTP.
    pub fn fall_back_to_http(&mut self) {
        self.current_strategy = StrategyKind::Http;
    }

    /// Whether `proxy` was already used in this session.
    pub fn was_tried(&self, proxy: &ProxyDescriptor) -> bool {
        self.tried.contains(proxy)
    }

    /// Whether every attempt on the current endpoint failed to connect.
    pub fn endpoint_unreachable(&self) -> bool {
        self.endpoint_attempts > 0 && self.endpoint_connection_failures == self.endpoint_attempts
    }

    /// Move to a new endpoint. Per-endpoint counters reset; the attempt
    /// count does not. Proxies are only used with the HTTP strategy.
    pub fn switch_endpoint(&mut self, proxy: ProxyDescriptor) {
        self.tried.insert(proxy.clone());
        self.current_proxy = proxy;
        self.current_proxy_index += 1;
        self.endpoint_attempts = 0;
        self.endpoint_connection_failures = 0;
        self.current_strategy = StrategyKind::Http;
    }

    /// Human-readable description of the last failure.
    pub fn last_reason(&self) -> String {
        self.last_error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt made".to_string())
    }
}
