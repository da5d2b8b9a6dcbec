//! Throughput governor for a streaming connection.
//!
//! The origin throttles long-lived connections instead of closing them. The
//! governor is sampled once per measurement window and decides whether the
//! connection should keep streaming, be replaced by a fresh Range request,
//! or be given up entirely.
//!
//! Decisions in priority order:
//!
//! 1. **Abort** when the window speed is below the minimum acceptable speed
//!    and less than `abort_ceiling` of the total has been written.
//! 2. **Refresh (degraded)** after `degradation_windows` consecutive windows
//!    below `degradation_ratio` of the connection's initial speed. The
//!    initial speed is the mean of the first two windows of a connection.
//! 3. **Refresh (scheduled)** once the connection is older than
//!    `refresh_interval` while less than `refresh_ceiling` has been written.
//!
//! Rules 1 and 3 need a known total.

use std::time::{Duration, Instant};

use crate::config::HttpConfig;

/// Windows averaged to establish the initial speed of a connection.
const INITIAL_WINDOWS: usize = 2;

/// Why a connection should be replaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshReason {
    Degraded,
    Scheduled,
}

/// Decision for one measurement window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GovernorAction {
    Continue,
    Refresh(RefreshReason),
    Abort { bytes_per_sec: f64 },
}

/// Per-connection throughput governor.
#[derive(Debug)]
pub struct ThroughputGovernor {
    min_speed: f64,
    degradation_ratio: f64,
    degradation_windows: u32,
    refresh_interval: Duration,
    refresh_ceiling: f64,
    abort_ceiling: f64,

    connected_at: Instant,
    window_start: Instant,
    window_bytes: u64,
    early_speeds: Vec<f64>,
    initial_speed: Option<f64>,
    degraded_windows: u32,
}

impl ThroughputGovernor {
    /// Create a governor for a connection opened at `now` with
    /// `downloaded` bytes already on disk.
    pub fn new(config: &HttpConfig, now: Instant, downloaded: u64) -> Self {
        Self {
            min_speed: config.min_speed_bytes_per_sec,
            degradation_ratio: config.degradation_ratio,
            degradation_windows: config.degradation_windows.max(1),
            refresh_interval: config.refresh_interval,
            refresh_ceiling: config.refresh_ceiling,
            abort_ceiling: config.abort_ceiling,
            connected_at: now,
            window_start: now,
            window_bytes: downloaded,
            early_speeds: Vec::with_capacity(INITIAL_WINDOWS),
            initial_speed: None,
            degraded_windows: 0,
        }
    }

    /// Reset per-connection state after a reconnect.
    pub fn on_reconnect(&mut self, now: Instant, downloaded: u64) {
        self.connected_at = now;
        self.window_start = now;
        self.window_bytes = downloaded;
        self.early_speeds.clear();
        self.initial_speed = None;
        self.degraded_windows = 0;
    }

    /// Close the current window and decide what to do.
    ///
    /// # Arguments
    ///
    /// * `now` - End of the window
    /// * `downloaded` - Bytes on disk, including any resumed prefix
    /// * `expected_total` - Total size, 0 if unknown
    pub fn sample(&mut self, now: Instant, downloaded: u64, expected_total: u64) -> GovernorAction {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed.is_zero() {
            return GovernorAction::Continue;
        }

        let speed = downloaded.saturating_sub(self.window_bytes) as f64 / elapsed.as_secs_f64();
        self.window_start = now;
        self.window_bytes = downloaded;

        let fraction = (expected_total > 0).then(|| downloaded as f64 / expected_total as f64);

        if let Some(fraction) = fraction {
            if speed < self.min_speed && fraction < self.abort_ceiling {
                return GovernorAction::Abort {
                    bytes_per_sec: speed,
                };
            }
        }

        match self.initial_speed {
            None => {
                self.early_speeds.push(speed);
                if self.early_speeds.len() >= INITIAL_WINDOWS {
                    let mean =
                        self.early_speeds.iter().sum::<f64>() / self.early_speeds.len() as f64;
                    self.initial_speed = Some(mean);
                }
            }
            Some(initial) => {
                if speed < initial * self.degradation_ratio {
                    self.degraded_windows += 1;
                    if self.degraded_windows >= self.degradation_windows {
                        self.degraded_windows = 0;
                        return GovernorAction::Refresh(RefreshReason::Degraded);
                    }
                } else {
                    self.degraded_windows = 0;
                }
            }
        }

        if let Some(fraction) = fraction {
            let age = now.saturating_duration_since(self.connected_at);
            if fraction < self.refresh_ceiling && age >= self.refresh_interval {
                return GovernorAction::Refresh(RefreshReason::Scheduled);
            }
        }

        GovernorAction::Continue
    }

    /// Mean speed of the first windows, once established.
    pub fn initial_speed(&self) -> Option<f64> {
        self.initial_speed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIB;

    const WINDOW: Duration = Duration::from_secs(30);

    fn governor(start: Instant) -> ThroughputGovernor {
        ThroughputGovernor::new(&HttpConfig::default(), start, 0)
    }

    #[test]
    fn test_healthy_connection_continues() {
        let start = Instant::now();
        let mut g = governor(start);
        // 1 MiB/s for one window of a 1 GiB file
        let action = g.sample(start + WINDOW, 30 * MIB, 1024 * MIB);
        assert_eq!(action, GovernorAction::Continue);
    }

    #[test]
    fn test_slow_connection_aborts() {
        let start = Instant::now();
        let mut g = governor(start);
        // 1 MiB in 30s is ~0.033 MiB/s
        match g.sample(start + WINDOW, MIB, 100 * MIB) {
            GovernorAction::Abort { bytes_per_sec } => {
                assert!(bytes_per_sec < 0.1 * MIB as f64)
            }
            other => panic!("expected abort, got {:?}", other),
        }
    }

    #[test]
    fn test_slow_near_end_does_not_abort() {
        let start = Instant::now();
        let mut g = ThroughputGovernor::new(&HttpConfig::default(), start, 95 * MIB);
        let action = g.sample(start + WINDOW, 95 * MIB + 1024, 100 * MIB);
        assert_eq!(action, GovernorAction::Continue);
    }

    #[test]
    fn test_unknown_total_never_aborts() {
        let start = Instant::now();
        let mut g = governor(start);
        assert_eq!(g.sample(start + WINDOW, 10, 0), GovernorAction::Continue);
    }

    #[test]
    fn test_degradation_triggers_refresh_after_two_windows() {
        let start = Instant::now();
        let mut g = governor(start);
        let total = 10_000 * MIB;
        let mut bytes = 0;
        let mut t = start;

        // Two windows at 2 MiB/s establish the initial speed
        for _ in 0..2 {
            t += WINDOW;
            bytes += 60 * MIB;
            assert_eq!(g.sample(t, bytes, total), GovernorAction::Continue);
        }
        assert!(g.initial_speed().is_some());

        // 0.5 MiB/s is below half the initial speed but above the minimum
        t += WINDOW;
        bytes += 15 * MIB;
        assert_eq!(g.sample(t, bytes, total), GovernorAction::Continue);

        t += WINDOW;
        bytes += 15 * MIB;
        // Connection is now 120s old; degradation outranks the schedule
        assert_eq!(
            g.sample(t, bytes, total),
            GovernorAction::Refresh(RefreshReason::Degraded)
        );
    }

    #[test]
    fn test_scheduled_refresh_after_interval() {
        let start = Instant::now();
        let mut g = governor(start);
        let total = 10_000 * MIB;
        let mut bytes = 0;
        let mut t = start;
        for _ in 0..3 {
            t += WINDOW;
            bytes += 30 * MIB;
            assert_eq!(g.sample(t, bytes, total), GovernorAction::Continue);
        }
        t += WINDOW;
        bytes += 30 * MIB;
        assert_eq!(
            g.sample(t, bytes, total),
            GovernorAction::Refresh(RefreshReason::Scheduled)
        );
    }

    #[test]
    fn test_no_scheduled_refresh_near_completion() {
        let start = Instant::now();
        let mut g = ThroughputGovernor::new(&HttpConfig::default(), start, 96 * MIB);
        let action = g.sample(start + Duration::from_secs(150), 99 * MIB, 100 * MIB);
        assert_eq!(action, GovernorAction::Continue);
    }

    #[test]
    fn test_reconnect_resets_initial_speed() {
        let start = Instant::now();
        let mut g = governor(start);
        g.sample(start + WINDOW, 30 * MIB, 0);
        g.sample(start + WINDOW * 2, 60 * MIB, 0);
        assert!(g.initial_speed().is_some());

        g.on_reconnect(start + WINDOW * 2, 60 * MIB);
        assert!(g.initial_speed().is_none());
    }
}
