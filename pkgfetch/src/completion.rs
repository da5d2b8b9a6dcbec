//! Completion detection from unreliable signals.
//!
//! Neither the origin's sizes nor the browser's progress events can be
//! trusted on their own. The detector combines the bytes on disk, the size
//! hint and the presence of an in-progress marker into one of three states:
//!
//! ```text
//! Running ──(marker gone, bytes > 0)────────────► LikelyComplete
//!    │    ──(no hint, size stable 5 polls, >30s)─► LikelyComplete
//!    └────(no growth, no marker change > bound)─► Stalled
//! ```
//!
//! The detector is clock-free: callers pass `now` so tests can drive it
//! with synthetic instants.

use std::time::{Duration, Instant};

use crate::config::CompletionConfig;

/// One observation of an in-flight transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Observation {
    /// Bytes currently on disk.
    pub bytes: u64,
    /// Expected size, 0 if unknown.
    pub expected: u64,
    /// Whether the in-progress marker (temporary file or open stream) exists.
    pub marker_present: bool,
}

/// Detector verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionState {
    Running,
    LikelyComplete,
    Stalled,
}

/// Stateful completion detector for one attempt.
#[derive(Debug)]
pub struct CompletionDetector {
    stability_poll: Duration,
    stable_polls_required: u32,
    min_elapsed: Duration,
    stall_bound: Duration,
    started: Instant,
    last_bytes: u64,
    last_marker: Option<bool>,
    last_change: Instant,
    last_stability_sample: Instant,
    stable_polls: u32,
}

impl CompletionDetector {
    /// Create a detector for an attempt starting at `started`.
    ///
    /// # Arguments
    ///
    /// * `config` - Stability heuristic settings
    /// * `stall_bound` - Time without growth or marker change that counts as a stall
    /// * `started` - Start of the attempt
    pub fn new(config: &CompletionConfig, stall_bound: Duration, started: Instant) -> Self {
        Self {
            stability_poll: config.stability_poll,
            stable_polls_required: config.stable_polls_required,
            min_elapsed: config.min_elapsed,
            stall_bound,
            started,
            last_bytes: 0,
            last_marker: None,
            last_change: started,
            last_stability_sample: started,
            stable_polls: 0,
        }
    }

    /// Feed an observation and get the current verdict.
    pub fn observe(&mut self, obs: Observation, now: Instant) -> CompletionState {
        let changed = obs.bytes != self.last_bytes || self.last_marker != Some(obs.marker_present);
        if changed {
            self.last_change = now;
        }

        if now.saturating_duration_since(self.last_stability_sample) >= self.stability_poll {
            if obs.bytes == self.last_bytes && obs.bytes > 0 {
                self.stable_polls += 1;
            } else {
                self.stable_polls = 0;
            }
            self.last_stability_sample = now;
        } else if obs.bytes != self.last_bytes {
            self.stable_polls = 0;
        }

        self.last_bytes = obs.bytes;
        self.last_marker = Some(obs.marker_present);

        if !obs.marker_present && obs.bytes > 0 {
            return CompletionState::LikelyComplete;
        }

        if obs.expected == 0
            && obs.bytes > 0
            && self.stable_polls >= self.stable_polls_required
            && now.saturating_duration_since(self.started) > self.min_elapsed
        {
            return CompletionState::LikelyComplete;
        }

        if now.saturating_duration_since(self.last_change) > self.stall_bound {
            return CompletionState::Stalled;
        }

        CompletionState::Running
    }

    /// Instant of the last growth or marker change.
    pub fn last_progress(&self) -> Instant {
        self.last_change
    }

    /// Whether progress was seen within `window` of `now`.
    pub fn progressed_within(&self, window: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_change) <= window
    }
}
