//! Tracing subscriber setup for embedding applications.
//!
//! The engine itself only emits `tracing` events. Applications that do not
//! install their own subscriber can call [`init_logging`] once at startup.
//! The filter is read from `PKGFETCH_LOG`, then `RUST_LOG`, then
//! [`LogOptions::default_level`].

use std::io;
use std::path::PathBuf;

use time::macros::format_description;
use time::UtcOffset;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the engine's log filter.
pub const LOG_ENV_VAR: &str = "PKGFETCH_LOG";

/// Errors that can occur while installing the subscriber.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("subscriber init failed: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
    #[error("cannot create log directory: {0}")]
    Io(#[from] io::Error),
}

/// Logging options.
#[derive(Clone, Debug)]
pub struct LogOptions {
    /// Filter directive used when no environment filter is set.
    pub default_level: String,
    /// Emit to stderr.
    pub console: bool,
    /// Colourise console output.
    pub use_color: bool,
    /// Directory for daily rolling log files. `None` disables file output.
    pub log_dir: Option<PathBuf>,
    /// File name prefix for rolling log files.
    pub file_prefix: String,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
            console: true,
            use_color: true,
            log_dir: None,
            file_prefix: "pkgfetch.log".to_string(),
        }
    }
}

impl LogOptions {
    /// Also write to daily rolling files in `dir`.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Set the fallback filter directive.
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.default_level = level.into();
        self
    }
}

/// Build the filter from the environment or the fallback directive.
pub fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install the global subscriber.
///
/// Returns the file writer guard when file output is enabled; log lines are
/// flushed when it is dropped, so keep it alive for the program's lifetime.
///
/// # Errors
///
/// Fails if a global subscriber is already installed or the log directory
/// cannot be created.
pub fn init_logging(options: LogOptions) -> Result<Option<WorkerGuard>, LogError> {
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    let timer = OffsetTime::new(
        offset,
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"),
    );

    let console_layer = options.console.then(|| {
        fmt::layer()
            .with_timer(timer.clone())
            .with_target(true)
            .with_ansi(options.use_color)
            .with_writer(io::stderr)
    });

    let (file_layer, guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = rolling::daily(dir, &options.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_timer(timer)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(build_filter(&options.default_level))
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = LogOptions::default();
        assert_eq!(options.default_level, "info");
        assert!(options.console);
        assert!(options.log_dir.is_none());
    }

    #[test]
    fn test_builder() {
        let options = LogOptions::default()
            .with_level("pkgfetch=debug")
            .with_log_dir("/var/log/pkgfetch");
        assert_eq!(options.default_level, "pkgfetch=debug");
        assert_eq!(options.log_dir, Some(PathBuf::from("/var/log/pkgfetch")));
    }

    #[test]
    fn test_build_filter_accepts_directive() {
        let filter = build_filter("pkgfetch=trace");
        // Whatever the environment holds, a filter is always produced
        assert!(!filter.to_string().is_empty());
    }
}
