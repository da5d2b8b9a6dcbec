//! Download task description and terminal outcome.

use std::path::{Path, PathBuf};

/// A request to fetch one artifact to a local path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadTask {
    /// Origin URL. May be an indirection link that needs browser resolution.
    pub source_url: String,
    /// Expected size in bytes. 0 means unknown.
    pub expected_size: u64,
    /// Final location of the artifact.
    pub destination: PathBuf,
    /// Referer header sent with HTTP requests.
    pub referer: Option<String>,
    /// Optional lowercase hex SHA-256 digest of the artifact.
    pub expected_sha256: Option<String>,
}

impl DownloadTask {
    /// Create a task with unknown size.
    pub fn new(source_url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source_url: source_url.into(),
            expected_size: 0,
            destination: destination.into(),
            referer: None,
            expected_sha256: None,
        }
    }

    /// Set the expected size hint.
    pub fn with_expected_size(mut self, bytes: u64) -> Self {
        self.expected_size = bytes;
        self
    }

    /// Set the Referer header.
    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    /// Require the artifact to match a SHA-256 digest.
    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.expected_sha256 = Some(digest.into().to_ascii_lowercase());
        self
    }

    /// Expected size, or `None` when unknown.
    pub fn size_hint(&self) -> Option<u64> {
        (self.expected_size > 0).then_some(self.expected_size)
    }

    /// Path of the in-progress HTTP partial next to the destination.
    pub fn partial_path(&self) -> PathBuf {
        partial_path_for(&self.destination)
    }

    /// Directory containing the destination.
    pub fn destination_dir(&self) -> &Path {
        match self.destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }
}

/// `<destination>.part`
pub fn partial_path_for(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

/// Terminal result of a download session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The artifact is at `path` and passed validation.
    Completed { path: PathBuf, size_bytes: u64 },
    /// A failure no retry can fix (unwritable destination, cancellation).
    FailedPermanently { reason: String },
    /// Every strategy and endpoint was tried.
    FailedRetryableExhausted { reason: String },
}

impl Outcome {
    /// Whether the artifact was delivered.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Failure reason, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Completed { .. } => None,
            Self::FailedPermanently { reason } | Self::FailedRetryableExhausted { reason } => {
                Some(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_path_appends_suffix() {
        let task = DownloadTask::new("http://origin/a", "/data/apps/game.apk");
        assert_eq!(task.partial_path(), PathBuf::from("/data/apps/game.apk.part"));
        assert_eq!(task.destination_dir(), Path::new("/data/apps"));
    }

    #[test]
    fn test_relative_destination_dir() {
        let task = DownloadTask::new("http://origin/a", "game.apk");
        assert_eq!(task.destination_dir(), Path::new("."));
    }

    #[test]
    fn test_size_hint() {
        let task = DownloadTask::new("u", "d");
        assert_eq!(task.size_hint(), None);
        assert_eq!(task.with_expected_size(42).size_hint(), Some(42));
    }

    #[test]
    fn test_outcome_reason() {
        let done = Outcome::Completed {
            path: PathBuf::from("a"),
            size_bytes: 1,
        };
        assert!(done.is_completed());
        assert_eq!(done.reason(), None);

        let failed = Outcome::FailedRetryableExhausted {
            reason: "all endpoints blocked".to_string(),
        };
        assert!(!failed.is_completed());
        assert_eq!(failed.reason(), Some("all endpoints blocked"));
    }
}
