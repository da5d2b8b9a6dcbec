//! Artifact integrity gate.
//!
//! The origin serves error pages and sentinel bodies with a 200 status, so a
//! finished transfer proves nothing by itself. The validator inspects the
//! leading bytes and size of the file and, when a digest is known, its
//! SHA-256 checksum.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::IntegrityConfig;
use crate::error::{FetchError, FetchResult};

/// Leading bytes of a ZIP container.
pub const ARCHIVE_MAGIC: &[u8] = b"PK";

/// Body prefix the origin sends to blocked addresses.
pub const SENTINEL_PREFIX: &[u8] = b"error";

/// Why a file was rejected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// The file does not exist.
    Missing,
    /// Smaller than the minimum size and not an archive.
    TooSmall { size: u64 },
    /// The origin's blocked-address sentinel.
    Sentinel,
    /// Leading bytes are not the archive magic.
    NotArchive,
    /// Below the completeness ratio of the expected size.
    Incomplete { size: u64, expected: u64 },
    /// SHA-256 digest differs from the expected one.
    ChecksumMismatch { expected: String, actual: String },
}

impl RejectReason {
    /// Whether the rejection was caused by the origin's sentinel body.
    pub fn is_sentinel(&self) -> bool {
        matches!(self, Self::Sentinel)
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "file is missing"),
            Self::TooSmall { size } => write!(f, "file too small ({} bytes), likely an error page", size),
            Self::Sentinel => write!(f, "origin sentinel body"),
            Self::NotArchive => write!(f, "not a package archive"),
            Self::Incomplete { size, expected } => {
                write!(f, "incomplete ({} of {} bytes)", size, expected)
            }
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch (expected {}, got {})", expected, actual)
            }
        }
    }
}

/// Result of validating a file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Valid { size: u64 },
    Invalid { reason: RejectReason },
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }

    /// Convert a rejection into an integrity error for `path`.
    pub fn into_result(self, path: &Path) -> FetchResult<u64> {
        match self {
            Self::Valid { size } => Ok(size),
            Self::Invalid { reason: RejectReason::Sentinel } => Err(FetchError::SentinelBody {
                url: path.display().to_string(),
            }),
            Self::Invalid { reason } => Err(FetchError::Integrity {
                path: path.to_path_buf(),
                reason: reason.to_string(),
            }),
        }
    }
}

/// Validates that a file is a genuine package archive.
#[derive(Clone, Debug)]
pub struct IntegrityValidator {
    min_size: u64,
    completeness_ratio: f64,
}

impl Default for IntegrityValidator {
    fn default() -> Self {
        Self::new(&IntegrityConfig::default())
    }
}

impl IntegrityValidator {
    pub fn new(config: &IntegrityConfig) -> Self {
        Self {
            min_size: config.min_size,
            completeness_ratio: config.completeness_ratio,
        }
    }

    /// Validate a file.
    ///
    /// # Arguments
    ///
    /// * `path` - File to inspect
    /// * `expected` - Expected size in bytes, 0 if unknown
    /// * `sha256` - Optional lowercase hex digest
    ///
    /// # Errors
    ///
    /// Returns an error only when the file exists but cannot be read.
    pub fn validate(&self, path: &Path, expected: u64, sha256: Option<&str>) -> FetchResult<Verdict> {
        let size = match path.metadata() {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return Ok(invalid(RejectReason::Missing)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(invalid(RejectReason::Missing))
            }
            Err(source) => {
                return Err(FetchError::ReadFailed {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let read_failed = |source| FetchError::ReadFailed {
            path: path.to_path_buf(),
            source,
        };
        let mut file = File::open(path).map_err(read_failed)?;
        let mut header = Vec::with_capacity(SENTINEL_PREFIX.len());
        (&mut file)
            .take(SENTINEL_PREFIX.len() as u64)
            .read_to_end(&mut header)
            .map_err(read_failed)?;

        let verdict = self.judge(&header, size, expected);
        if !verdict.is_valid() {
            debug!(path = %path.display(), size, ?verdict, "Artifact rejected");
            return Ok(verdict);
        }

        if let Some(expected_digest) = sha256 {
            // Continue from the header on the same handle.
            let mut hasher = Sha256::new();
            hasher.update(&header);
            io::copy(&mut file, &mut hasher).map_err(read_failed)?;
            let actual = format!("{:x}", hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected_digest) {
                return Ok(invalid(RejectReason::ChecksumMismatch {
                    expected: expected_digest.to_string(),
                    actual,
                }));
            }
        }

        Ok(verdict)
    }

    /// Apply the header and size rules to already-read data.
    pub fn judge(&self, header: &[u8], size: u64, expected: u64) -> Verdict {
        let is_archive = header.starts_with(ARCHIVE_MAGIC);

        if size < self.min_size && !is_archive {
            if header.starts_with(SENTINEL_PREFIX) {
                return invalid(RejectReason::Sentinel);
            }
            return invalid(RejectReason::TooSmall { size });
        }
        if header.starts_with(SENTINEL_PREFIX) {
            return invalid(RejectReason::Sentinel);
        }
        if !is_archive {
            return invalid(RejectReason::NotArchive);
        }
        if expected > 0 && (size as f64) < expected as f64 * self.completeness_ratio {
            return invalid(RejectReason::Incomplete { size, expected });
        }

        Verdict::Valid { size }
    }
}

fn invalid(reason: RejectReason) -> Verdict {
    Verdict::Invalid { reason }
}
