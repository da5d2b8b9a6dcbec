//! Filesystem scan for browser download markers and finished files.
//!
//! Chromium writes an in-progress download to `<name>.crdownload` and renames
//! it when done. Only files touched since the attempt started are considered,
//! and files already present before navigation are excluded unless they
//! change afterwards, so leftovers from earlier downloads are never mistaken
//! for the artifact.

use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use glob::Pattern;
use tracing::trace;

/// Suffix of the engine's own HTTP partials, never picked up as artifacts.
const PARTIAL_SUFFIX: &str = ".part";

/// Files of interest found in one or more directories.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirectoryScan {
    /// In-progress marker files with their sizes.
    pub markers: Vec<(PathBuf, u64)>,
    /// Most recently modified finished file and its size.
    pub newest_final: Option<(PathBuf, u64, SystemTime)>,
}

impl DirectoryScan {
    pub fn has_marker(&self) -> bool {
        !self.markers.is_empty()
    }

    /// Bytes written so far, taken from the largest marker.
    pub fn marker_bytes(&self) -> u64 {
        self.markers.iter().map(|(_, size)| *size).max().unwrap_or(0)
    }

    /// Largest marker file, used when the browser never renamed it.
    pub fn largest_marker(&self) -> Option<&(PathBuf, u64)> {
        self.markers.iter().max_by_key(|(_, size)| *size)
    }

    /// Path and size of the newest finished file.
    pub fn final_file(&self) -> Option<(&Path, u64)> {
        self.newest_final
            .as_ref()
            .map(|(path, size, _)| (path.as_path(), *size))
    }

    /// Combine with a scan of another directory.
    ///
    /// A finished file in `self` always wins, so the destination directory
    /// takes precedence over the fallback download directory.
    pub fn merge(mut self, other: DirectoryScan) -> Self {
        self.markers.extend(other.markers);
        self.newest_final = self.newest_final.or(other.newest_final);
        self
    }
}

/// Files present before the browser was asked to navigate.
///
/// A file recorded here is ignored by later scans as long as its size and
/// modification time are unchanged.
#[derive(Clone, Debug, Default)]
pub struct Baseline {
    files: HashMap<PathBuf, (u64, SystemTime)>,
}

impl Baseline {
    /// Snapshot the regular files of every directory in `dirs`.
    pub fn capture<'a>(dirs: impl IntoIterator<Item = &'a Path>) -> Self {
        let mut files = HashMap::new();
        for dir in dirs {
            for (path, meta) in regular_files(dir) {
                if let Ok(modified) = meta.modified() {
                    files.insert(path, (meta.len(), modified));
                }
            }
        }
        trace!(count = files.len(), "Captured directory baseline");
        Self { files }
    }

    /// Whether `path` existed at capture time with the same size and mtime.
    pub fn is_unchanged(&self, path: &Path, size: u64, modified: SystemTime) -> bool {
        self.files.get(path) == Some(&(size, modified))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Regular files directly inside `dir`.
fn regular_files(dir: &Path) -> Vec<(PathBuf, Metadata)> {
    let Some(dir_str) = dir.to_str() else {
        return Vec::new();
    };
    let pattern = format!("{}/*", Pattern::escape(dir_str));
    let Ok(entries) = glob::glob(&pattern) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|path| {
            let meta = path.metadata().ok()?;
            meta.is_file().then_some((path, meta))
        })
        .collect()
}

/// Scan `dir` for markers and finished files modified at or after `since`.
///
/// # Arguments
///
/// * `dir` - Directory to scan (missing directories yield an empty scan)
/// * `marker_suffix` - Suffix of in-progress files, e.g. `.crdownload`
/// * `artifact_extension` - If set, finished files must carry this extension
/// * `since` - Ignore files last modified before this instant
/// * `baseline` - Ignore files that predate navigation and have not changed
pub fn scan_directory(
    dir: &Path,
    marker_suffix: &str,
    artifact_extension: Option<&str>,
    since: SystemTime,
    baseline: &Baseline,
) -> DirectoryScan {
    let mut scan = DirectoryScan::default();

    for (path, meta) in regular_files(dir) {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') || name.ends_with(PARTIAL_SUFFIX) {
            continue;
        }
        let Ok(modified) = meta.modified() else {
            continue;
        };
        if modified < since || baseline.is_unchanged(&path, meta.len(), modified) {
            continue;
        }

        if name.ends_with(marker_suffix) {
            trace!(path = %path.display(), size = meta.len(), "Found download marker");
            scan.markers.push((path, meta.len()));
            continue;
        }

        if let Some(ext) = artifact_extension {
            let matches = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case(ext))
                .unwrap_or(false);
            if !matches {
                continue;
            }
        }

        let newer = scan
            .newest_final
            .as_ref()
            .map(|(_, _, t)| modified > *t)
            .unwrap_or(true);
        if newer {
            scan.newest_final = Some((path, meta.len(), modified));
        }
    }

    scan
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use std::time::Duration;
    use tempfile::TempDir;

    fn since_now() -> SystemTime {
        SystemTime::now() - Duration::from_secs(10)
    }

    fn fresh_scan(dir: &Path, marker_suffix: &str, ext: Option<&str>) -> DirectoryScan {
        scan_directory(dir, marker_suffix, ext, since_now(), &Baseline::default())
    }

    #[test]
    fn test_finds_marker_and_final() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("game.apk.crdownload"), vec![0u8; 300]).unwrap();
        std::fs::write(dir.path().join("other.apk"), vec![0u8; 100]).unwrap();

        let scan = fresh_scan(dir.path(), ".crdownload", None);
        assert!(scan.has_marker());
        assert_eq!(scan.marker_bytes(), 300);
        assert_eq!(scan.final_file().unwrap().1, 100);
    }

    #[test]
    fn test_ignores_stale_hidden_and_partial_files() {
        let dir = TempDir::new().unwrap();
        let stale = dir.path().join("old.apk");
        std::fs::write(&stale, b"PK").unwrap();
        let an_hour_ago = SystemTime::now() - Duration::from_secs(3600);
        filetime::set_file_mtime(&stale, FileTime::from_system_time(an_hour_ago)).unwrap();
        std::fs::write(dir.path().join(".hidden.apk"), b"PK").unwrap();
        std::fs::write(dir.path().join("game.apk.part"), b"PK").unwrap();

        let scan = fresh_scan(dir.path(), ".crdownload", None);
        assert_eq!(scan, DirectoryScan::default());
    }

    #[test]
    fn test_extension_filter() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("readme.txt"), b"hello").unwrap();

        let scan = fresh_scan(dir.path(), ".crdownload", Some("apk"));
        assert!(scan.final_file().is_none());

        std::fs::write(dir.path().join("game.APK"), b"PK").unwrap();
        let scan = fresh_scan(dir.path(), ".crdownload", Some("apk"));
        assert!(scan.final_file().is_some());
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let scan = fresh_scan(Path::new("/nonexistent/dir"), ".crdownload", None);
        assert!(!scan.has_marker());
        assert!(scan.final_file().is_none());
    }

    #[test]
    fn test_merge_prefers_destination_final() {
        let t0 = SystemTime::now();
        let a = DirectoryScan {
            markers: vec![],
            newest_final: Some((PathBuf::from("/dest/a.apk"), 1, t0)),
        };
        let b = DirectoryScan {
            markers: vec![(PathBuf::from("/dl/b.apk.crdownload"), 5)],
            newest_final: Some((PathBuf::from("/dl/b.apk"), 2, t0 + Duration::from_secs(1))),
        };
        let merged = a.merge(b);
        assert!(merged.has_marker());
        assert_eq!(merged.final_file().unwrap().0, Path::new("/dest/a.apk"));

        let empty = DirectoryScan::default();
        let fallback = DirectoryScan {
            markers: vec![],
            newest_final: Some((PathBuf::from("/dl/b.apk"), 2, t0)),
        };
        assert_eq!(
            empty.merge(fallback).final_file().unwrap().0,
            Path::new("/dl/b.apk")
        );
    }

    #[test]
    fn test_baseline_excludes_unchanged_files() {
        let dir = TempDir::new().unwrap();
        let sibling = dir.path().join("game_a.apk");
        std::fs::write(&sibling, vec![0u8; 64]).unwrap();

        let baseline = Baseline::capture([dir.path()]);
        assert_eq!(baseline.len(), 1);
        let scan = scan_directory(dir.path(), ".crdownload", None, since_now(), &baseline);
        assert!(scan.final_file().is_none());

        // A file that changes after the snapshot counts again
        std::fs::write(&sibling, vec![0u8; 128]).unwrap();
        let scan = scan_directory(dir.path(), ".crdownload", None, since_now(), &baseline);
        assert_eq!(scan.final_file().unwrap().1, 128);
    }

    #[test]
    fn test_directory_with_glob_metacharacters() {
        let base = TempDir::new().unwrap();
        let dir = base.path().join("apps [beta]");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("game.apk"), b"PK").unwrap();

        let scan = fresh_scan(&dir, ".crdownload", None);
        assert!(scan.final_file().is_some());
    }
}
