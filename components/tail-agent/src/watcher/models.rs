// External crates
use chrono::{DateTime, Utc};
use std::fs::Metadata;
use std::path::{Path, PathBuf};

/// Immutable snapshot of a candidate log file, taken during a directory scan.
///
/// A `LogFile` is never updated in place: every scan produces fresh snapshots.
/// Two snapshots describe the same file when their `path`s are equal, and the
/// newer of two files is the one with the greater `modified_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    pub path: PathBuf,
    pub filename: String,
    pub modified_at: DateTime<Utc>,
    pub size: u64,
}

impl LogFile {
    /// Build a snapshot from already fetched metadata.
    ///
    /// Returns `None` when the platform cannot report a modification time,
    /// since such a file can never take part in newest-file selection.
    pub fn from_metadata(path: &Path, metadata: &Metadata) -> Option<Self> {
        let modified = metadata.modified().ok()?;
        let filename = path.file_name()?.to_string_lossy().into_owned();

        Some(Self {
            path: path.to_path_buf(),
            filename,
            modified_at: DateTime::<Utc>::from(modified),
            size: metadata.len(),
        })
    }

    /// `true` when `self` was modified strictly after `other`.
    pub fn is_newer_than(&self, other: &LogFile) -> bool {
        self.modified_at > other.modified_at
    }
}
