// Local crates
use crate::watcher::{models::LogFile, pattern::PatternMatcher};

// External crates
use std::path::{Path, PathBuf};
use tracing::instrument;
use walkdir::WalkDir;

/// Lists configured log directories and returns the files matching a
/// project's pattern.
///
/// Scans are shallow (only direct children of a directory) and never fail: a
/// directory that is missing or unreadable produces an empty result so the
/// remaining directories of a project keep being monitored.
#[derive(Debug, Clone, Default)]
pub struct DirectoryScanner;

impl DirectoryScanner {
    pub fn new() -> Self {
        Self
    }

    /// Scan a single directory.
    #[instrument(
        name = "tail_agent_discovery::scan",
        target = "watcher::discovery",
        skip_all,
        fields(directory = %directory.display(), log_pattern = matcher.as_str()),
        level = "debug"
    )]
    pub fn scan(&self, directory: &Path, matcher: &PatternMatcher) -> Vec<LogFile> {
        let mut found = Vec::new();

        for entry in build_walker(directory) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    // Depth 0 errors mean the directory itself is unavailable
                    if e.depth() == 0 {
                        tracing::warn!(
                            error = %e,
                            "Log directory is not accessible, skipping it for this scan"
                        );
                        return Vec::new();
                    }
                    tracing::debug!(error = %e, "Skipping unreadable directory entry");
                    continue;
                }
            };

            let filename = entry.file_name().to_string_lossy();
            if !matcher.is_match(&filename) {
                continue;
            }

            if let Some(file) = regular_file(entry.path()) {
                found.push(file);
            }
        }

        tracing::debug!(candidates = found.len(), "Directory scan complete");
        found
    }

    /// Scan every directory in order and aggregate the candidates.
    ///
    /// Aggregation follows the configured directory order, which keeps
    /// newest-file tie-breaking reproducible.
    pub fn scan_all(&self, directories: &[PathBuf], matcher: &PatternMatcher) -> Vec<LogFile> {
        directories
            .iter()
            .flat_map(|dir| self.scan(dir, matcher))
            .collect()
    }
}

fn build_walker(directory: &Path) -> walkdir::IntoIter {
    WalkDir::new(directory)
        .follow_links(false)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
}

/// Snapshot `path` when it resolves to a regular file.
///
/// Symlinks are followed for the type check, so a link to a log file is kept
/// while a link to a directory is dropped.
fn regular_file(path: &Path) -> Option<LogFile> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!(
                error = %e,
                path = %path.display(),
                "Failed to get file metadata, skipping candidate"
            );
            return None;
        }
    };

    if !metadata.is_file() {
        return None;
    }

    LogFile::from_metadata(path, &metadata)
}
