// Local crates
use crate::watcher::models::LogFile;

// External crates
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::instrument;

const READ_BUFFER_SIZE: usize = 16384;

/// Reads the bytes appended to a log file since a known offset.
///
/// Lines are split on `\n`, decoded lossily as UTF-8, and blank or
/// whitespace-only lines are dropped. Read failures are logged and produce no
/// lines; the caller retries on its next tick with the offset unchanged.
#[derive(Debug, Clone, Default)]
pub struct TailReader;

impl TailReader {
    pub fn new() -> Self {
        Self
    }

    /// Everything from `from_offset` to the current end of `file`.
    pub async fn read_new(&self, file: &LogFile, from_offset: u64) -> Vec<String> {
        self.read_lines(&file.path, from_offset, u64::MAX).await
    }

    /// Exactly the bytes in `[from, to)`.
    ///
    /// Content appended after `to` is left for the next read, so it is never
    /// consumed ahead of the offset that will be recorded for it.
    pub async fn read_range(&self, path: &Path, from: u64, to: u64) -> Vec<String> {
        if to <= from {
            return Vec::new();
        }
        self.read_lines(path, from, to - from).await
    }

    /// `read_range` that reports I/O failures instead of swallowing them, for
    /// callers that must not advance past bytes they failed to read.
    pub async fn try_read_range(&self, path: &Path, from: u64, to: u64) -> std::io::Result<Vec<String>> {
        if to <= from {
            return Ok(Vec::new());
        }
        Ok(split_lines(&read_bytes(path, from, to - from).await?))
    }

    /// Current size of `path`, re-read from the filesystem on every call.
    pub async fn get_size(&self, path: &Path) -> std::io::Result<u64> {
        Ok(fs::metadata(path).await?.len())
    }

    #[instrument(
        name = "tail_agent_tailer::read",
        target = "tailer::reader",
        skip_all,
        fields(file = %path.display(), from = from, limit = limit),
        level = "trace"
    )]
    async fn read_lines(&self, path: &Path, from: u64, limit: u64) -> Vec<String> {
        match read_bytes(path, from, limit).await {
            Ok(bytes) => {
                let lines = split_lines(&bytes);
                tracing::trace!(bytes = bytes.len(), lines = lines.len(), "Read appended content");
                lines
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read log file, retrying next tick");
                Vec::new()
            }
        }
    }
}

async fn read_bytes(path: &Path, from: u64, limit: u64) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(from)).await?;

    let mut reader = file.take(limit);
    let mut bytes = Vec::new();
    let mut chunk = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        bytes.extend_from_slice(&chunk[..n]);
    }

    Ok(bytes)
}

fn split_lines(bytes: &[u8]) -> Vec<String> {
    bytes
        .split(|b| *b == b'\n')
        .map(String::from_utf8_lossy)
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.trim_end_matches('\r').to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn snapshot(path: &Path) -> LogFile {
        let metadata = std::fs::metadata(path).expect("metadata");
        LogFile::from_metadata(path, &metadata).expect("log file")
    }

    fn append(path: &Path, content: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open for append");
        file.write_all(content.as_bytes()).expect("append");
    }

    #[tokio::test]
    async fn reading_at_end_of_file_yields_nothing() {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("app.log");
        append(&path, "one\ntwo\n");

        let reader = TailReader::new();
        let size = reader.get_size(&path).await.expect("size");

        assert!(reader.read_new(&snapshot(&path), size).await.is_empty());
    }

    #[tokio::test]
    async fn blank_lines_are_dropped() {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("app.log");
        append(&path, "first\n\n   \nsecond\r\n\nthird");

        let lines = TailReader::new().read_new(&snapshot(&path), 0).await;
        assert_eq!(lines, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn appended_bytes_are_read_from_previous_end() {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("app.log");

        // 20 lines of 50 bytes each
        let line = format!("{}\n", "x".repeat(49));
        append(&path, &line.repeat(20));

        let reader = TailReader::new();
        assert_eq!(reader.get_size(&path).await.expect("size"), 1000);

        let appended = format!("{}\n", "y".repeat(49));
        append(&path, &appended);
        let size = reader.get_size(&path).await.expect("size");
        assert_eq!(size, 1050);

        let lines = reader.read_range(&path, 1000, size).await;
        assert_eq!(lines, vec!["y".repeat(49)]);
    }

    #[tokio::test]
    async fn range_stops_at_upper_bound() {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("app.log");
        append(&path, "alpha\nbeta\ngamma\n");

        let reader = TailReader::new();
        assert_eq!(reader.read_range(&path, 0, 11).await, vec!["alpha", "beta"]);
        assert_eq!(reader.read_range(&path, 11, 17).await, vec!["gamma"]);
        assert!(reader.read_range(&path, 17, 17).await.is_empty());
    }

    #[tokio::test]
    async fn missing_file_yields_nothing_and_size_errors() {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("gone.log");
        let reader = TailReader::new();

        assert!(reader.read_range(&path, 0, 100).await.is_empty());
        assert!(reader.try_read_range(&path, 0, 100).await.is_err());
        assert!(reader.get_size(&path).await.is_err());
    }
}
