// Local crates
use crate::{
    position::{
        error::StoreError,
        models::{DEFAULT_MAX_POSITION_AGE_HOURS, FilePosition},
        store::{FlushReport, PositionStore, StoreBackend},
    },
    watcher::models::LogFile,
};

// External crates
use chrono::Utc;
use std::path::Path;
use tracing::instrument;

/// Per-project view over a `PositionStore`.
///
/// The tracker is the only writer of its project's positions. It hides the
/// project key from callers and owns the load-time validity guard.
#[derive(Debug)]
pub struct PositionTracker<S = StoreBackend> {
    project_name: String,
    store: S,
    max_position_age: chrono::Duration,
}

impl<S: PositionStore> PositionTracker<S> {
    pub fn new(project_name: impl Into<String>, store: S) -> Self {
        Self {
            project_name: project_name.into(),
            store,
            max_position_age: chrono::Duration::hours(DEFAULT_MAX_POSITION_AGE_HOURS as i64),
        }
    }

    pub fn with_max_position_age(mut self, max_age: chrono::Duration) -> Self {
        self.max_position_age = max_age;
        self
    }

    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Stored offset for `file_path`, `0` when nothing was stored.
    pub async fn get_position(&mut self, file_path: &Path) -> u64 {
        self.store
            .load(file_path, &self.project_name)
            .await
            .map(|position| position.offset)
            .unwrap_or(0)
    }

    /// Record `offset` as consumed for `file_path`, stamped with the current time.
    #[instrument(
        name = "tail_agent_position::tracker::update",
        target = "position::tracker",
        skip_all,
        fields(project = %self.project_name, file = %file_path.display(), offset = offset),
        level = "trace"
    )]
    pub async fn update_position(&mut self, file_path: &Path, offset: u64) -> Result<(), StoreError> {
        let position = FilePosition::new(file_path, offset, self.project_name.as_str())?;
        self.store.save(position).await
    }

    pub async fn delete_position(&mut self, file_path: &Path) -> Result<(), StoreError> {
        self.store.delete(file_path, &self.project_name).await
    }

    pub async fn has_position(&mut self, file_path: &Path) -> bool {
        self.store.has(file_path, &self.project_name).await
    }

    /// Persist buffered positions now. A no-op for stores that write through.
    pub async fn force_save(&mut self) -> Option<FlushReport> {
        let flushable = self.store.as_flushable()?;
        Some(flushable.force_flush().await)
    }

    /// Persist buffered positions only if the store's save interval elapsed.
    pub async fn flush_if_due(&mut self) -> Option<FlushReport> {
        let flushable = self.store.as_flushable()?;
        flushable.flush_if_due().await
    }

    /// Offset to resume `file` from.
    ///
    /// A stored position is only trusted if it names the same path, does not
    /// point past the end of the file and is younger than the configured
    /// maximum age. Anything else restarts the file from offset zero.
    #[instrument(
        name = "tail_agent_position::tracker::resume",
        target = "position::tracker",
        skip_all,
        fields(project = %self.project_name, file = %file.path.display()),
        level = "debug"
    )]
    pub async fn resume_position(&mut self, file: &LogFile) -> u64 {
        let Some(stored) = self.store.load(&file.path, &self.project_name).await else {
            tracing::debug!("No stored position, starting from the beginning");
            return 0;
        };

        match stored.validate_against(&file.path, file.size, self.max_position_age, Utc::now()) {
            Ok(()) => {
                tracing::debug!(offset = stored.offset, "Resuming from stored position");
                stored.offset
            }
            Err(reason) => {
                tracing::info!(
                    reason = %reason,
                    stored_offset = stored.offset,
                    "Discarding stored position, starting from the beginning"
                );
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{cached_store::CachedStore, store::MemoryStore};
    use std::path::PathBuf;
    use std::time::Duration;

    fn log_file(path: &str, size: u64) -> LogFile {
        LogFile {
            path: PathBuf::from(path),
            filename: Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            modified_at: Utc::now(),
            size,
        }
    }

    #[tokio::test]
    async fn update_then_get_round_trips() {
        let mut tracker = PositionTracker::new("api", MemoryStore::default());
        let path = Path::new("/var/log/api/logstash-1.json");

        tracker.update_position(path, 1024).await.expect("update");
        assert_eq!(tracker.get_position(path).await, 1024);
        assert!(tracker.has_position(path).await);

        tracker.delete_position(path).await.expect("delete");
        assert_eq!(tracker.get_position(path).await, 0);
    }

    #[tokio::test]
    async fn unseen_path_starts_at_zero() {
        let mut tracker = PositionTracker::new("api", MemoryStore::default());
        assert_eq!(tracker.get_position(Path::new("/never/seen.log")).await, 0);
    }

    #[tokio::test]
    async fn offset_past_end_of_file_resumes_at_zero() {
        let mut tracker = PositionTracker::new("api", MemoryStore::default());
        let file = log_file("/var/log/api/logstash-1.json", 300);

        tracker.update_position(&file.path, 500).await.expect("update");

        assert_eq!(tracker.resume_position(&file).await, 0);
        assert_eq!(tracker.resume_position(&log_file(&file.path.to_string_lossy(), 800)).await, 500);
    }

    #[tokio::test]
    async fn stale_position_resumes_at_zero() {
        let mut tracker = PositionTracker::new("api", MemoryStore::default())
            .with_max_position_age(chrono::Duration::hours(1));
        let file = log_file("/var/log/api/app.log", 1_000);

        let old = FilePosition::with_timestamp(
            &file.path,
            200,
            "api",
            Utc::now() - chrono::Duration::hours(2),
        )
        .expect("position");
        tracker.store_mut().save(old).await.expect("seed");

        assert_eq!(tracker.get_position(&file.path).await, 200);
        assert_eq!(tracker.resume_position(&file).await, 0);
    }

    #[tokio::test]
    async fn force_save_only_applies_to_flushable_stores() {
        let mut plain = PositionTracker::new("api", MemoryStore::default());
        assert!(plain.force_save().await.is_none());

        let cached = CachedStore::new(MemoryStore::default(), Duration::from_secs(60));
        let mut tracker = PositionTracker::new("api", cached);
        tracker
            .update_position(Path::new("/a.log"), 10)
            .await
            .expect("update");

        let report = tracker.force_save().await.expect("cached store is flushable");
        assert_eq!(report.flushed, 1);
        assert_eq!(tracker.store().inner().entries["api:/a.log"].offset, 10);

        let again = tracker.force_save().await.expect("still flushable");
        assert_eq!(again, FlushReport::default());
    }
}
