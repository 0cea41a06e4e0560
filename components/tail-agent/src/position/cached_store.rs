// Local crates
use crate::{
    metrics::metrics::{POSITION_FLUSHES_TOTAL, POSITION_FLUSH_FAILURES_TOTAL},
    position::{
        error::StoreError,
        models::{FilePosition, cache_key},
        store::{FlushReport, Flushable, PositionStore},
    },
};

// External crates
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::instrument;

/// Write-behind cache in front of another `PositionStore`.
///
/// Every save lands in memory and marks its key dirty. Dirty entries reach the
/// wrapped store in bursts: when `save_interval` has passed since the timer was
/// seeded, or when a flush is forced (shutdown). This bounds position I/O to
/// about one burst per interval for busy logs while reads stay in memory.
///
/// Timer semantics:
/// - the first save after a flush only seeds the timer, it never flushes;
/// - a later save (or `flush_if_due`) flushes once the interval has elapsed;
/// - every flush clears the timer, so the next save seeds it again.
///
/// Invariant: each key in `dirty` has an entry in `cache`.
#[derive(Debug)]
pub struct CachedStore<S> {
    inner: S,
    cache: HashMap<String, FilePosition>,
    dirty: HashSet<String>,
    last_flush: Option<Instant>,
    save_interval: Duration,
}

impl<S: PositionStore> CachedStore<S> {
    pub fn new(inner: S, save_interval: Duration) -> Self {
        Self {
            inner,
            cache: HashMap::new(),
            dirty: HashSet::new(),
            last_flush: None,
            save_interval,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    fn flush_due(&self) -> bool {
        matches!(self.last_flush, Some(seeded) if seeded.elapsed() >= self.save_interval)
    }

    async fn maybe_flush(&mut self) {
        match self.last_flush {
            None => {
                self.last_flush = Some(Instant::now());
                tracing::trace!(
                    save_interval_secs = self.save_interval.as_secs_f64(),
                    "Seeded position flush timer"
                );
            }
            Some(_) if self.flush_due() => {
                self.flush_dirty().await;
            }
            Some(_) => {}
        }
    }

    #[instrument(
        name = "tail_agent_position::cached_store::flush",
        target = "position::cached_store",
        skip_all,
        fields(dirty = self.dirty.len()),
        level = "debug"
    )]
    async fn flush_dirty(&mut self) -> FlushReport {
        let mut keys: Vec<String> = self.dirty.iter().cloned().collect();
        keys.sort();

        let mut report = FlushReport::default();

        for key in keys {
            let Some(position) = self.cache.get(&key).cloned() else {
                self.dirty.remove(&key);
                continue;
            };
            let project = position.project_name.clone();

            match self.inner.save(position).await {
                Ok(()) => {
                    self.dirty.remove(&key);
                    report.flushed += 1;
                    POSITION_FLUSHES_TOTAL.with_label_values(&[project.as_str()]).inc();
                }
                Err(e) => {
                    report.failed += 1;
                    POSITION_FLUSH_FAILURES_TOTAL
                        .with_label_values(&[project.as_str()])
                        .inc();
                    tracing::warn!(
                        error = %e,
                        position_key = %key,
                        "Failed to flush cached position, will retry on next flush"
                    );
                }
            }
        }

        self.last_flush = None;

        tracing::debug!(
            flushed = report.flushed,
            failed = report.failed,
            "Cached positions flushed"
        );
        report
    }
}

impl<S: PositionStore> PositionStore for CachedStore<S> {
    async fn save(&mut self, position: FilePosition) -> Result<(), StoreError> {
        let key = cache_key(&position.project_name, &position.file_path);
        self.cache.insert(key.clone(), position);
        self.dirty.insert(key);
        self.maybe_flush().await;
        Ok(())
    }

    async fn load(&mut self, file_path: &Path, project_name: &str) -> Option<FilePosition> {
        let key = cache_key(project_name, file_path);
        if let Some(position) = self.cache.get(&key) {
            return Some(position.clone());
        }

        let position = self.inner.load(file_path, project_name).await?;
        self.cache.insert(key, position.clone());
        Some(position)
    }

    async fn load_all(&mut self, project_name: &str) -> Vec<FilePosition> {
        let mut merged: HashMap<String, FilePosition> = self
            .inner
            .load_all(project_name)
            .await
            .into_iter()
            .map(|p| (cache_key(&p.project_name, &p.file_path), p))
            .collect();

        for (key, position) in &self.cache {
            if position.project_name == project_name {
                merged.insert(key.clone(), position.clone());
            }
        }

        let mut positions: Vec<FilePosition> = merged.into_values().collect();
        positions.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        positions
    }

    async fn delete(&mut self, file_path: &Path, project_name: &str) -> Result<(), StoreError> {
        let key = cache_key(project_name, file_path);
        self.cache.remove(&key);
        self.dirty.remove(&key);
        self.inner.delete(file_path, project_name).await
    }

    async fn delete_all(&mut self, project_name: &str) -> Result<(), StoreError> {
        self.cache
            .retain(|_, position| position.project_name != project_name);
        let cache = &self.cache;
        self.dirty.retain(|key| cache.contains_key(key));
        self.inner.delete_all(project_name).await
    }

    async fn has(&mut self, file_path: &Path, project_name: &str) -> bool {
        self.cache.contains_key(&cache_key(project_name, file_path))
            || self.inner.has(file_path, project_name).await
    }

    fn as_flushable(&mut self) -> Option<&mut dyn Flushable> {
        Some(self)
    }
}

impl<S: PositionStore> Flushable for CachedStore<S> {
    fn force_flush(&mut self) -> BoxFuture<'_, FlushReport> {
        Box::pin(self.flush_dirty())
    }

    fn flush_if_due(&mut self) -> BoxFuture<'_, Option<FlushReport>> {
        Box::pin(async move {
            if self.flush_due() {
                Some(self.flush_dirty().await)
            } else {
                None
            }
        })
    }

    fn dirty_count(&self) -> usize {
        self.dirty.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::store::MemoryStore;

    fn position(path: &str, offset: u64) -> FilePosition {
        FilePosition::new(path, offset, "api").expect("position")
    }

    fn cached(interval_secs: u64) -> CachedStore<MemoryStore> {
        CachedStore::new(MemoryStore::default(), Duration::from_secs(interval_secs))
    }

    #[tokio::test(start_paused = true)]
    async fn first_save_seeds_timer_without_flushing() {
        let mut store = cached(2);

        store.save(position("/p1.log", 10)).await.expect("save");

        assert_eq!(store.inner().saves, 0);
        assert_eq!(store.dirty_count(), 1);
        assert!(store.last_flush.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn interval_elapsed_flushes_all_dirty_entries() {
        let mut store = cached(2);

        // t=0: seeds the timer
        store.save(position("/p1.log", 10)).await.expect("save");
        tokio::time::advance(Duration::from_secs(1)).await;

        // t=1: interval not elapsed
        store.save(position("/p2.log", 20)).await.expect("save");
        assert_eq!(store.inner().saves, 0);
        tokio::time::advance(Duration::from_secs(2)).await;

        // t=3: due
        let report = store.flush_if_due().await.expect("flush was due");
        assert_eq!(report, FlushReport { flushed: 2, failed: 0 });

        let inner = store.inner();
        assert_eq!(inner.entries.len(), 2);
        assert_eq!(inner.entries["api:/p1.log"].offset, 10);
        assert_eq!(inner.entries["api:/p2.log"].offset, 20);
        assert_eq!(store.dirty_count(), 0);
        assert!(store.last_flush.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn save_after_interval_triggers_flush() {
        let mut store = cached(2);

        store.save(position("/p1.log", 10)).await.expect("save");
        tokio::time::advance(Duration::from_secs(3)).await;
        store.save(position("/p1.log", 15)).await.expect("save");

        assert_eq!(store.inner().saves, 1);
        assert_eq!(store.inner().entries["api:/p1.log"].offset, 15);
        assert_eq!(store.dirty_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_if_due_does_not_seed_timer() {
        let mut store = cached(1);
        tokio::time::advance(Duration::from_secs(5)).await;

        assert!(store.flush_if_due().await.is_none());
        assert!(store.last_flush.is_none());
    }

    #[tokio::test]
    async fn force_flush_is_idempotent() {
        let mut store = cached(60);
        store.save(position("/p1.log", 10)).await.expect("save");
        store.save(position("/p2.log", 20)).await.expect("save");

        let first = store.force_flush().await;
        assert_eq!(first.flushed, 2);
        assert_eq!(store.inner().saves, 2);

        let second = store.force_flush().await;
        assert_eq!(second, FlushReport::default());
        assert_eq!(store.inner().saves, 2);
        assert_eq!(store.dirty_count(), 0);
    }

    #[tokio::test]
    async fn failed_flush_keeps_entries_dirty_for_retry() {
        let mut store = cached(60);
        store.save(position("/p1.log", 10)).await.expect("save");

        store.inner_mut().fail_saves = true;
        let report = store.force_flush().await;
        assert_eq!(report, FlushReport { flushed: 0, failed: 1 });
        assert_eq!(store.dirty_count(), 1);

        store.inner_mut().fail_saves = false;
        let report = store.force_flush().await;
        assert_eq!(report.flushed, 1);
        assert_eq!(store.dirty_count(), 0);
        assert_eq!(store.inner().entries["api:/p1.log"].offset, 10);
    }

    #[tokio::test]
    async fn cache_is_authoritative_and_populated_on_miss() {
        let mut inner = MemoryStore::default();
        inner
            .save(position("/old.log", 99))
            .await
            .expect("seed inner store");

        let mut store = CachedStore::new(inner, Duration::from_secs(60));

        // Miss: loaded from inner and cached, not dirty
        let loaded = store.load(Path::new("/old.log"), "api").await.expect("hit");
        assert_eq!(loaded.offset, 99);
        assert_eq!(store.cached_count(), 1);
        assert_eq!(store.dirty_count(), 0);

        // Newer in-memory value wins over the stale inner copy
        store.save(position("/old.log", 120)).await.expect("save");
        let loaded = store.load(Path::new("/old.log"), "api").await.expect("hit");
        assert_eq!(loaded.offset, 120);
        assert_eq!(store.inner().entries["api:/old.log"].offset, 99);
    }

    #[tokio::test]
    async fn delete_evicts_cache_and_dirty_set() {
        let mut store = cached(60);
        store.save(position("/p1.log", 10)).await.expect("save");
        store.save(position("/p2.log", 20)).await.expect("save");

        store.delete(Path::new("/p1.log"), "api").await.expect("delete");
        assert_eq!(store.dirty_count(), 1);
        assert!(!store.has(Path::new("/p1.log"), "api").await);

        store.delete_all("api").await.expect("delete_all");
        assert_eq!(store.dirty_count(), 0);
        assert!(store.load_all("api").await.is_empty());
    }
}
