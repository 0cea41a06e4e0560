// Local crates
use crate::{
    helpers::load_config::{PositionStorageConfig, StorageKind},
    position::{
        async_file_store::AsyncFileStore, cached_store::CachedStore, error::StoreError,
        file_store::SyncFileStore, models::FilePosition, sqlite_store::SqliteStore,
    },
};

// External crates
use futures::future::BoxFuture;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

/// Durable mapping from `(project, file path)` to the last consumed offset.
///
/// Reads never fail: a missing, unreadable or corrupt entry is reported as
/// absent so a damaged position file only costs a re-read from offset zero.
/// Mutating methods take `&mut self`; a store has exactly one owner, the
/// `PositionTracker` of one project.
pub trait PositionStore: Send {
    /// Upsert `position` under `(project_name, file_path)`.
    fn save(&mut self, position: FilePosition) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn load(
        &mut self,
        file_path: &Path,
        project_name: &str,
    ) -> impl Future<Output = Option<FilePosition>> + Send;

    fn load_all(&mut self, project_name: &str) -> impl Future<Output = Vec<FilePosition>> + Send;

    fn delete(
        &mut self,
        file_path: &Path,
        project_name: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn delete_all(&mut self, project_name: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn has(&mut self, file_path: &Path, project_name: &str) -> impl Future<Output = bool> + Send;

    /// Batching capability, if this backend buffers writes.
    fn as_flushable(&mut self) -> Option<&mut dyn Flushable> {
        None
    }
}

/// Implemented only by stores that hold writes in memory before persisting.
pub trait Flushable: Send {
    /// Persist every dirty entry now. Failures stay dirty and are retried on
    /// the next flush; they are never returned to the caller.
    fn force_flush(&mut self) -> BoxFuture<'_, FlushReport>;

    /// Flush only when the save interval has elapsed since the timer was
    /// seeded. Returns `None` when no flush was due.
    fn flush_if_due(&mut self) -> BoxFuture<'_, Option<FlushReport>>;

    fn dirty_count(&self) -> usize;
}

/// Outcome of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub flushed: usize,
    pub failed: usize,
}

/// Non-caching backends, the ones a `CachedStore` can wrap.
#[derive(Debug)]
pub enum DurableStore {
    File(SyncFileStore),
    AsyncFile(AsyncFileStore),
    Sqlite(SqliteStore),
}

impl DurableStore {
    pub fn open(kind: StorageKind, path: &Path) -> Result<Self, StoreError> {
        match kind {
            StorageKind::File => Ok(Self::File(SyncFileStore::new(path))),
            StorageKind::AsyncFile => Ok(Self::AsyncFile(AsyncFileStore::new(path))),
            StorageKind::Sqlite => Ok(Self::Sqlite(SqliteStore::open(path)?)),
            StorageKind::Cached => Err(StoreError::NestedCache),
        }
    }
}

impl PositionStore for DurableStore {
    async fn save(&mut self, position: FilePosition) -> Result<(), StoreError> {
        match self {
            Self::File(store) => store.save(position).await,
            Self::AsyncFile(store) => store.save(position).await,
            Self::Sqlite(store) => store.save(position).await,
        }
    }

    async fn load(&mut self, file_path: &Path, project_name: &str) -> Option<FilePosition> {
        match self {
            Self::File(store) => store.load(file_path, project_name).await,
            Self::AsyncFile(store) => store.load(file_path, project_name).await,
            Self::Sqlite(store) => store.load(file_path, project_name).await,
        }
    }

    async fn load_all(&mut self, project_name: &str) -> Vec<FilePosition> {
        match self {
            Self::File(store) => store.load_all(project_name).await,
            Self::AsyncFile(store) => store.load_all(project_name).await,
            Self::Sqlite(store) => store.load_all(project_name).await,
        }
    }

    async fn delete(&mut self, file_path: &Path, project_name: &str) -> Result<(), StoreError> {
        match self {
            Self::File(store) => store.delete(file_path, project_name).await,
            Self::AsyncFile(store) => store.delete(file_path, project_name).await,
            Self::Sqlite(store) => store.delete(file_path, project_name).await,
        }
    }

    async fn delete_all(&mut self, project_name: &str) -> Result<(), StoreError> {
        match self {
            Self::File(store) => store.delete_all(project_name).await,
            Self::AsyncFile(store) => store.delete_all(project_name).await,
            Self::Sqlite(store) => store.delete_all(project_name).await,
        }
    }

    async fn has(&mut self, file_path: &Path, project_name: &str) -> bool {
        match self {
            Self::File(store) => store.has(file_path, project_name).await,
            Self::AsyncFile(store) => store.has(file_path, project_name).await,
            Self::Sqlite(store) => store.has(file_path, project_name).await,
        }
    }
}

/// The store a project runs with, chosen from its `position_storage` config.
#[derive(Debug)]
pub enum StoreBackend {
    Durable(DurableStore),
    Cached(CachedStore<DurableStore>),
}

impl StoreBackend {
    pub fn from_config(config: &PositionStorageConfig) -> Result<Self, StoreError> {
        let path = Path::new(&config.path);

        match config.kind {
            StorageKind::Cached => {
                let backing = config.backing.unwrap_or(StorageKind::AsyncFile);
                let inner = DurableStore::open(backing, path)?;
                Ok(Self::Cached(CachedStore::new(
                    inner,
                    Duration::from_secs(config.save_interval_seconds),
                )))
            }
            kind => Ok(Self::Durable(DurableStore::open(kind, path)?)),
        }
    }
}

impl PositionStore for StoreBackend {
    async fn save(&mut self, position: FilePosition) -> Result<(), StoreError> {
        match self {
            Self::Durable(store) => store.save(position).await,
            Self::Cached(store) => store.save(position).await,
        }
    }

    async fn load(&mut self, file_path: &Path, project_name: &str) -> Option<FilePosition> {
        match self {
            Self::Durable(store) => store.load(file_path, project_name).await,
            Self::Cached(store) => store.load(file_path, project_name).await,
        }
    }

    async fn load_all(&mut self, project_name: &str) -> Vec<FilePosition> {
        match self {
            Self::Durable(store) => store.load_all(project_name).await,
            Self::Cached(store) => store.load_all(project_name).await,
        }
    }

    async fn delete(&mut self, file_path: &Path, project_name: &str) -> Result<(), StoreError> {
        match self {
            Self::Durable(store) => store.delete(file_path, project_name).await,
            Self::Cached(store) => store.delete(file_path, project_name).await,
        }
    }

    async fn delete_all(&mut self, project_name: &str) -> Result<(), StoreError> {
        match self {
            Self::Durable(store) => store.delete_all(project_name).await,
            Self::Cached(store) => store.delete_all(project_name).await,
        }
    }

    async fn has(&mut self, file_path: &Path, project_name: &str) -> bool {
        match self {
            Self::Durable(store) => store.has(file_path, project_name).await,
            Self::Cached(store) => store.has(file_path, project_name).await,
        }
    }

    fn as_flushable(&mut self) -> Option<&mut dyn Flushable> {
        match self {
            Self::Durable(_) => None,
            Self::Cached(store) => Some(store),
        }
    }
}

/// In-memory store for tests, with write counting and failure injection.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub entries: std::collections::HashMap<String, FilePosition>,
    pub saves: usize,
    pub fail_saves: bool,
}

#[cfg(test)]
impl PositionStore for MemoryStore {
    async fn save(&mut self, position: FilePosition) -> Result<(), StoreError> {
        if self.fail_saves {
            return Err(StoreError::io(
                &position.file_path,
                std::io::Error::other("injected failure"),
            ));
        }
        self.saves += 1;
        let key = crate::position::models::cache_key(&position.project_name, &position.file_path);
        self.entries.insert(key, position);
        Ok(())
    }

    async fn load(&mut self, file_path: &Path, project_name: &str) -> Option<FilePosition> {
        let key = crate::position::models::cache_key(project_name, file_path);
        self.entries.get(&key).cloned()
    }

    async fn load_all(&mut self, project_name: &str) -> Vec<FilePosition> {
        self.entries
            .values()
            .filter(|p| p.project_name == project_name)
            .cloned()
            .collect()
    }

    async fn delete(&mut self, file_path: &Path, project_name: &str) -> Result<(), StoreError> {
        let key = crate::position::models::cache_key(project_name, file_path);
        self.entries.remove(&key);
        Ok(())
    }

    async fn delete_all(&mut self, project_name: &str) -> Result<(), StoreError> {
        self.entries.retain(|_, p| p.project_name != project_name);
        Ok(())
    }

    async fn has(&mut self, file_path: &Path, project_name: &str) -> bool {
        let key = crate::position::models::cache_key(project_name, file_path);
        self.entries.contains_key(&key)
    }
}
