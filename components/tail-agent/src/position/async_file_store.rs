// Local crates
use crate::position::{
    error::StoreError,
    file_store::{decode_position, is_project_entry, temp_path},
    models::{FilePosition, position_file_name},
    store::PositionStore,
};

// External crates
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;

/// Same on-disk layout as `SyncFileStore`, using tokio's non-blocking file
/// API so a save never stalls the monitoring task that issued it.
#[derive(Debug, Clone)]
pub struct AsyncFileStore {
    directory: PathBuf,
}

impl AsyncFileStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn entry_path(&self, file_path: &Path, project_name: &str) -> PathBuf {
        self.directory
            .join(position_file_name(project_name, file_path))
    }

    async fn project_entries(&self, project_name: &str) -> Vec<PathBuf> {
        let mut entries = match fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    directory = %self.directory.display(),
                    "Failed to list position storage directory"
                );
                return Vec::new();
            }
        };

        let mut paths = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if is_project_entry(&path, project_name) {
                        paths.push(path);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping unreadable position storage entry");
                    break;
                }
            }
        }
        paths
    }

    async fn write_atomic(&self, target: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let temp = temp_path(target);

        let mut file = fs::File::create(&temp)
            .await
            .map_err(|e| StoreError::io(&temp, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| StoreError::io(&temp, e))?;
        file.sync_all().await.map_err(|e| StoreError::io(&temp, e))?;
        drop(file);

        fs::rename(&temp, target)
            .await
            .map_err(|e| StoreError::io(target, e))
    }
}

impl PositionStore for AsyncFileStore {
    #[instrument(
        name = "tail_agent_position::async_file_store::save",
        target = "position::async_file_store",
        skip_all,
        fields(project = %position.project_name, file = %position.file_path.display()),
        level = "trace"
    )]
    async fn save(&mut self, position: FilePosition) -> Result<(), StoreError> {
        fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| StoreError::io(&self.directory, e))?;

        let target = self.entry_path(&position.file_path, &position.project_name);
        let bytes = serde_json::to_vec_pretty(&position)?;
        self.write_atomic(&target, &bytes).await?;

        tracing::trace!(offset = position.offset, "File position persisted");
        Ok(())
    }

    async fn load(&mut self, file_path: &Path, project_name: &str) -> Option<FilePosition> {
        let target = self.entry_path(file_path, project_name);
        match fs::read(&target).await {
            Ok(bytes) => decode_position(&target, &bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    position_file = %target.display(),
                    "Failed to read position file, treating position as absent"
                );
                None
            }
        }
    }

    async fn load_all(&mut self, project_name: &str) -> Vec<FilePosition> {
        let mut positions = Vec::new();
        for path in self.project_entries(project_name).await {
            let Ok(bytes) = fs::read(&path).await else {
                continue;
            };
            if let Some(position) = decode_position(&path, &bytes) {
                if position.project_name == project_name {
                    positions.push(position);
                }
            }
        }

        positions.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        positions
    }

    async fn delete(&mut self, file_path: &Path, project_name: &str) -> Result<(), StoreError> {
        let target = self.entry_path(file_path, project_name);
        match fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&target, e)),
        }
    }

    async fn delete_all(&mut self, project_name: &str) -> Result<(), StoreError> {
        for path in self.project_entries(project_name).await {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(&path, e)),
            }
        }
        Ok(())
    }

    async fn has(&mut self, file_path: &Path, project_name: &str) -> bool {
        self.load(file_path, project_name).await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::file_store::SyncFileStore;
    use tempfile::TempDir;

    #[tokio::test]
    async fn layout_is_shared_with_sync_store() {
        let dir = TempDir::new().expect("create temp dir");
        let mut async_store = AsyncFileStore::new(dir.path());
        let mut sync_store = SyncFileStore::new(dir.path());

        async_store
            .save(FilePosition::new("/var/log/app.log", 128, "api").expect("position"))
            .await
            .expect("save");

        let loaded = sync_store
            .load(Path::new("/var/log/app.log"), "api")
            .await
            .expect("position written by async store");
        assert_eq!(loaded.offset, 128);
    }

    #[tokio::test]
    async fn missing_directory_loads_nothing() {
        let dir = TempDir::new().expect("create temp dir");
        let mut store = AsyncFileStore::new(dir.path().join("never-created"));

        assert!(store.load(Path::new("/a.log"), "api").await.is_none());
        assert!(store.load_all("api").await.is_empty());
        store.delete_all("api").await.expect("nothing to delete");
    }

    #[tokio::test]
    async fn load_all_and_delete_all() {
        let dir = TempDir::new().expect("create temp dir");
        let mut store = AsyncFileStore::new(dir.path());

        for file in ["/b.log", "/a.log"] {
            store
                .save(FilePosition::new(file, 3, "api").expect("position"))
                .await
                .expect("save");
        }
        store
            .save(FilePosition::new("/a.log", 9, "web").expect("position"))
            .await
            .expect("save");

        let api: Vec<_> = store
            .load_all("api")
            .await
            .into_iter()
            .map(|p| p.file_path)
            .collect();
        assert_eq!(api, vec![PathBuf::from("/a.log"), PathBuf::from("/b.log")]);

        store.delete_all("api").await.expect("delete_all");
        assert!(store.load_all("api").await.is_empty());
        assert_eq!(store.load_all("web").await.len(), 1);
    }
}
