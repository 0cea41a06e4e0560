// Local crates
use crate::position::{
    error::StoreError,
    models::{FilePosition, position_file_name},
    store::PositionStore,
};

// External crates
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::instrument;

/// One JSON file per tracked path, written with blocking I/O.
///
/// Every save is durable once it returns: the record is written to a temporary
/// sibling and renamed over the previous one, so a crash mid-write leaves the
/// old position intact rather than a truncated file.
#[derive(Debug, Clone)]
pub struct SyncFileStore {
    directory: PathBuf,
}

impl SyncFileStore {
    /// The directory is created lazily on the first save.
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

    /// Position files of `project_name` currently in the directory.
    fn project_entries(&self, project_name: &str) -> Vec<PathBuf> {
        let entries = match fs::read_dir(&self.directory) {
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

        entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| is_project_entry(path, project_name))
            .collect()
    }
}

impl PositionStore for SyncFileStore {
    #[instrument(
        name = "tail_agent_position::file_store::save",
        target = "position::file_store",
        skip_all,
        fields(project = %position.project_name, file = %position.file_path.display()),
        level = "trace"
    )]
    async fn save(&mut self, position: FilePosition) -> Result<(), StoreError> {
        fs::create_dir_all(&self.directory).map_err(|e| StoreError::io(&self.directory, e))?;

        let target = self.entry_path(&position.file_path, &position.project_name);
        let bytes = serde_json::to_vec_pretty(&position)?;
        write_atomic(&target, &bytes)?;

        tracing::trace!(offset = position.offset, "File position persisted");
        Ok(())
    }

    async fn load(&mut self, file_path: &Path, project_name: &str) -> Option<FilePosition> {
        let target = self.entry_path(file_path, project_name);
        match fs::read(&target) {
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
        let mut positions: Vec<FilePosition> = self
            .project_entries(project_name)
            .into_iter()
            .filter_map(|path| {
                let bytes = fs::read(&path).ok()?;
                decode_position(&path, &bytes)
            })
            .filter(|position| position.project_name == project_name)
            .collect();

        positions.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        positions
    }

    async fn delete(&mut self, file_path: &Path, project_name: &str) -> Result<(), StoreError> {
        remove_if_present(&self.entry_path(file_path, project_name))
    }

    async fn delete_all(&mut self, project_name: &str) -> Result<(), StoreError> {
        for path in self.project_entries(project_name) {
            remove_if_present(&path)?;
        }
        Ok(())
    }

    async fn has(&mut self, file_path: &Path, project_name: &str) -> bool {
        self.load(file_path, project_name).await.is_some()
    }
}

/// Decode a stored record. Corrupt records are logged and reported as absent.
pub(crate) fn decode_position(source: &Path, bytes: &[u8]) -> Option<FilePosition> {
    let position: FilePosition = match serde_json::from_slice(bytes) {
        Ok(position) => position,
        Err(e) => {
            tracing::warn!(
                error = %e,
                position_file = %source.display(),
                "Corrupt position file, treating position as absent"
            );
            return None;
        }
    };

    if let Err(e) = position.check() {
        tracing::warn!(
            error = %e,
            position_file = %source.display(),
            "Position file violates invariants, treating position as absent"
        );
        return None;
    }

    Some(position)
}

/// `true` for `"{project}_<32 hex>.json"`.
pub(crate) fn is_project_entry(path: &Path, project_name: &str) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };

    name.strip_prefix(project_name)
        .and_then(|rest| rest.strip_prefix('_'))
        .and_then(|rest| rest.strip_suffix(".json"))
        .is_some_and(|hash| hash.len() == 32 && hash.chars().all(|c| c.is_ascii_hexdigit()))
}

pub(crate) fn temp_path(target: &Path) -> PathBuf {
    target.with_extension("json.tmp")
}

fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let temp = temp_path(target);

    let mut file = fs::File::create(&temp).map_err(|e| StoreError::io(&temp, e))?;
    file.write_all(bytes).map_err(|e| StoreError::io(&temp, e))?;
    file.sync_all().map_err(|e| StoreError::io(&temp, e))?;
    drop(file);

    fs::rename(&temp, target).map_err(|e| StoreError::io(target, e))
}

fn remove_if_present(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn creates_directory_on_first_save() {
        let dir = TempDir::new().expect("create temp dir");
        let storage = dir.path().join("nested/positions");
        let mut store = SyncFileStore::new(&storage);

        assert!(!storage.exists());
        store
            .save(FilePosition::new("/var/log/app.log", 7, "api").expect("position"))
            .await
            .expect("save");

        let expected = storage.join(position_file_name("api", Path::new("/var/log/app.log")));
        assert!(expected.is_file());
        assert!(!temp_path(&expected).exists());
    }

    #[tokio::test]
    async fn save_is_an_upsert() {
        let dir = TempDir::new().expect("create temp dir");
        let mut store = SyncFileStore::new(dir.path());

        for offset in [10, 20, 30] {
            store
                .save(FilePosition::new("/var/log/app.log", offset, "api").expect("position"))
                .await
                .expect("save");
        }

        let all = store.load_all("api").await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].offset, 30);
    }

    #[tokio::test]
    async fn corrupt_entry_reads_as_absent() {
        let dir = TempDir::new().expect("create temp dir");
        let mut store = SyncFileStore::new(dir.path());
        let path = Path::new("/var/log/app.log");

        fs::write(
            dir.path().join(position_file_name("api", path)),
            b"{ not json",
        )
        .expect("write corrupt entry");

        assert!(store.load(path, "api").await.is_none());
        assert!(!store.has(path, "api").await);
        assert!(store.load_all("api").await.is_empty());
    }

    #[tokio::test]
    async fn delete_all_is_scoped_to_one_project() {
        let dir = TempDir::new().expect("create temp dir");
        let mut store = SyncFileStore::new(dir.path());

        for (project, file) in [("api", "/a.log"), ("api", "/b.log"), ("api_v2", "/a.log")] {
            store
                .save(FilePosition::new(file, 1, project).expect("position"))
                .await
                .expect("save");
        }

        store.delete_all("api").await.expect("delete_all");

        assert!(store.load_all("api").await.is_empty());
        assert_eq!(store.load_all("api_v2").await.len(), 1);
    }

    #[test]
    fn project_entry_names() {
        let name = position_file_name("api", Path::new("/x.log"));
        assert!(is_project_entry(Path::new(&name), "api"));
        assert!(!is_project_entry(Path::new(&name), "ap"));
        assert!(!is_project_entry(Path::new("api_notahash.json"), "api"));
    }
}
