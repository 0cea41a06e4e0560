// Local crates
use crate::position::{
    error::StoreError,
    models::{FilePosition, format_timestamp, parse_timestamp},
    store::PositionStore,
};

// External crates
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, params};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::instrument;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS file_positions (
        project_name    TEXT NOT NULL,
        file_path       TEXT NOT NULL,
        position        INTEGER NOT NULL,
        last_updated    TEXT NOT NULL,
        PRIMARY KEY (project_name, file_path)
    )";

/// All positions in one SQLite database, reached through a small r2d2 pool.
///
/// rusqlite is blocking, so every statement runs on tokio's blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .field("connections", &self.pool.state().connections)
            .finish()
    }
}

/// Raw row as stored, before validation.
type PositionRow = (String, i64, String, String);

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    #[instrument(
        name = "tail_agent_position::sqlite_store::open",
        target = "position::sqlite_store",
        skip_all,
        fields(database = %path.as_ref().display()),
        level = "debug"
    )]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
        }

        let pool = Pool::builder()
            .max_size(4)
            .build(SqliteConnectionManager::file(&path))?;
        pool.get()?.execute_batch(SCHEMA)?;

        tracing::debug!("SQLite position store ready");
        Ok(Self { pool, path })
    }

    /// Private in-memory database, mostly for tests.
    ///
    /// The pool is limited to one connection because every SQLite memory
    /// connection is its own database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let pool = Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())?;
        pool.get()?.execute_batch(SCHEMA)?;

        Ok(Self {
            pool,
            path: PathBuf::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_connection<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            op(&conn)
        })
        .await?
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PositionRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn row_to_position(row: PositionRow) -> Option<FilePosition> {
    let (file_path, position, last_updated, project_name) = row;

    let offset = u64::try_from(position).ok()?;
    let last_updated = parse_timestamp(&last_updated)?;

    FilePosition::with_timestamp(file_path, offset, project_name, last_updated).ok()
}

fn path_key(file_path: &Path) -> String {
    file_path.to_string_lossy().into_owned()
}

impl PositionStore for SqliteStore {
    async fn save(&mut self, position: FilePosition) -> Result<(), StoreError> {
        let offset = i64::try_from(position.offset).unwrap_or(i64::MAX);

        self.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO file_positions (project_name, file_path, position, last_updated)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (project_name, file_path)
                 DO UPDATE SET position = excluded.position, last_updated = excluded.last_updated",
                params![
                    position.project_name,
                    path_key(&position.file_path),
                    offset,
                    format_timestamp(&position.last_updated),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn load(&mut self, file_path: &Path, project_name: &str) -> Option<FilePosition> {
        let project = project_name.to_string();
        let path = path_key(file_path);

        let row = self
            .with_connection(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT file_path, position, last_updated, project_name
                         FROM file_positions WHERE project_name = ?1 AND file_path = ?2",
                        params![project, path],
                        read_row,
                    )
                    .optional()?;
                Ok(row)
            })
            .await;

        match row {
            Ok(Some(row)) => {
                let decoded = row_to_position(row);
                if decoded.is_none() {
                    tracing::warn!(
                        project = project_name,
                        file = %file_path.display(),
                        "Corrupt position row, treating position as absent"
                    );
                }
                decoded
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    project = project_name,
                    file = %file_path.display(),
                    "Failed to load position from SQLite, treating position as absent"
                );
                None
            }
        }
    }

    async fn load_all(&mut self, project_name: &str) -> Vec<FilePosition> {
        let project = project_name.to_string();

        let rows = self
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT file_path, position, last_updated, project_name
                     FROM file_positions WHERE project_name = ?1 ORDER BY file_path",
                )?;
                let rows = stmt
                    .query_map(params![project], read_row)?
                    .collect::<Result<Vec<PositionRow>, _>>()?;
                Ok(rows)
            })
            .await;

        match rows {
            Ok(rows) => rows.into_iter().filter_map(row_to_position).collect(),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    project = project_name,
                    "Failed to load positions from SQLite"
                );
                Vec::new()
            }
        }
    }

    async fn delete(&mut self, file_path: &Path, project_name: &str) -> Result<(), StoreError> {
        let project = project_name.to_string();
        let path = path_key(file_path);

        self.with_connection(move |conn| {
            conn.execute(
                "DELETE FROM file_positions WHERE project_name = ?1 AND file_path = ?2",
                params![project, path],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_all(&mut self, project_name: &str) -> Result<(), StoreError> {
        let project = project_name.to_string();

        self.with_connection(move |conn| {
            conn.execute(
                "DELETE FROM file_positions WHERE project_name = ?1",
                params![project],
            )?;
            Ok(())
        })
        .await
    }

    async fn has(&mut self, file_path: &Path, project_name: &str) -> bool {
        self.load(file_path, project_name).await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn upsert_and_scoped_queries() {
        let mut store = SqliteStore::open_in_memory().expect("open");

        for (project, file, offset) in [
            ("api", "/a.log", 1),
            ("api", "/a.log", 5),
            ("api", "/b.log", 2),
            ("web", "/a.log", 3),
        ] {
            store
                .save(FilePosition::new(file, offset, project).expect("position"))
                .await
                .expect("save");
        }

        let api = store.load_all("api").await;
        assert_eq!(api.len(), 2);
        assert_eq!(api[0].offset, 5);

        store.delete_all("api").await.expect("delete_all");
        assert!(store.load_all("api").await.is_empty());
        assert!(store.has(Path::new("/a.log"), "web").await);
    }

    #[tokio::test]
    async fn positions_survive_reopen() {
        let dir = TempDir::new().expect("create temp dir");
        let db = dir.path().join("state/positions.db");

        {
            let mut store = SqliteStore::open(&db).expect("open");
            store
                .save(FilePosition::new("/var/log/app.log", 77, "api").expect("position"))
                .await
                .expect("save");
        }

        let mut reopened = SqliteStore::open(&db).expect("reopen");
        let position = reopened
            .load(Path::new("/var/log/app.log"), "api")
            .await
            .expect("persisted position");
        assert_eq!(position.offset, 77);
    }

    #[tokio::test]
    async fn corrupt_rows_read_as_absent() {
        let mut store = SqliteStore::open_in_memory().expect("open");
        store
            .with_connection(|conn| {
                conn.execute(
                    "INSERT INTO file_positions VALUES ('api', '/bad.log', -4, 'yesterday')",
                    [],
                )?;
                Ok(())
            })
            .await
            .expect("insert corrupt row");

        assert!(store.load(Path::new("/bad.log"), "api").await.is_none());
        assert!(store.load_all("api").await.is_empty());
    }
}
