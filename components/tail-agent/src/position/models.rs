// Local crates
use crate::position::error::PositionError;

// External crates
use chrono::{DateTime, NaiveDateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// On-disk format of `last_updated`, always expressed in UTC.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Default staleness window for a stored position.
pub const DEFAULT_MAX_POSITION_AGE_HOURS: u64 = 24;

/// Last consumed byte offset of one file, for one project.
///
/// Serialized as:
///
/// ```json
/// { "file_path": "/var/log/app.log", "position": 500,
///   "last_updated": "2025-01-01 12:00:00", "project_name": "api" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePosition {
    pub file_path: PathBuf,
    #[serde(rename = "position")]
    pub offset: u64,
    #[serde(with = "timestamp_format")]
    pub last_updated: DateTime<Utc>,
    pub project_name: String,
}

impl FilePosition {
    /// New position stamped with the current time.
    pub fn new(
        file_path: impl Into<PathBuf>,
        offset: u64,
        project_name: impl Into<String>,
    ) -> Result<Self, PositionError> {
        Self::with_timestamp(file_path, offset, project_name, Utc::now())
    }

    pub fn with_timestamp(
        file_path: impl Into<PathBuf>,
        offset: u64,
        project_name: impl Into<String>,
        last_updated: DateTime<Utc>,
    ) -> Result<Self, PositionError> {
        let position = Self {
            file_path: file_path.into(),
            offset,
            last_updated,
            project_name: project_name.into(),
        };
        position.check()?;
        Ok(position)
    }

    /// Verify the non-empty invariants, used on every decoded record.
    pub fn check(&self) -> Result<(), PositionError> {
        if self.file_path.as_os_str().is_empty() {
            return Err(PositionError::EmptyFilePath);
        }
        if self.project_name.is_empty() {
            return Err(PositionError::EmptyProjectName);
        }
        Ok(())
    }

    /// Decide whether a stored position can be resumed for `path`, a file
    /// currently `current_size` bytes long.
    pub fn validate_against(
        &self,
        path: &Path,
        current_size: u64,
        max_age: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidPosition> {
        if self.file_path != path {
            return Err(InvalidPosition::PathMismatch {
                stored: self.file_path.clone(),
                expected: path.to_path_buf(),
            });
        }

        if self.offset > current_size {
            return Err(InvalidPosition::BeyondEnd {
                offset: self.offset,
                size: current_size,
            });
        }

        let age = now.signed_duration_since(self.last_updated);
        if age > max_age {
            return Err(InvalidPosition::Stale {
                age_secs: age.num_seconds(),
                max_age_secs: max_age.num_seconds(),
            });
        }

        Ok(())
    }
}

/// Why a stored position was discarded at load time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidPosition {
    #[error("stored path {stored:?} does not match {expected:?}")]
    PathMismatch { stored: PathBuf, expected: PathBuf },

    #[error("stored offset {offset} is beyond the current file size {size}")]
    BeyondEnd { offset: u64, size: u64 },

    #[error("stored position is {age_secs}s old, older than the {max_age_secs}s limit")]
    Stale { age_secs: i64, max_age_secs: i64 },
}

/// In-memory key of a position: `"{project}:{path}"`.
pub fn cache_key(project_name: &str, file_path: &Path) -> String {
    format!("{}:{}", project_name, file_path.display())
}

/// File name of a persisted position: `"{project}_{md5(path)}.json"`.
///
/// Hashing the path keeps separators out of the file name and gives every
/// tracked file of a project a distinct, stable entry.
pub fn position_file_name(project_name: &str, file_path: &Path) -> String {
    let digest = Md5::digest(file_path.to_string_lossy().as_bytes());
    format!("{}_{}.json", project_name, hex::encode(digest))
}

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

mod timestamp_format {
    use super::{format_timestamp, parse_timestamp};
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_timestamp(&raw)
            .ok_or_else(|| D::Error::custom(format!("invalid last_updated timestamp: {raw}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid ts")
    }

    #[test]
    fn rejects_empty_identity_fields() {
        assert_eq!(
            FilePosition::new("", 1, "api").unwrap_err(),
            PositionError::EmptyFilePath
        );
        assert_eq!(
            FilePosition::new("/var/log/app.log", 1, "").unwrap_err(),
            PositionError::EmptyProjectName
        );
    }

    #[test]
    fn json_layout_matches_position_file_format() {
        let position =
            FilePosition::with_timestamp("/var/log/app.log", 500, "api", at(1_700_000_000))
                .expect("valid position");

        let json = serde_json::to_value(&position).expect("serialize");
        assert_eq!(json["file_path"], "/var/log/app.log");
        assert_eq!(json["position"], 500);
        assert_eq!(json["last_updated"], "2023-11-14 22:13:20");
        assert_eq!(json["project_name"], "api");

        let decoded: FilePosition = serde_json::from_value(json).expect("deserialize");
        assert_eq!(decoded, position);
    }

    #[test]
    fn offset_beyond_current_size_is_invalid() {
        let now = Utc::now();
        let position = FilePosition::with_timestamp("/var/log/app.log", 500, "api", now)
            .expect("valid position");

        let verdict = position.validate_against(
            Path::new("/var/log/app.log"),
            300,
            chrono::Duration::hours(24),
            now,
        );
        assert_eq!(
            verdict,
            Err(InvalidPosition::BeyondEnd {
                offset: 500,
                size: 300
            })
        );
    }

    #[test]
    fn stale_and_mismatched_positions_are_invalid() {
        let now = at(1_700_000_000);
        let old = FilePosition::with_timestamp("/a.log", 10, "api", at(1_700_000_000 - 90_000))
            .expect("valid position");

        assert!(matches!(
            old.validate_against(Path::new("/a.log"), 100, chrono::Duration::hours(24), now),
            Err(InvalidPosition::Stale { .. })
        ));
        assert!(matches!(
            old.validate_against(Path::new("/b.log"), 100, chrono::Duration::hours(48), now),
            Err(InvalidPosition::PathMismatch { .. })
        ));
        assert!(
            old.validate_against(Path::new("/a.log"), 10, chrono::Duration::hours(48), now)
                .is_ok()
        );
    }

    #[test]
    fn file_name_is_project_prefixed_md5() {
        let name = position_file_name("api", Path::new("/var/log/app.log"));
        assert!(name.starts_with("api_"));
        assert!(name.ends_with(".json"));
        // "api_" + 32 hex chars + ".json"
        assert_eq!(name.len(), 4 + 32 + 5);
        assert_ne!(name, position_file_name("api", Path::new("/var/log/app2.log")));
    }
}
