// External crates
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;

/// Severity of a forwarded entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    /// Lenient mapping of the level names found in the wild. Unknown names
    /// are treated as `Info`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "trace" | "finest" => Self::Trace,
            "debug" | "fine" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" | "err" | "fatal" | "critical" | "crit" | "panic" | "severe" => Self::Error,
            _ => Self::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record handed to a `LogSink`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub message: String,
    pub level: Level,
    pub source_file: PathBuf,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl LogEntry {
    pub fn new(message: impl Into<String>, level: Level, source_file: impl Into<PathBuf>) -> Self {
        Self {
            message: message.into(),
            level,
            source_file: source_file.into(),
            timestamp: Utc::now(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_labels_are_lenient() {
        assert_eq!(Level::from_label("WARNING"), Level::Warn);
        assert_eq!(Level::from_label(" Fatal "), Level::Error);
        assert_eq!(Level::from_label("notice"), Level::Info);
        assert_eq!(Level::from_label("debug"), Level::Debug);
    }

    #[test]
    fn empty_metadata_is_omitted() {
        let entry = LogEntry::new("hello", Level::Info, "/var/log/app.log");
        let json = serde_json::to_value(&entry).expect("serialize");

        assert_eq!(json["level"], "info");
        assert_eq!(json["source_file"], "/var/log/app.log");
        assert!(json.get("metadata").is_none());

        let json = serde_json::to_value(entry.with_metadata("host", "web-1")).expect("serialize");
        assert_eq!(json["metadata"]["host"], "web-1");
    }
}
