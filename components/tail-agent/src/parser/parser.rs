// Local crates
use crate::sink::models::{Level, LogEntry};

// External crates
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use thiserror::Error;
use tracing::instrument;

const MESSAGE_KEYS: [&str; 2] = ["message", "msg"];
const LEVEL_KEYS: [&str; 3] = ["level", "log.level", "severity"];
const TIMESTAMP_KEYS: [&str; 3] = ["@timestamp", "timestamp", "time"];

/// How the lines of a project's files are encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineFormat {
    /// One JSON object per line, logstash style.
    #[default]
    Json,
    /// Free text; each line becomes an info entry.
    Plain,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("line is a JSON {0}, expected an object")]
    NotAnObject(&'static str),
}

/// Turns raw lines into `LogEntry`s for the sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineParser {
    format: LineFormat,
}

impl LineParser {
    pub fn new(format: LineFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> LineFormat {
        self.format
    }

    pub fn parse(&self, line: &str, source_file: &Path) -> Result<LogEntry, ParseError> {
        match self.format {
            LineFormat::Json => parse_json(line, source_file),
            LineFormat::Plain => Ok(LogEntry::new(line, Level::Info, source_file)),
        }
    }
}

/// Parse one logstash-style JSON line.
///
/// Recognised keys are lifted out of the object; everything else is kept as
/// metadata. A missing or unparseable timestamp falls back to the time of
/// reading, and a missing message falls back to the raw line.
#[instrument(
    name = "tail_agent_parser::json",
    target = "parser::parser",
    skip_all,
    level = "trace"
)]
fn parse_json(line: &str, source_file: &Path) -> Result<LogEntry, ParseError> {
    let mut fields = match serde_json::from_str::<Value>(line)? {
        Value::Object(fields) => fields,
        other => return Err(ParseError::NotAnObject(json_kind(&other))),
    };

    let message = take_first(&mut fields, &MESSAGE_KEYS)
        .map(value_to_string)
        .unwrap_or_else(|| line.to_string());

    let level = take_level(&mut fields)
        .map(|label| Level::from_label(&label))
        .unwrap_or(Level::Info);

    let timestamp = take_first(&mut fields, &TIMESTAMP_KEYS)
        .and_then(|value| value.as_str().and_then(parse_rfc3339))
        .unwrap_or_else(|| {
            tracing::trace!("No usable timestamp in line, using read time");
            Utc::now()
        });

    Ok(LogEntry {
        message,
        level,
        source_file: source_file.to_path_buf(),
        timestamp,
        metadata: fields,
    })
}

fn take_first(fields: &mut Map<String, Value>, keys: &[&str]) -> Option<Value> {
    keys.iter().find_map(|key| fields.remove(*key))
}

/// Level keys, including ECS's nested `{"log": {"level": ..}}`.
fn take_level(fields: &mut Map<String, Value>) -> Option<String> {
    if let Some(value) = take_first(fields, &LEVEL_KEYS) {
        return Some(value_to_string(value));
    }

    let log = fields.get_mut("log")?.as_object_mut()?;
    let level = log.remove("level").map(value_to_string);
    if log.is_empty() {
        fields.remove("log");
    }
    level
}

fn value_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn json() -> LineParser {
        LineParser::new(LineFormat::Json)
    }

    #[test]
    fn logstash_line_is_normalised() {
        let line = r#"{"@timestamp":"2025-01-01T12:00:00Z","message":"user logged in","level":"WARN","host":"web-1"}"#;
        let entry = json()
            .parse(line, Path::new("/var/log/api/logstash-1.json"))
            .expect("valid line");

        assert_eq!(entry.message, "user logged in");
        assert_eq!(entry.level, Level::Warn);
        assert_eq!(
            entry.timestamp,
            Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).single().expect("ts")
        );
        assert_eq!(entry.metadata.len(), 1);
        assert_eq!(entry.metadata["host"], "web-1");
        assert_eq!(entry.source_file, Path::new("/var/log/api/logstash-1.json"));
    }

    #[test]
    fn alternative_keys_are_recognised() {
        let line = r#"{"time":"2025-01-01T13:00:00+01:00","msg":"boom","log":{"level":"error"}}"#;
        let entry = json().parse(line, Path::new("/a.log")).expect("valid line");

        assert_eq!(entry.message, "boom");
        assert_eq!(entry.level, Level::Error);
        assert_eq!(
            entry.timestamp,
            Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).single().expect("ts")
        );
        assert!(entry.metadata.is_empty());
    }

    #[test]
    fn missing_fields_fall_back() {
        let line = r#"{"status":200}"#;
        let entry = json().parse(line, Path::new("/a.log")).expect("valid line");

        assert_eq!(entry.message, line);
        assert_eq!(entry.level, Level::Info);
        assert_eq!(entry.metadata["status"], 200);
    }

    #[test]
    fn malformed_and_non_object_lines_are_rejected() {
        assert!(matches!(
            json().parse("{ truncated", Path::new("/a.log")),
            Err(ParseError::Json(_))
        ));
        assert!(matches!(
            json().parse("[1, 2]", Path::new("/a.log")),
            Err(ParseError::NotAnObject("array"))
        ));
    }

    #[test]
    fn plain_lines_pass_through() {
        let entry = LineParser::new(LineFormat::Plain)
            .parse("GET /health 200", Path::new("/a.log"))
            .expect("plain never fails");

        assert_eq!(entry.message, "GET /health 200");
        assert_eq!(entry.level, Level::Info);
    }
}
