// Local crates
use crate::{
    helpers::load_config::SinkConfig,
    sink::models::{Level, LogEntry},
};

// External crates
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to write log entry: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode log entry: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("log sink receiver was dropped")]
    Closed,
}

/// Downstream consumer of tailed entries.
///
/// A failed forward is reported to the caller, which logs it and moves on:
/// the position still advances, so delivery stays at-least-once only up to
/// the sink's own guarantees.
pub trait LogSink: Send + Sync + fmt::Debug {
    fn forward(&self, entry: &LogEntry) -> Result<(), SinkError>;
}

/// Build the sink selected in the `[sink]` section.
pub fn from_config(config: &SinkConfig) -> Arc<dyn LogSink> {
    match config {
        SinkConfig::Stdout => Arc::new(StdoutSink),
        SinkConfig::Tracing => Arc::new(TracingSink),
    }
}

/// One JSON document per line on standard output.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutSink;

impl StdoutSink {
    fn write_entry<W: Write>(writer: &mut W, entry: &LogEntry) -> Result<(), SinkError> {
        serde_json::to_writer(&mut *writer, entry)?;
        writer.write_all(b"\n")?;
        Ok(())
    }
}

impl LogSink for StdoutSink {
    fn forward(&self, entry: &LogEntry) -> Result<(), SinkError> {
        let mut stdout = io::stdout().lock();
        Self::write_entry(&mut stdout, entry)
    }
}

/// Re-emits entries as `tracing` events under the `tail_agent::sink` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn forward(&self, entry: &LogEntry) -> Result<(), SinkError> {
        let source = entry.source_file.display();
        let timestamp = entry.timestamp.to_rfc3339();

        match entry.level {
            Level::Trace => tracing::trace!(target: "tail_agent::sink", source_file = %source, timestamp = %timestamp, metadata = ?entry.metadata, "{}", entry.message),
            Level::Debug => tracing::debug!(target: "tail_agent::sink", source_file = %source, timestamp = %timestamp, metadata = ?entry.metadata, "{}", entry.message),
            Level::Info => tracing::info!(target: "tail_agent::sink", source_file = %source, timestamp = %timestamp, metadata = ?entry.metadata, "{}", entry.message),
            Level::Warn => tracing::warn!(target: "tail_agent::sink", source_file = %source, timestamp = %timestamp, metadata = ?entry.metadata, "{}", entry.message),
            Level::Error => tracing::error!(target: "tail_agent::sink", source_file = %source, timestamp = %timestamp, metadata = ?entry.metadata, "{}", entry.message),
        }
        Ok(())
    }
}

/// Hands entries to an in-process consumer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<LogEntry>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LogEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl LogSink for ChannelSink {
    fn forward(&self, entry: &LogEntry) -> Result<(), SinkError> {
        self.tx.send(entry.clone()).map_err(|_| SinkError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdout_format_is_one_json_document_per_line() {
        let mut out = Vec::new();
        let first = LogEntry::new("first", Level::Info, "/a.log");
        let second = LogEntry::new("second", Level::Error, "/a.log");

        StdoutSink::write_entry(&mut out, &first).expect("write");
        StdoutSink::write_entry(&mut out, &second).expect("write");

        let text = String::from_utf8(out).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let decoded: serde_json::Value = serde_json::from_str(lines[1]).expect("json line");
        assert_eq!(decoded["message"], "second");
        assert_eq!(decoded["level"], "error");
    }

    #[tokio::test]
    async fn channel_sink_delivers_and_reports_closed_receiver() {
        let (sink, mut rx) = ChannelSink::new();
        let entry = LogEntry::new("hello", Level::Warn, "/a.log");

        sink.forward(&entry).expect("forward");
        assert_eq!(rx.recv().await, Some(entry.clone()));

        drop(rx);
        assert!(matches!(sink.forward(&entry), Err(SinkError::Closed)));
    }
}
