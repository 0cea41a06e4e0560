// Local crates
use crate::{
    helpers::load_config::ProjectConfig,
    metrics::metrics::{
        FILE_SWITCHES_TOTAL, LINES_FORWARDED_TOTAL, MALFORMED_LINES_TOTAL,
        POSITION_SAVE_FAILURES_TOTAL, SINK_FAILURES_TOTAL, TRACKED_OFFSET_BYTES,
        TRUNCATIONS_TOTAL, observe_tick,
    },
    parser::parser::{LineFormat, LineParser},
    position::{
        store::{PositionStore, StoreBackend},
        tracker::PositionTracker,
    },
    sink::{
        models::{Level, LogEntry},
        sink::LogSink,
    },
    tailer::reader::TailReader,
    watcher::{
        discovery::DirectoryScanner, models::LogFile, pattern::PatternMatcher,
        selector::select_latest, wake::WakeWatcher,
    },
};

// External crates
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, instrument};

/// What a monitor loop currently follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorState {
    NoFile,
    Tracking { file: LogFile, offset: u64 },
}

impl MonitorState {
    pub fn file(&self) -> Option<&LogFile> {
        match self {
            Self::NoFile => None,
            Self::Tracking { file, .. } => Some(file),
        }
    }

    pub fn offset(&self) -> Option<u64> {
        match self {
            Self::NoFile => None,
            Self::Tracking { offset, .. } => Some(*offset),
        }
    }
}

/// Summary of one tick, mostly for tests and trace output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub switched: bool,
    pub truncated: bool,
    pub forwarded: usize,
    pub malformed: usize,
}

/// Polling state machine following the newest log file of one project.
///
/// Each tick:
/// 1. rescans the directories when no file is held, when the held file can
///    no longer be stat'ed, or when a periodic rotation check is due, and
///    switches to the newest match if it is strictly newer;
/// 2. reads the bytes between the tracked offset and the current size,
///    forwards every parsed line to the sink and records the new offset;
/// 3. lets a batching position store flush if its interval elapsed.
///
/// Ticks never overlap and cancellation is only observed between them, so a
/// read is never abandoned halfway through.
#[derive(Debug)]
pub struct MonitorLoop<S = StoreBackend> {
    project: String,
    directories: Vec<PathBuf>,
    matcher: PatternMatcher,
    scanner: DirectoryScanner,
    reader: TailReader,
    parser: LineParser,
    sink: Arc<dyn LogSink>,
    tracker: Option<PositionTracker<S>>,
    state: MonitorState,
    poll_interval: Duration,
    reset_on_truncate: bool,
    rotation_check_interval: Option<Duration>,
    last_scan: Option<Instant>,
    wake: Option<WakeWatcher>,
}

/// A spawned monitor loop.
#[derive(Debug)]
pub struct MonitorHandle {
    pub project: String,
    pub cancel: CancellationToken,
    pub join: JoinHandle<()>,
}

impl MonitorLoop<StoreBackend> {
    /// Build a loop from its `[[projects]]` entry.
    ///
    /// Fails when the pattern does not compile or the configured position
    /// store cannot be opened.
    pub fn from_config(
        project: &ProjectConfig,
        poll_interval: Duration,
        sink: Arc<dyn LogSink>,
    ) -> Result<Self> {
        let matcher = PatternMatcher::new(&project.log_pattern)
            .with_context(|| format!("Invalid log_pattern for project {:?}", project.name))?;

        let tracker = match &project.position_storage {
            Some(storage) if project.tracking_enabled() => {
                let store = StoreBackend::from_config(storage).with_context(|| {
                    format!("Failed to open position store for project {:?}", project.name)
                })?;
                Some(
                    PositionTracker::new(project.name.as_str(), store)
                        .with_max_position_age(storage.max_position_age()),
                )
            }
            _ => None,
        };

        let mut monitor = Self::new(
            project.name.as_str(),
            project.directories.clone(),
            matcher,
            sink,
            tracker,
        )
        .with_poll_interval(poll_interval)
        .with_line_format(project.line_format)
        .with_reset_on_truncate(project.reset_on_truncate)
        .with_rotation_check_interval(project.rotation_check_interval());

        if project.watch_events {
            match WakeWatcher::new(&project.directories, monitor.matcher.clone()) {
                Ok(wake) => monitor.wake = Some(wake),
                Err(e) => tracing::warn!(
                    error = %e,
                    project = %project.name,
                    "Filesystem events unavailable, falling back to polling only"
                ),
            }
        }

        Ok(monitor)
    }
}

impl<S: PositionStore + 'static> MonitorLoop<S> {
    pub fn new(
        project: impl Into<String>,
        directories: Vec<PathBuf>,
        matcher: PatternMatcher,
        sink: Arc<dyn LogSink>,
        tracker: Option<PositionTracker<S>>,
    ) -> Self {
        Self {
            project: project.into(),
            directories,
            matcher,
            scanner: DirectoryScanner::new(),
            reader: TailReader::new(),
            parser: LineParser::default(),
            sink,
            tracker,
            state: MonitorState::NoFile,
            poll_interval: Duration::from_secs(1),
            reset_on_truncate: true,
            rotation_check_interval: None,
            last_scan: None,
            wake: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_line_format(mut self, format: LineFormat) -> Self {
        self.parser = LineParser::new(format);
        self
    }

    pub fn with_reset_on_truncate(mut self, reset: bool) -> Self {
        self.reset_on_truncate = reset;
        self
    }

    pub fn with_rotation_check_interval(mut self, every: Option<Duration>) -> Self {
        self.rotation_check_interval = every;
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    pub fn tracker_mut(&mut self) -> Option<&mut PositionTracker<S>> {
        self.tracker.as_mut()
    }

    /// Spawn the loop on the tokio runtime.
    pub fn spawn(self, cancel: CancellationToken) -> MonitorHandle {
        let project = self.project.clone();
        let span = tracing::info_span!(target: "monitor::monitor", "monitor", project = %project);
        let join = tokio::spawn(self.run(cancel.clone()).instrument(span));

        MonitorHandle {
            project,
            cancel,
            join,
        }
    }

    /// Tick until `cancel` fires, then drain.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(
            directories = ?self.directories,
            log_pattern = self.matcher.as_str(),
            tracking = self.tracker.is_some(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Starting monitor loop"
        );

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("Monitor loop received shutdown");
                    break;
                }
                _ = ticker.tick() => {}
                _ = wake_signal(&mut self.wake) => {
                    ticker.reset();
                }
            }

            self.tick().await;
        }

        self.drain().await;
        tracing::info!("Monitor loop exited cleanly");
    }

    /// One pass of the state machine.
    #[instrument(
        name = "tail_agent_monitor::tick",
        target = "monitor::monitor",
        skip_all,
        fields(project = %self.project),
        level = "trace"
    )]
    pub async fn tick(&mut self) -> TickReport {
        let started = std::time::Instant::now();
        let mut report = TickReport::default();

        let mut size = current_size(&self.reader, self.state.file()).await;
        if (size.is_none() || self.rotation_check_due()) && self.rescan(size.is_some()).await {
            report.switched = true;
            size = current_size(&self.reader, self.state.file()).await;
        }

        if let Some(size) = size {
            self.consume(size, &mut report).await;
        }

        if let Some(tracker) = self.tracker.as_mut() {
            tracker.flush_if_due().await;
        }

        observe_tick(&self.project, started.elapsed());
        tracing::trace!(?report, "Tick finished");
        report
    }

    /// Persist the final position and flush any buffered positions.
    #[instrument(
        name = "tail_agent_monitor::drain",
        target = "monitor::monitor",
        skip_all,
        fields(project = %self.project),
        level = "debug"
    )]
    pub async fn drain(&mut self) {
        let Some(tracker) = self.tracker.as_mut() else {
            return;
        };

        if let MonitorState::Tracking { file, offset } = &self.state {
            if let Err(e) = tracker.update_position(&file.path, *offset).await {
                tracing::error!(
                    error = %e,
                    file = %file.path.display(),
                    offset = *offset,
                    "Failed to persist final position"
                );
            }
        }

        if let Some(report) = tracker.force_save().await {
            tracing::info!(
                flushed = report.flushed,
                failed = report.failed,
                "Flushed buffered positions"
            );
        }
    }

    fn rotation_check_due(&self) -> bool {
        let Some(every) = self.rotation_check_interval else {
            return false;
        };
        self.state.file().is_some() && self.last_scan.is_none_or(|at| at.elapsed() >= every)
    }

    /// Rescan and switch to the newest file if it should replace the current
    /// one. Returns `true` on a switch.
    ///
    /// While the current file is still readable only a different path can
    /// replace it; an unreadable file yields to any strictly newer match,
    /// including one recreated under the same path.
    async fn rescan(&mut self, current_readable: bool) -> bool {
        let candidates = scan_directories(
            self.scanner.clone(),
            self.directories.clone(),
            self.matcher.clone(),
        )
        .await;
        self.last_scan = Some(Instant::now());

        let Some(found) = select_latest(candidates) else {
            tracing::debug!("No log file matches the pattern yet");
            return false;
        };

        let previous = match &self.state {
            MonitorState::NoFile => None,
            MonitorState::Tracking { file, .. } => {
                if (current_readable && file.path == found.path) || !found.is_newer_than(file) {
                    return false;
                }
                Some(file.filename.clone())
            }
        };

        self.switch_to(found, previous).await;
        true
    }

    async fn switch_to(&mut self, file: LogFile, previous: Option<String>) {
        let offset = match self.tracker.as_mut() {
            Some(tracker) => tracker.resume_position(&file).await,
            None => 0,
        };

        tracing::info!(
            previous_file = previous.as_deref().unwrap_or("none"),
            file = %file.path.display(),
            offset,
            "Switched to log file"
        );

        let notice = LogEntry::new(
            format!(
                "Switched log file from {} to {}",
                previous.as_deref().unwrap_or("none"),
                file.filename
            ),
            Level::Info,
            file.path.clone(),
        )
        .with_metadata("event", "file_switch")
        .with_metadata("project", self.project.as_str())
        .with_metadata(
            "previous_file",
            previous.map(Value::String).unwrap_or(Value::Null),
        )
        .with_metadata("current_file", file.filename.as_str());

        if let Err(e) = self.sink.forward(&notice) {
            SINK_FAILURES_TOTAL.with_label_values(&[self.project.as_str()]).inc();
            tracing::warn!(error = %e, "Failed to forward file switch notice");
        }

        FILE_SWITCHES_TOTAL.with_label_values(&[self.project.as_str()]).inc();
        set_offset_gauge(&self.project, offset);
        self.state = MonitorState::Tracking { file, offset };
    }

    /// Handle the tracked file now being `size` bytes long.
    async fn consume(&mut self, size: u64, report: &mut TickReport) {
        let MonitorState::Tracking { file, offset } = &self.state else {
            return;
        };
        let path = file.path.clone();
        let mut from = *offset;

        if size == from {
            return;
        }

        if size < from {
            TRUNCATIONS_TOTAL.with_label_values(&[self.project.as_str()]).inc();
            report.truncated = true;

            if !self.reset_on_truncate {
                tracing::debug!(offset = from, size, "File shrank below offset, waiting for it to grow");
                return;
            }
            tracing::warn!(
                offset = from,
                size,
                file = %path.display(),
                "File was truncated, reading it again from the beginning"
            );
            from = 0;
            if size == 0 {
                self.advance(path, 0).await;
                return;
            }
        }

        let lines = match self.reader.try_read_range(&path, from, size).await {
            Ok(lines) => lines,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    file = %path.display(),
                    "Failed to read appended content, retrying next tick"
                );
                return;
            }
        };

        for line in &lines {
            match self.parser.parse(line, &path) {
                Ok(entry) => match self.sink.forward(&entry) {
                    Ok(()) => report.forwarded += 1,
                    Err(e) => {
                        SINK_FAILURES_TOTAL.with_label_values(&[self.project.as_str()]).inc();
                        tracing::warn!(error = %e, "Sink rejected log entry");
                    }
                },
                Err(e) => {
                    report.malformed += 1;
                    tracing::debug!(error = %e, "Skipping malformed line");
                }
            }
        }

        LINES_FORWARDED_TOTAL
            .with_label_values(&[self.project.as_str()])
            .inc_by(report.forwarded as u64);
        MALFORMED_LINES_TOTAL
            .with_label_values(&[self.project.as_str()])
            .inc_by(report.malformed as u64);

        tracing::debug!(
            from,
            to = size,
            forwarded = report.forwarded,
            malformed = report.malformed,
            "Consumed appended content"
        );

        self.advance(path, size).await;
    }

    async fn advance(&mut self, path: PathBuf, offset: u64) {
        if let MonitorState::Tracking { offset: tracked, .. } = &mut self.state {
            *tracked = offset;
        }
        set_offset_gauge(&self.project, offset);

        if let Some(tracker) = self.tracker.as_mut() {
            if let Err(e) = tracker.update_position(&path, offset).await {
                POSITION_SAVE_FAILURES_TOTAL
                    .with_label_values(&[self.project.as_str()])
                    .inc();
                tracing::warn!(
                    error = %e,
                    file = %path.display(),
                    offset,
                    "Failed to persist position, will retry with the next update"
                );
            }
        }
    }
}

/// Directory listing and metadata calls run on the blocking pool.
async fn scan_directories(
    scanner: DirectoryScanner,
    directories: Vec<PathBuf>,
    matcher: PatternMatcher,
) -> Vec<LogFile> {
    let span = tracing::Span::current();
    let scanned = tokio::task::spawn_blocking(move || {
        span.in_scope(|| scanner.scan_all(&directories, &matcher))
    });

    match scanned.await {
        Ok(candidates) => candidates,
        Err(e) => {
            tracing::warn!(error = %e, "Directory scan task failed, retrying next tick");
            Vec::new()
        }
    }
}

async fn current_size(reader: &TailReader, file: Option<&LogFile>) -> Option<u64> {
    let file = file?;
    match reader.get_size(&file.path).await {
        Ok(size) => Some(size),
        Err(e) => {
            tracing::warn!(
                error = %e,
                file = %file.path.display(),
                "Tracked log file is not accessible"
            );
            None
        }
    }
}

fn set_offset_gauge(project: &str, offset: u64) {
    TRACKED_OFFSET_BYTES
        .with_label_values(&[project])
        .set(i64::try_from(offset).unwrap_or(i64::MAX));
}

async fn wake_signal(wake: &mut Option<WakeWatcher>) {
    match wake {
        Some(wake) => wake.notified().await,
        None => std::future::pending().await,
    }
}
