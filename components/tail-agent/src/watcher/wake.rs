// Local crates
use crate::watcher::pattern::PatternMatcher;

// External crates
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::instrument;

/// Filesystem watcher that wakes a monitor loop early when a matching file in
/// one of its directories changes.
///
/// Wake-ups are coalesced into a channel of capacity one: the loop only needs
/// to know that *something* changed since its last tick, never what.
#[derive(Debug)]
pub struct WakeWatcher {
    // Dropping the watcher stops event delivery
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<()>,
    watched: usize,
}

impl WakeWatcher {
    /// Watch every directory that currently exists. Directories that cannot
    /// be watched are logged and skipped; polling still covers them.
    #[instrument(
        name = "tail_agent_watcher::wake::new",
        target = "watcher::wake",
        skip_all,
        fields(log_pattern = matcher.as_str()),
        level = "debug"
    )]
    pub fn new(directories: &[PathBuf], matcher: PatternMatcher) -> notify::Result<Self> {
        let (tx, rx) = mpsc::channel::<()>(1);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if is_relevant(&event, &matcher) => {
                    // Full means a wake-up is already pending
                    let _ = tx.try_send(());
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(error = %e, "Filesystem watcher error"),
            },
            notify::Config::default(),
        )?;

        let mut watched = 0;
        for directory in directories {
            match watcher.watch(directory, RecursiveMode::NonRecursive) {
                Ok(()) => watched += 1,
                Err(e) => tracing::warn!(
                    error = %e,
                    directory = %directory.display(),
                    "Cannot watch log directory, relying on polling for it"
                ),
            }
        }

        tracing::debug!(watched, "Filesystem wake watcher started");
        Ok(Self {
            _watcher: watcher,
            rx,
            watched,
        })
    }

    /// Number of directories actually being watched.
    pub fn watched(&self) -> usize {
        self.watched
    }

    /// Resolves on the next relevant change. Never resolves once the
    /// watcher's event thread is gone.
    pub async fn notified(&mut self) {
        if self.rx.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

fn is_relevant(event: &Event, matcher: &PatternMatcher) -> bool {
    let kind_matters = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    );

    kind_matters
        && event.paths.iter().any(|path| {
            path.file_name()
                .is_some_and(|name| matcher.is_match(&name.to_string_lossy()))
        })
}
