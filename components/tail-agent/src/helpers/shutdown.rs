// Local crates
use crate::monitor::monitor::MonitorHandle;

// External crates
use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Process-wide shutdown request, built on top of a broadcast channel.
///
/// - Each component calls `.subscribe()` to get its own receiver.
/// - Calling `.trigger()` notifies every receiver, and later callers of
///   `wait_for_shutdown()` return immediately.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    /// A small buffer is enough, only one message is ever sent.
    #[instrument(
        name = "tail_agent_shutdown_channel",
        target = "helpers::shutdown",
        level = "trace"
    )]
    pub fn new() -> Self {
        tracing::trace!("Creating new global shutdown channel");
        let (tx, _rx) = broadcast::channel(16);
        Self {
            tx,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    #[instrument(
        name = "tail_agent_shutdown_trigger",
        target = "helpers::shutdown",
        skip_all,
        level = "trace"
    )]
    pub fn trigger(&self) {
        tracing::trace!("Shutdown triggered, notifying shutdown channel subscribers");
        self.triggered.store(true, Ordering::SeqCst);
        let _ = self.tx.send(());
    }

    /// Block until `.trigger()` has been called, including before this call.
    #[instrument(
        name = "tail_agent_shutdown_waiter",
        target = "helpers::shutdown",
        skip_all,
        level = "trace"
    )]
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.tx.subscribe();
        if !self.is_triggered() {
            tracing::trace!("Waiting for shutdown signal");
            let _ = rx.recv().await;
        }
        tracing::trace!("Shutdown signal received");
    }
}

/// Outcome of draining every registered monitor loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub drained: usize,
    pub failed: usize,
}

/// Owns the spawned monitor loops and drains them on shutdown.
///
/// Every loop gets a child of one root token. Shutting down cancels the root,
/// which each loop observes between ticks; it then persists its position,
/// force-flushes its store and returns. A loop that panicked or was aborted
/// is logged and does not keep the others from draining.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    root: CancellationToken,
    handles: Vec<MonitorHandle>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for a new loop, cancelled together with all others.
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    pub fn register(&mut self, handle: MonitorHandle) {
        tracing::debug!(project = %handle.project, "Registered monitor loop for shutdown");
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    #[instrument(
        name = "tail_agent_shutdown_all",
        target = "helpers::shutdown",
        skip_all,
        fields(loops = self.handles.len()),
        level = "info"
    )]
    pub async fn shutdown_all(self) -> ShutdownReport {
        tracing::info!("Stopping all monitor loops");
        self.root.cancel();

        let results = join_all(self.handles.into_iter().map(|handle| async move {
            handle.cancel.cancel();
            (handle.project, handle.join.await)
        }))
        .await;

        let mut report = ShutdownReport::default();
        for (project, result) in results {
            match result {
                Ok(()) => {
                    report.drained += 1;
                    tracing::debug!(project = %project, "Monitor loop drained");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        error = %e,
                        project = %project,
                        "Monitor loop failed while shutting down"
                    );
                }
            }
        }

        tracing::info!(
            drained = report.drained,
            failed = report.failed,
            "All monitor loops stopped"
        );
        report
    }
}
