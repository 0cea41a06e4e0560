// Local crates
use crate::{
    helpers::{
        load_config::Config,
        shutdown::{Shutdown, ShutdownCoordinator},
        signals::spawn_signal_listener,
    },
    instrumentation::tracing::{init_panic_handler, init_tracing},
    metrics::{http::start_metrics_server, metrics::STARTUP_DURATION_SECONDS},
    monitor::monitor::MonitorLoop,
    sink::sink,
};

// External crates
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// Tail agent runtime initialization, steady state and teardown.
///
/// Every project gets its own monitor loop. The process runs until a
/// termination signal arrives, then every loop persists its position and the
/// metrics server stops.
pub async fn run_tail_agent(config_path: PathBuf) -> Result<()> {
    let started = Instant::now();

    // Load Tail Agent configurations
    let cfg = Config::load(&config_path)?;

    // Keep the file writer guard alive for the whole run
    let _log_guard = init_tracing(&cfg.instrumentation)?;
    init_panic_handler();

    info!(
        config = %config_path.display(),
        projects = cfg.projects.len(),
        "Starting VES tail agent"
    );

    // Start monitor loops
    let coordinator = start_monitors(&cfg)?;

    // Start metrics server
    let metrics_cancel = CancellationToken::new();
    let metrics_task = if cfg.metrics.enabled {
        let addr = cfg.metrics.listen_addr.clone();
        let cancel = metrics_cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&addr, cancel).await {
                tracing::error!(error = %e, "Metrics server stopped");
            }
        }))
    } else {
        None
    };

    STARTUP_DURATION_SECONDS.set(started.elapsed().as_secs_f64());
    info!(
        startup_ms = started.elapsed().as_millis() as u64,
        monitors = coordinator.len(),
        "Tail agent running"
    );

    // Initialize global shutdown broadcaster channel
    let shutdown = Shutdown::new();
    let signals = spawn_signal_listener(shutdown.clone());
    shutdown.wait_for_shutdown().await;

    let report = coordinator.shutdown_all().await;

    metrics_cancel.cancel();
    if let Some(task) = metrics_task {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Metrics server task did not stop cleanly");
        }
    }
    signals.abort();

    info!(
        drained = report.drained,
        failed = report.failed,
        "Tail agent stopped"
    );
    Ok(())
}

/// Build and spawn one monitor loop per project.
///
/// Any project that cannot be set up, most often because its position store
/// cannot be opened, aborts startup.
#[instrument(
    name = "tail_agent_runtime::start_monitors",
    target = "runtime::runtime",
    skip_all,
    level = "debug"
)]
pub fn start_monitors(cfg: &Config) -> Result<ShutdownCoordinator> {
    let sink = sink::from_config(&cfg.sink);
    let poll_interval = cfg.general.poll_interval();
    let mut coordinator = ShutdownCoordinator::new();

    // Open every store before any loop starts reading
    let mut monitors = Vec::with_capacity(cfg.projects.len());
    for project in &cfg.projects {
        let monitor = MonitorLoop::from_config(project, poll_interval, sink.clone())
            .with_context(|| format!("Failed to start project {:?}", project.name))?;
        monitors.push(monitor);
    }

    for monitor in monitors {
        let handle = monitor.spawn(coordinator.child_token());
        coordinator.register(handle);
    }

    Ok(coordinator)
}
