// Local crates
use crate::helpers::shutdown::Shutdown;

// External crates
use tokio::task::JoinHandle;

/// Spawn a listener that triggers `shutdown` on the first termination signal.
pub fn spawn_signal_listener(shutdown: Shutdown) -> JoinHandle<()> {
    tokio::spawn(async move {
        let signal = wait_for_termination().await;
        tracing::info!(signal, "Termination signal received, broadcasting shutdown");
        shutdown.trigger();
    })
}

/// Resolve with the name of the first SIGINT, SIGTERM or (Linux) SIGTSTP.
///
/// A handler that cannot be installed is logged and simply never fires; if
/// none can be installed the process can only be stopped without a final
/// position flush.
pub async fn wait_for_termination() -> &'static str {
    #[cfg(unix)]
    {
        unix::wait().await
    }

    #[cfg(not(unix))]
    {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(e) => {
                tracing::error!(error = %e, "Failed to install Ctrl+C handler, graceful shutdown unavailable");
                std::future::pending().await
            }
        }
    }
}

#[cfg(unix)]
mod unix {
    use tokio::signal::unix::{Signal, SignalKind, signal};

    // Not exposed by tokio's `SignalKind` helpers
    #[cfg(any(target_os = "linux", target_os = "android"))]
    const SIGTSTP: i32 = 20;

    pub(super) async fn wait() -> &'static str {
        let mut terminate = install(SignalKind::terminate(), "SIGTERM");
        let mut interrupt = install(SignalKind::interrupt(), "SIGINT");
        let mut stop = install_tstp();

        tokio::select! {
            _ = next(&mut terminate) => "SIGTERM",
            _ = next(&mut interrupt) => "SIGINT",
            _ = next(&mut stop) => "SIGTSTP",
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn install_tstp() -> Option<Signal> {
        install(SignalKind::from_raw(SIGTSTP), "SIGTSTP")
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn install_tstp() -> Option<Signal> {
        None
    }

    fn install(kind: SignalKind, name: &'static str) -> Option<Signal> {
        match signal(kind) {
            Ok(stream) => Some(stream),
            Err(e) => {
                tracing::error!(error = %e, signal = name, "Failed to install signal handler");
                None
            }
        }
    }

    async fn next(stream: &mut Option<Signal>) {
        if let Some(stream) = stream {
            if stream.recv().await.is_some() {
                return;
            }
        }
        std::future::pending().await
    }
}
