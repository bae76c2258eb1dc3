/// Signal handling for graceful shutdown.
///
/// Handles SIGINT (Ctrl-C) and SIGTERM. Either one resolves the shutdown
/// future; the orchestrator then terminates the download child before exiting.
use tokio::signal::unix::{signal, SignalKind};

/// Which signal requested the shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl ShutdownSignal {
    /// Shell convention: 128 + signal number.
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownSignal::Interrupt => 130,
            ShutdownSignal::Terminate => 143,
        }
    }
}

/// Wait for SIGINT or SIGTERM.
///
/// Falls back to `ctrl_c` alone if the SIGTERM handler cannot be installed.
pub async fn shutdown_signal() -> ShutdownSignal {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler, only Ctrl-C will stop the download cleanly");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            return ShutdownSignal::Interrupt;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGINT handler");
            sigterm.recv().await;
            return ShutdownSignal::Terminate;
        }
    };

    let received = tokio::select! {
        _ = sigint.recv() => ShutdownSignal::Interrupt,
        _ = sigterm.recv() => ShutdownSignal::Terminate,
    };
    tracing::info!(signal = ?received, "shutdown signal received");
    received
}
