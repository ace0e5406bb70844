//! Process termination signals.

/// Termination request received by the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGINT / Ctrl-C.
    Interrupt,
    /// SIGTERM.
    Terminate,
}

impl Termination {
    /// Conventional signal name, for logs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
        }
    }
}

/// Resolve with the first termination request: Ctrl-C anywhere, SIGTERM on
/// Unix.
///
/// If the SIGTERM handler cannot be installed only Ctrl-C is watched.
pub async fn shutdown_signal() -> Termination {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = tokio::signal::ctrl_c() => Termination::Interrupt,
                _ = sigterm.recv() => Termination::Terminate,
            },
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                wait_for_ctrl_c().await
            }
        }
    }

    #[cfg(not(unix))]
    wait_for_ctrl_c().await
}

async fn wait_for_ctrl_c() -> Termination {
    if let Err(err) = tokio::signal::ctrl_c().await {
        // Without a handler the process can only be stopped by killing it.
        tracing::error!(%err, "ctrl-c signal handler failed");
        std::future::pending::<()>().await;
    }
    Termination::Interrupt
}
