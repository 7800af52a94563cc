//! Signal handling for graceful shutdown.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for a shutdown signal (SIGINT, SIGTERM, or SIGQUIT on Unix).
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut sigint, mut sigterm, mut sigquit) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
    ) {
        (Ok(int), Ok(term), Ok(quit)) => (int, term, quit),
        _ => {
            warn!("Failed to install Unix signal handlers, falling back to Ctrl-C");
            return ctrl_c().await;
        }
    };

    tokio::select! {
        _ = sigint.recv() => {
            info!(message = "Signal received.", signal = "SIGINT");
        }
        _ = sigterm.recv() => {
            info!(message = "Signal received.", signal = "SIGTERM");
        }
        _ = sigquit.recv() => {
            info!(message = "Signal received.", signal = "SIGQUIT");
        }
    }
}

/// Wait for Ctrl-C.
#[cfg(not(unix))]
pub async fn shutdown_signal() {
    ctrl_c().await
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(message = "Signal received.", signal = "CTRL-C"),
        Err(e) => {
            warn!(error = %e, "Failed to listen for Ctrl-C, shutdown only via API");
            std::future::pending::<()>().await
        }
    }
}

/// Cancel `token` once a shutdown signal arrives.
pub fn cancel_on_signal(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal() => token.cancel(),
            _ = token.cancelled() => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_task_exits_when_token_cancelled_elsewhere() {
        let token = CancellationToken::new();
        let handle = cancel_on_signal(token.clone());

        token.cancel();

        tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .expect("signal task should exit promptly")
            .expect("signal task should not panic");
    }

    #[tokio::test]
    async fn test_token_left_alone_without_signal() {
        let token = CancellationToken::new();
        let handle = cancel_on_signal(token.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!token.is_cancelled());
        assert!(!handle.is_finished());

        handle.abort();
    }
}
