// Graceful shutdown signal handling.
use tracing::{error, info};

/// Resolves once the process is asked to stop: ctrl-c everywhere, plus
/// SIGTERM where the platform has one.
pub async fn shutdown_signal() {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!("ctrl-c handler failed: {err}");
            }
        }
        _ = sigterm() => {}
    }
    info!("shutdown signal received, draining in-flight requests");
}

#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(err) => {
            // Without a SIGTERM handler we still want ctrl-c to work, so
            // park this branch instead of failing the select.
            error!("SIGTERM handler failed: {err}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
