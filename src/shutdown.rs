//! Signal handling: SIGINT/SIGTERM cancel the agent's shutdown token.

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Spawn tasks that cancel `token` on Ctrl+C or, on Unix, SIGTERM.
pub fn spawn_signal_handlers(token: CancellationToken) {
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT, shutting down");
                ctrl_c_token.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for SIGINT"),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM, shutting down");
                token.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for SIGTERM"),
        }
    });
}
