use tokio::sync::watch;
use tracing::{error, info};

/// Channel that flips to `true` on Ctrl+C.
pub fn on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            // Keep the sender alive so receivers never observe a shutdown.
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
        let _ = tx.send(true);
    });
    rx
}

/// Resolves once `shutdown` has flipped to `true` or its sender is gone.
pub async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
