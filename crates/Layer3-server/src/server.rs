//! Serving the API and shutting down cleanly
//!
//! On SIGINT/SIGTERM the dispatcher shuts down in the configured mode before
//! the listener stops, so blocking requests still get their answer. In join
//! mode a second signal escalates to terminate.

use crate::routes::router;
use fnjob_foundation::{Result, ServerConfig, ShutdownMode};
use fnjob_task::JobDispatcher;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Serve until a signal arrives (or forever when signals are not registered)
pub async fn serve(dispatcher: Arc<JobDispatcher>, config: &ServerConfig) -> Result<()> {
    if config.register_signals {
        let on_signal = shutdown_on_signal(Arc::clone(&dispatcher), config.shutdown_mode);
        serve_with_shutdown(dispatcher, config, on_signal).await
    } else {
        serve_with_shutdown(dispatcher, config, std::future::pending()).await
    }
}

/// Serve until `shutdown` resolves, then shut the dispatcher down if the
/// future did not already do so
pub async fn serve_with_shutdown<F>(
    dispatcher: Arc<JobDispatcher>,
    config: &ServerConfig,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(Arc::clone(&dispatcher), config.status_poll_interval());
    let address = config.bind_address();
    let listener = TcpListener::bind(address.as_str()).await?;

    let reaper = Arc::clone(&dispatcher).start_reaper(config.reaper_interval());
    info!(
        "Start Server {} ({} functions, shutdown mode {})",
        address,
        dispatcher.registry().len(),
        config.shutdown_mode
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;
    reaper.abort();

    if dispatcher.is_accepting() {
        dispatcher.shutdown(config.shutdown_mode).await?;
    }
    served?;

    info!("Server stopped");
    Ok(())
}

/// Wait for a signal, then shut the dispatcher down in `mode`
pub async fn shutdown_on_signal(dispatcher: Arc<JobDispatcher>, mode: ShutdownMode) {
    wait_for_signal().await;

    let result = match mode {
        ShutdownMode::Terminate => dispatcher.shutdown(ShutdownMode::Terminate).await,
        ShutdownMode::Join => {
            info!("Joining workers now. Press Ctrl+C again to force exit.");
            tokio::select! {
                result = dispatcher.shutdown(ShutdownMode::Join) => result,
                _ = wait_for_signal() => {
                    warn!("Second signal received, killing workers");
                    dispatcher.shutdown(ShutdownMode::Terminate).await
                }
            }
        }
    };

    if let Err(e) = result {
        warn!("Shutdown incomplete: {}", e);
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
