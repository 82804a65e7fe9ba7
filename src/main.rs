use log::*;
use service::{config::Config, logging::Logger, AppState};
use sse::Broker;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    let config = Config::new();
    if let Err(e) = Logger::init_logger(&config) {
        eprintln!("Failed to start logger: {e}");
    }

    info!(
        "Starting chat stream service [{}]",
        config.runtime_env()
    );

    let shutdown = CancellationToken::new();
    let broker = Broker::new(config.broker_config());
    let app_state = AppState::new(config.clone(), broker.handle());
    let broker_task = tokio::spawn(broker.start(shutdown.clone()));

    tokio::spawn(shutdown_signal(shutdown.clone()));

    if let Err(e) = web::init_server(app_state, shutdown.clone()).await {
        error!("Server error: {e}");
    }
    // The server may also stop on its own, e.g. when binding fails
    shutdown.cancel();

    match tokio::time::timeout(config.shutdown_timeout(), broker_task).await {
        Ok(Ok(())) => info!("Shutdown complete"),
        Ok(Err(e)) => error!("Broker task failed: {e}"),
        Err(_) => warn!(
            "Broker did not stop within {:?}, exiting anyway",
            config.shutdown_timeout()
        ),
    }
}

/// Cancels `shutdown` on SIGINT or SIGTERM.
async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let signal_name = {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigint, mut sigterm) = match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to bind shutdown signals: {e}");
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
            _ = shutdown.cancelled() => return,
        }
    };

    #[cfg(not(unix))]
    let signal_name = {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for shutdown signal: {e}");
                    return;
                }
                "CTRL_C"
            }
            _ = shutdown.cancelled() => return,
        }
    };

    info!("Shutdown signal received ({signal_name}), closing streams");
    shutdown.cancel();
}
