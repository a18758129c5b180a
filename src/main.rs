use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use roombook::clock::SystemClock;
use roombook::config::Config;
use roombook::{http, observability, reaper};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    observability::init_logging("info");

    let config = Config::from_env();
    let orch = roombook::build(&config, Arc::new(SystemClock))?;

    tokio::spawn(reaper::run_compactor(
        orch.engine().clone(),
        config.compact_threshold,
    ));
    tokio::spawn(reaper::run_cache_sweeper(
        orch.cache().clone(),
        config.cache_sweep_interval,
    ));

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("roombook listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  rooms loaded: {}", orch.engine().room_count());
    info!("  cache ttl: {}s", config.cache_ttl.num_seconds());
    info!("  lock timeout: {:?}", config.lock_timeout);

    axum::serve(listener, http::router(orch))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("roombook stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("ctrl-c handler unavailable: {e}");
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
                warn!("SIGTERM handler unavailable: {e}");
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
    info!("shutdown signal received, draining requests");
}
