use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Notify;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use genqueue_server::config::Config;
use genqueue_server::db::SqliteTaskStore;
use genqueue_server::generator::ScriptGenerator;
use genqueue_server::hub::BroadcastHub;
use genqueue_server::worker::Worker;
use genqueue_server::{routes, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting genqueue-server...");

    let config = Config::from_env().context("invalid configuration")?;

    let db_path = config.db_path();
    let store = SqliteTaskStore::open(&db_path)
        .with_context(|| format!("failed to open task store at {}", db_path.display()))?;
    let interrupted = store
        .fail_interrupted()
        .context("failed to recover interrupted tasks")?;
    if interrupted > 0 {
        tracing::warn!(count = interrupted, "Marked interrupted tasks as failed");
    }
    let store = Arc::new(store);

    let hub = BroadcastHub::start();
    let wake = Arc::new(Notify::new());

    let generator = Arc::new(ScriptGenerator::new(config.generator.clone()));
    let mut worker = Worker::new(
        store.clone(),
        generator,
        hub.clone(),
        wake.clone(),
        config.worker.clone(),
    )
    .spawn();

    let state = AppState {
        store,
        hub: hub.clone(),
        wake,
        history_limit: config.history_limit,
    };
    let app = routes::router(state, &config.document_root);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("Server listening on {}", addr);

    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop_rx.changed().await;
            })
            .await
    });

    let worker_exit = tokio::select! {
        result = worker.finished() => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    let outcome = match worker_exit {
        Some(result) => {
            let err = match result {
                Ok(()) => anyhow::anyhow!("worker exited unexpectedly"),
                Err(e) => anyhow::Error::new(e).context("task store failed"),
            };
            tracing::error!("{:#}", err);
            Err(err)
        }
        None => {
            tracing::info!("Shutdown signal received");
            worker
                .shutdown_and_join()
                .await
                .context("worker stopped with error")
        }
    };

    hub.shutdown().await;
    let _ = stop_tx.send(true);
    match server.await {
        Ok(Err(e)) => tracing::error!("Server error: {}", e),
        Err(e) => tracing::error!("Server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    tracing::info!("Server stopped");
    outcome
}
