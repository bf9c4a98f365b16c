use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;

use gradeline_store::{FileSnapshot, InMemoryStore, Store};

use crate::config::GradelineConfig;
use crate::handlers::router;
use crate::pipeline::{Capabilities, Pipeline};

/// Restore state, run the pipeline and HTTP server until Ctrl-C, then drain
/// evaluations and write a final snapshot.
pub async fn serve(config: GradelineConfig, state_dir: &Path) -> Result<()> {
    let snapshot = Arc::new(FileSnapshot::new(state_dir));
    let store = Arc::new(InMemoryStore::from_state(snapshot.load()?));
    if !store.verify_audit_integrity().await? {
        tracing::warn!(
            "Audit chain in {} failed verification",
            snapshot.path().display()
        );
    }

    let registry = Arc::new(config.template_registry()?);
    tracing::info!(templates = registry.len(), "Template registry loaded");

    let capabilities = Capabilities::from_config(&config, state_dir)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pipeline = Pipeline::start(
        &config,
        store.clone(),
        registry,
        capabilities,
        shutdown_rx.clone(),
    )
    .await?;

    let flusher = tokio::spawn(flush_loop(
        store.clone(),
        snapshot.clone(),
        config.snapshot_interval(),
        shutdown_rx,
    ));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    tracing::info!(
        submission_url = %config.submission_url(),
        "Listening on {}",
        listener.local_addr()?
    );

    axum::serve(listener, router(pipeline.state.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("HTTP server failed")?;

    tracing::info!("Shutting down");
    let _ = shutdown_tx.send(true);
    pipeline.join().await;
    let _ = flusher.await;
    flush(&store, &snapshot).await;
    Ok(())
}

async fn flush_loop(
    store: Arc<InMemoryStore>,
    snapshot: Arc<FileSnapshot>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => flush(&store, &snapshot).await,
            Ok(()) = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

async fn flush(store: &InMemoryStore, snapshot: &FileSnapshot) {
    let state = store.snapshot().await;
    if let Err(e) = snapshot.save(&state) {
        tracing::error!("Failed to write state snapshot: {e:#}");
    }
}
