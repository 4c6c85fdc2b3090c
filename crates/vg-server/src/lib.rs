//! vg-server: HTTP API server and background video processor.
//!
//! This crate ties together all other vg-* crates into a running server
//! application. It provides:
//!
//! - Axum-based HTTP API for upload, metadata, moderation, and streaming
//! - Background orchestrator that probes, classifies, and thumbnails uploads
//! - Per-owner status updates over SSE
//! - Graceful shutdown via signal handling

pub mod blob;
pub mod classifier;
pub mod context;
pub mod error;
pub mod middleware;
pub mod processor;
pub mod router;
pub mod routes;
pub mod token;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use vg_core::config::Config;

use crate::blob::LocalBlobStore;
use crate::classifier::KeywordClassifier;
use crate::context::AppContext;
use crate::processor::JobReceiver;

/// Start the vidgate server.
///
/// This is the main entry point. It initializes storage, constructs the
/// [`AppContext`], and runs the HTTP server alongside the processor.
/// Returns when a shutdown signal is received.
pub async fn start(config: Config) -> vg_core::Result<()> {
    // Refuse to serve without a private signing secret.
    config.auth.signing_secret()?;

    // Validate configuration.
    for warning in config.validate() {
        tracing::warn!("Config warning: {warning}");
    }

    // Initialize database.
    let db_path = &config.server.db_path;
    let existed = db_path.exists();
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created database directory {}", parent.display());
        }
    }
    let db_str = db_path.to_string_lossy();
    let db = vg_db::pool::init_pool(&db_str)?;
    if existed {
        tracing::info!("Database opened (existing) at {db_str}");
    } else {
        tracing::info!("Database created (new) at {db_str}");
    }

    let blobs = LocalBlobStore::open_root(&config.server.blob_dir).await?;
    tracing::info!("Blob store at {}", blobs.root().display());

    // Discover external tools.
    let tools = vg_av::ToolRegistry::discover(&config.tools);
    for info in tools.check_all() {
        if info.available {
            tracing::info!(
                "Tool found: {} ({})",
                info.name,
                info.version.as_deref().unwrap_or("unknown version")
            );
        } else {
            tracing::warn!("Tool not found: {}; uploads will complete without metadata", info.name);
        }
    }
    let prober = vg_av::FfmpegProber::from_registry(&tools, &config.processing);
    let classifier = KeywordClassifier::from_config(&config.moderation);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| vg_core::Error::Internal(format!("Invalid server address: {e}")))?;

    let (ctx, jobs) = AppContext::new(
        config,
        db,
        Arc::new(blobs),
        Arc::new(prober),
        Arc::new(classifier),
    );

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| vg_core::Error::Internal(format!("Failed to bind to {addr}: {e}")))?;
    tracing::info!("Starting server on {addr}");

    let shutdown = ctx.shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    run(ctx, jobs, listener).await
}

/// Serve `ctx` on an already-bound listener until `ctx.shutdown` fires.
///
/// Runs the recovery sweep, spawns the processor, then serves HTTP. On
/// shutdown, in-flight orchestrations are allowed to finish.
pub async fn run(ctx: AppContext, jobs: JobReceiver, listener: TcpListener) -> vg_core::Result<()> {
    let cancel = ctx.shutdown.clone();

    match processor::recover_stale(&ctx) {
        Ok(0) => {}
        Ok(n) => tracing::info!("Recovered {n} interrupted videos"),
        Err(e) => tracing::error!("Recovery sweep failed: {e}"),
    }

    let processor_ctx = ctx.clone();
    let processor_cancel = cancel.clone();
    let processor_handle = tokio::spawn(async move {
        processor::run_processor(processor_ctx, jobs, processor_cancel).await;
    });

    let app = router::build_router(ctx);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await;

    // Signal background tasks to stop even if the server failed.
    cancel.cancel();
    if let Err(e) = processor_handle.await {
        tracing::error!("Processor task failed: {e}");
    }

    served?;
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
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

    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn start_refuses_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.db_path = dir.path().join("db/vidgate.db");
        config.server.blob_dir = dir.path().join("blobs");
        config.server.port = 0;

        let err = start(config).await.unwrap_err();
        assert_matches!(err, vg_core::Error::Validation(msg) if msg.contains("token_secret"));
        assert!(!dir.path().join("db").exists());
        assert!(!dir.path().join("blobs").exists());
    }
}
