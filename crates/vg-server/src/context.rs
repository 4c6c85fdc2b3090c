//! Application context shared by handlers and the background processor.
//!
//! Every collaborator is constructed explicitly and injected here, including
//! the [`StatusChannel`]; nothing is reached through process-wide globals.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use vg_av::MediaProber;
use vg_core::config::Config;
use vg_core::events::StatusChannel;
use vg_db::pool::DbPool;

use crate::blob::BlobStore;
use crate::classifier::SensitivityClassifier;
use crate::processor::{JobQueue, JobReceiver};
use crate::token::TokenSigner;

/// Application context shared by all request handlers (via Axum state).
///
/// This is cheaply cloneable because it only holds `Arc`s.
#[derive(Clone)]
pub struct AppContext {
    /// Database connection pool.
    pub db: DbPool,
    /// Immutable application configuration snapshot.
    pub config: Arc<Config>,
    /// Raw media and thumbnail storage.
    pub blobs: Arc<dyn BlobStore>,
    /// Media prober; availability is fixed at construction.
    pub prober: Arc<dyn MediaProber>,
    pub classifier: Arc<dyn SensitivityClassifier>,
    /// Per-owner status publish/subscribe hub.
    pub status: Arc<StatusChannel>,
    /// Credential issuer/verifier.
    pub tokens: Arc<TokenSigner>,
    /// Orchestration scheduling.
    pub jobs: JobQueue,
    /// Cancelled on shutdown; long-lived responses end when it fires.
    pub shutdown: CancellationToken,
}

impl AppContext {
    /// Assemble a context. The returned receiver must be handed to
    /// [`crate::processor::run_processor`].
    pub fn new(
        config: Config,
        db: DbPool,
        blobs: Arc<dyn BlobStore>,
        prober: Arc<dyn MediaProber>,
        classifier: Arc<dyn SensitivityClassifier>,
    ) -> (Self, JobReceiver) {
        let (jobs, receiver) = JobQueue::new();
        let tokens = Arc::new(TokenSigner::new(&config.auth.token_secret));
        let ctx = Self {
            db,
            config: Arc::new(config),
            blobs,
            prober,
            classifier,
            status: Arc::new(StatusChannel::new()),
            tokens,
            jobs,
            shutdown: CancellationToken::new(),
        };
        (ctx, receiver)
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("prober", &self.prober.name())
            .field("prober_available", &self.prober.is_available())
            .finish_non_exhaustive()
    }
}
