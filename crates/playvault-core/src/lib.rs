//! PlayVault Core - Resilient Transfer Engine
//!
//! The transfer layer of the PlayVault game-library service: chunked
//! multi-worker HTTP downloads with resume, pause and cancel, integrity
//! verification and post-processing, a rate-limited request pool for
//! quota-limited metadata providers, and an adapter over an external
//! torrent engine.
//!
//! Everything hangs off one [`TransferCore`] built at process start from
//! a [`CoreConfig`] and passed by reference to callers; there are no
//! hidden singletons. State changes surface on the broadcast event
//! stream so the route/persistence layers can mirror them.

pub mod config;
pub mod engine;
pub mod error;
pub mod net;
pub mod torrent;

pub use config::CoreConfig;
pub use error::TransferError;

use engine::{SourceProbe, TransferManager};
use net::{AdaptiveRateLimiter, RequestPool, ResponseCache};
use playvault_types::{CoreEvent, TransferOptions, TransferSnapshot, VerifyReport};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use torrent::{TorrentEngine, TorrentSessionAdapter};
use uuid::Uuid;

/// The transfer core service instance
pub struct TransferCore {
    config: CoreConfig,
    manager: TransferManager,
    pool: RequestPool,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl TransferCore {
    pub fn new(config: CoreConfig) -> Result<Self, TransferError> {
        let (event_tx, _) = broadcast::channel(1000);

        let manager = TransferManager::new(config.clone(), event_tx.clone())?;

        // One limiter and cache per process, shared by all pool callers
        let limiter = AdaptiveRateLimiter::new(
            config.limiter_base_delay,
            config.limiter_multiplier,
            config.limiter_max_delay,
            config.limiter_recovery_threshold,
        );
        let cache = ResponseCache::new(config.cache_ttl);
        let pool = RequestPool::new(
            config.pool_max_concurrent,
            config.pool_retry_attempts,
            config.pool_initial_retry_delay,
            config.pool_max_retry_delay,
            limiter,
            cache,
        );

        Ok(Self {
            config,
            manager,
            pool,
            event_tx,
        })
    }

    /// Subscribe to core events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    /// Transfer options pre-filled from the core configuration
    pub fn default_options(&self) -> TransferOptions {
        TransferOptions {
            chunk_size: self.config.chunk_size,
            max_threads: self.config.max_threads,
            max_retries: self.config.max_retries,
            rate_limit_budget: self.config.rate_limit_budget,
            expected_hash: None,
            compress: false,
            extract: false,
        }
    }

    // ========================================================================
    // Transfer Operations
    // ========================================================================

    /// Ask the source for its size and whether it honours byte ranges
    pub async fn probe(&self, url: &str) -> Result<SourceProbe, TransferError> {
        self.manager.probe(url).await
    }

    /// Probe the source and start with a plan matched to its range
    /// support. Returns the transfer id.
    pub async fn start_probed(
        &self,
        url: impl Into<String>,
        destination: PathBuf,
        options: TransferOptions,
    ) -> Result<Uuid, TransferError> {
        self.manager
            .start_probed(url.into(), destination, options)
            .await
    }

    /// Start a chunked range download. Returns the transfer id.
    pub async fn start(
        &self,
        url: impl Into<String>,
        destination: PathBuf,
        total_size: u64,
        options: TransferOptions,
    ) -> Result<Uuid, TransferError> {
        self.manager
            .start(url.into(), destination, total_size, options)
            .await
    }

    pub async fn pause(&self, id: Uuid) -> Result<(), TransferError> {
        self.manager.pause(id).await
    }

    pub async fn resume(&self, id: Uuid) -> Result<(), TransferError> {
        self.manager.resume(id).await
    }

    pub async fn cancel(&self, id: Uuid) -> Result<(), TransferError> {
        self.manager.cancel(id).await
    }

    pub async fn status(&self, id: Uuid) -> Result<TransferSnapshot, TransferError> {
        self.manager.status(id).await
    }

    pub async fn verify(&self, id: Uuid) -> Result<VerifyReport, TransferError> {
        self.manager.verify(id).await
    }

    pub async fn active_count(&self) -> usize {
        self.manager.active_count().await
    }

    // ========================================================================
    // Provider Plumbing
    // ========================================================================

    /// The shared request pool for outbound metadata/artwork calls
    pub fn request_pool(&self) -> &RequestPool {
        &self.pool
    }

    /// Build a torrent adapter wired to this core's event stream
    pub fn torrent_adapter(&self, engine: Arc<dyn TorrentEngine>) -> TorrentSessionAdapter {
        TorrentSessionAdapter::new(engine, self.event_tx.clone())
    }
}
