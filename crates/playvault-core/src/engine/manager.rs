//! Transfer manager - tracks all active transfers
//!
//! Top-level coordinator for the chunked HTTP engine: starts transfer
//! tasks, keeps the shared state of every known transfer for status
//! queries, and routes pause/resume/cancel to the running task.

use crate::config::CoreConfig;
use crate::engine::integrity;
use crate::engine::planner::plan_chunks;
use crate::engine::state::TransferState;
use crate::engine::transfer_task::TransferTask;
use crate::error::TransferError;
use crate::net::rate_limiter::AdaptiveRateLimiter;
use playvault_types::{CoreEvent, TransferOptions, TransferSnapshot, TransferStatus, VerifyReport};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

/// Handle to one running transfer task
struct TaskHandle {
    _join: tokio::task::JoinHandle<Result<(), TransferError>>,
}

/// What a source told us about itself before planning
#[derive(Debug, Clone, Copy)]
pub struct SourceProbe {
    pub size: Option<u64>,
    pub accepts_ranges: bool,
}

pub struct TransferManager {
    config: CoreConfig,
    client: reqwest::Client,
    /// Every transfer seen this session, running or settled
    registry: Arc<RwLock<HashMap<Uuid, Arc<TransferState>>>>,
    /// Join handles for transfers whose task is alive
    active: Arc<RwLock<HashMap<Uuid, TaskHandle>>>,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl TransferManager {
    pub fn new(
        config: CoreConfig,
        event_tx: broadcast::Sender<CoreEvent>,
    ) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TransferError::Unknown(e.to_string()))?;

        Ok(Self {
            config,
            client,
            registry: Arc::new(RwLock::new(HashMap::new())),
            active: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
        })
    }

    /// Ask the source for its size and range support: HEAD first, then
    /// a 1-byte ranged GET for servers that reject HEAD.
    pub async fn probe(&self, url: &str) -> Result<SourceProbe, TransferError> {
        url::Url::parse(url).map_err(|_| TransferError::InvalidUrl(url.to_string()))?;

        if let Ok(response) = self.client.head(url).send().await {
            if response.status().is_success() {
                let size = header_u64(&response, reqwest::header::CONTENT_LENGTH);
                let accepts_ranges = response
                    .headers()
                    .get(reqwest::header::ACCEPT_RANGES)
                    .and_then(|v| v.to_str().ok())
                    .map_or(false, |v| v.eq_ignore_ascii_case("bytes"));
                return Ok(SourceProbe {
                    size,
                    accepts_ranges,
                });
            }
        }

        let response = self
            .client
            .get(url)
            .header(reqwest::header::RANGE, "bytes=0-0")
            .send()
            .await?;
        let status = response.status();
        if status.as_u16() == 206 {
            // Content-Range: bytes 0-0/<total>
            let size = response
                .headers()
                .get(reqwest::header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.rsplit('/').next())
                .and_then(|total| total.parse().ok());
            Ok(SourceProbe {
                size,
                accepts_ranges: true,
            })
        } else if status.is_success() {
            Ok(SourceProbe {
                size: header_u64(&response, reqwest::header::CONTENT_LENGTH),
                accepts_ranges: false,
            })
        } else {
            Err(TransferError::from_status(
                status.as_u16(),
                "probe request rejected",
            ))
        }
    }

    /// Probe the source, then start. A server without range support
    /// gets a single-chunk plan so only one sequential request runs.
    pub async fn start_probed(
        &self,
        url: String,
        destination: PathBuf,
        mut options: TransferOptions,
    ) -> Result<Uuid, TransferError> {
        let probe = self.probe(&url).await?;
        let total_size = probe.size.ok_or_else(|| {
            TransferError::InvalidOperation(format!("source {url} did not report a size"))
        })?;
        if !probe.accepts_ranges {
            options.chunk_size = total_size.max(1);
        }
        self.start(url, destination, total_size, options).await
    }

    /// Plan chunks and launch the transfer task. Returns the transfer id.
    pub async fn start(
        &self,
        url: String,
        destination: PathBuf,
        total_size: u64,
        options: TransferOptions,
    ) -> Result<Uuid, TransferError> {
        url::Url::parse(&url).map_err(|_| TransferError::InvalidUrl(url.clone()))?;

        let chunks = plan_chunks(total_size, options.chunk_size, options.max_retries);
        let state = Arc::new(TransferState::new(
            url,
            destination,
            total_size,
            chunks,
            options,
            self.event_tx.clone(),
        ));
        let id = state.id;

        info!(
            "Registering transfer {} ({} chunks, {} workers)",
            id,
            state.with_chunks(|c| c.len()),
            state.options.max_threads
        );
        self.registry.write().await.insert(id, state.clone());
        self.spawn_task(state).await;
        Ok(id)
    }

    async fn spawn_task(&self, state: Arc<TransferState>) {
        let id = state.id;
        let limiter = AdaptiveRateLimiter::new(
            self.config.limiter_base_delay,
            self.config.limiter_multiplier,
            self.config.limiter_max_delay,
            self.config.limiter_recovery_threshold,
        );
        let task = TransferTask::new(
            state,
            self.client.clone(),
            limiter,
            self.config.retry_delay,
        );

        let active = self.active.clone();
        let join = tokio::spawn(async move {
            let result = task.run().await;
            active.write().await.remove(&id);
            result
        });
        self.active
            .write()
            .await
            .insert(id, TaskHandle { _join: join });
    }

    /// Stop admitting new chunks; in-flight chunks finish. The paused
    /// status is emitted immediately so the mirror stays responsive.
    pub async fn pause(&self, id: Uuid) -> Result<(), TransferError> {
        let state = self.lookup(id).await?;
        if state.status().is_terminal() {
            return Err(TransferError::InvalidOperation(format!(
                "transfer {id} already settled"
            )));
        }
        state.pause();
        state.set_status(TransferStatus::Paused, None);
        info!("Transfer {} paused", id);
        Ok(())
    }

    /// Wake a paused transfer. If its task already exited (process
    /// lifetime of an earlier pause), a fresh task picks the remaining
    /// chunks up from their recorded offsets.
    pub async fn resume(&self, id: Uuid) -> Result<(), TransferError> {
        let state = self.lookup(id).await?;
        if state.status() != TransferStatus::Paused {
            return Err(TransferError::InvalidOperation(format!(
                "transfer {id} is not paused"
            )));
        }
        state.set_status(TransferStatus::Downloading, None);
        state.resume();

        if !self.active.read().await.contains_key(&id) {
            info!("Transfer {} task gone, restarting workers", id);
            self.spawn_task(state).await;
        } else {
            info!("Transfer {} resumed", id);
        }
        Ok(())
    }

    /// Cooperative cancel: no new chunks start, workers bail at the next
    /// stream item, no further progress events are emitted.
    pub async fn cancel(&self, id: Uuid) -> Result<(), TransferError> {
        let state = self.lookup(id).await?;
        state.cancel();
        if self.active.read().await.contains_key(&id) {
            // The task observes the flag and settles the status itself
            info!("Signalled cancel for transfer {}", id);
        } else {
            state.set_status(TransferStatus::Cancelled, None);
            info!("Transfer {} cancelled while idle", id);
        }
        Ok(())
    }

    pub async fn status(&self, id: Uuid) -> Result<TransferSnapshot, TransferError> {
        Ok(self.lookup(id).await?.snapshot())
    }

    /// Re-hash the finished file against the caller's expected hash
    pub async fn verify(&self, id: Uuid) -> Result<VerifyReport, TransferError> {
        let state = self.lookup(id).await?;
        if state.status() != TransferStatus::Completed {
            return Err(TransferError::InvalidOperation(format!(
                "transfer {id} has not completed"
            )));
        }
        let report =
            integrity::verify(&state.destination, state.options.expected_hash.as_deref()).await?;
        state.set_actual_hash(report.actual_hash.clone());
        if !report.is_valid {
            warn!("Transfer {} failed verification", id);
        }
        let _ = self.event_tx.send(CoreEvent::IntegrityChecked {
            id,
            report: report.clone(),
        });
        Ok(report)
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    async fn lookup(&self, id: Uuid) -> Result<Arc<TransferState>, TransferError> {
        self.registry
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(TransferError::NotFound(id))
    }
}

fn header_u64(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}
