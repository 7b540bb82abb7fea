//! Transfer task - drives one transfer's chunk worker pool
//!
//! The scheduler keeps at most `max_threads` chunk workers in flight,
//! requeues transient failures with a backoff proportional to the
//! attempt number, and pays rate-limit responses out of a separate
//! budget paced by the adaptive limiter. A fatal chunk error stops
//! admission; workers already in flight finish before the transfer is
//! declared failed with the first error's message.
//!
//! Pause and cancel are cooperative: pause stops admission and parks
//! the scheduler on a notify, cancel additionally makes workers bail
//! out between stream items.

use crate::engine::chunk_worker::ChunkWorker;
use crate::engine::integrity;
use crate::engine::postprocess;
use crate::engine::progress::ProgressTracker;
use crate::engine::state::TransferState;
use crate::error::TransferError;
use crate::net::rate_limiter::AdaptiveRateLimiter;
use playvault_types::{ChunkStatus, CoreEvent, TransferStatus};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

pub struct TransferTask {
    state: Arc<TransferState>,
    client: reqwest::Client,
    /// Paces retries after 429/503 from the source host
    limiter: AdaptiveRateLimiter,
    /// Base delay for transient-failure backoff
    retry_delay: Duration,
}

impl TransferTask {
    pub fn new(
        state: Arc<TransferState>,
        client: reqwest::Client,
        limiter: AdaptiveRateLimiter,
        retry_delay: Duration,
    ) -> Self {
        Self {
            state,
            client,
            limiter,
            retry_delay,
        }
    }

    pub async fn run(self) -> Result<(), TransferError> {
        let state = &self.state;
        info!(
            "Starting transfer {}: {} ({} bytes)",
            state.id, state.url, state.total_size
        );

        if state.is_cancelled() {
            state.set_status(TransferStatus::Cancelled, None);
            return Ok(());
        }

        self.preallocate().await?;

        // Zero-byte file: nothing to schedule
        if state.total_size == 0 {
            state.set_status(TransferStatus::Completed, None);
            self.finalize().await;
            return Ok(());
        }

        state.set_status(TransferStatus::Downloading, None);
        let _ = state.event_tx().send(CoreEvent::TransferProgress {
            id: state.id,
            downloaded: state.downloaded.load(Ordering::Acquire),
            total: state.total_size,
            speed: 0,
            eta: None,
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        let reporter = self.spawn_progress_reporter(stop_rx);

        let result = self.run_pool().await;

        let _ = stop_tx.send(true);
        let _ = reporter.await;

        match result {
            Ok(()) => {
                info!("Transfer {} complete", state.id);
                state.set_status(TransferStatus::Completed, None);
                let _ = state.event_tx().send(CoreEvent::TransferProgress {
                    id: state.id,
                    downloaded: state.downloaded.load(Ordering::Acquire),
                    total: state.total_size,
                    speed: 0,
                    eta: Some(0),
                });
                self.finalize().await;
                Ok(())
            }
            Err(TransferError::Cancelled) => {
                info!("Transfer {} cancelled", state.id);
                state.set_status(TransferStatus::Cancelled, None);
                Ok(())
            }
            Err(e) => {
                error!("Transfer {} failed: {}", state.id, e);
                state.set_status(TransferStatus::Failed, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// The destination must exist at its final size before workers
    /// start writing at fixed offsets.
    async fn preallocate(&self) -> Result<(), TransferError> {
        if let Some(parent) = self.state.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.state.destination)
            .await?;
        let current = file.metadata().await?.len();
        if current != self.state.total_size {
            file.set_len(self.state.total_size).await?;
        }
        Ok(())
    }

    async fn run_pool(&self) -> Result<(), TransferError> {
        let state = &self.state;
        let max_threads = state.options.max_threads.max(1);
        let mut join_set: JoinSet<(u32, Result<u64, TransferError>)> = JoinSet::new();
        let mut in_flight = 0usize;
        // First fatal error; once set, no new chunk starts
        let mut fatal: Option<TransferError> = None;

        loop {
            if state.is_cancelled() && fatal.is_none() {
                fatal = Some(TransferError::Cancelled);
            }

            if in_flight == 0 {
                if let Some(e) = fatal.take() {
                    return Err(e);
                }
                if state.all_chunks_completed() {
                    return Ok(());
                }
            }

            let now = Instant::now().into_std();
            let admitting = fatal.is_none() && !state.is_paused() && in_flight < max_threads;

            if admitting {
                let next = state.with_chunks(|chunks| {
                    chunks.iter().position(|s| s.is_startable(now)).map(|i| {
                        chunks[i].chunk.status = ChunkStatus::Downloading;
                        chunks[i].not_before = None;
                        chunks[i].chunk.index
                    })
                });
                if let Some(index) = next {
                    let worker =
                        ChunkWorker::new(state.clone(), index, self.client.clone());
                    join_set.spawn(async move { (index, worker.run().await) });
                    in_flight += 1;
                    continue;
                }
            }

            // Earliest backoff deadline we might admit at
            let next_deadline = if admitting {
                state.with_chunks(|chunks| {
                    chunks
                        .iter()
                        .filter(|s| s.chunk.status == ChunkStatus::Pending)
                        .filter_map(|s| s.not_before)
                        .min()
                })
            } else {
                None
            };

            tokio::select! {
                biased;
                // resume() / cancel()
                _ = state.wake.notified() => {}
                joined = join_set.join_next(), if in_flight > 0 => {
                    in_flight -= 1;
                    if let Some(joined) = joined {
                        self.handle_result(joined, &mut fatal).await;
                    }
                }
                _ = tokio::time::sleep_until(
                        next_deadline.map(Instant::from_std).unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))
                    ), if next_deadline.is_some() => {}
            }
        }
    }

    async fn handle_result(
        &self,
        joined: Result<(u32, Result<u64, TransferError>), tokio::task::JoinError>,
        fatal: &mut Option<TransferError>,
    ) {
        let state = &self.state;
        let (index, result) = match joined {
            Ok(r) => r,
            Err(e) => {
                error!("Chunk worker panicked: {}", e);
                if fatal.is_none() {
                    *fatal = Some(TransferError::Unknown(format!("worker panicked: {e}")));
                }
                return;
            }
        };

        match result {
            Ok(_) => {
                state.set_chunk_status(index, ChunkStatus::Completed);
                self.limiter.record_success().await;
            }
            Err(TransferError::Cancelled) => {
                // Bytes already on disk are kept for a later restart
                state.set_chunk_status(index, ChunkStatus::Pending);
                if fatal.is_none() {
                    *fatal = Some(TransferError::Cancelled);
                }
            }
            Err(e) if e.is_rate_limited() => {
                self.limiter.record_failure(e.status_code()).await;
                let delay = self.limiter.current_delay().await;
                let budget = state.options.rate_limit_budget;
                let exhausted = state.with_chunks(|chunks| {
                    let slot = &mut chunks[index as usize];
                    slot.rate_limit_waits += 1;
                    if slot.rate_limit_waits > budget {
                        slot.chunk.status = ChunkStatus::Failed;
                        true
                    } else {
                        slot.chunk.status = ChunkStatus::Pending;
                        slot.not_before = Some(std::time::Instant::now() + delay);
                        false
                    }
                });
                if exhausted {
                    warn!(
                        "Chunk {} exhausted its rate-limit budget ({})",
                        index, budget
                    );
                    if fatal.is_none() {
                        *fatal = Some(e);
                    }
                } else {
                    warn!(
                        "Chunk {} rate limited, retrying in {:?}: {}",
                        index, delay, e
                    );
                }
            }
            Err(e) if e.is_retryable() => {
                let terminal = state.with_chunks(|chunks| {
                    let slot = &mut chunks[index as usize];
                    slot.chunk.retries += 1;
                    if slot.chunk.retries >= slot.chunk.max_retries {
                        slot.chunk.status = ChunkStatus::Failed;
                        None
                    } else {
                        let attempt = slot.chunk.retries;
                        slot.chunk.status = ChunkStatus::Pending;
                        let delay = self.retry_delay * attempt;
                        slot.not_before = Some(std::time::Instant::now() + delay);
                        Some((attempt, delay))
                    }
                });
                match terminal {
                    Some((attempt, delay)) => {
                        warn!(
                            "Chunk {} failed (attempt {}/{}), retrying in {:?}: {}",
                            index,
                            attempt,
                            state.options.max_retries,
                            delay,
                            e
                        );
                    }
                    None => {
                        error!(
                            "Chunk {} failed permanently after {} retries: {}",
                            index, state.options.max_retries, e
                        );
                        if fatal.is_none() {
                            *fatal = Some(e);
                        }
                    }
                }
            }
            Err(e) => {
                // Non-recoverable (4xx other than 429, malformed response)
                error!("Chunk {} failed fatally: {}", index, e);
                state.set_chunk_status(index, ChunkStatus::Failed);
                if fatal.is_none() {
                    *fatal = Some(e);
                }
            }
        }
    }

    /// Post-completion stages: integrity check, optional compression,
    /// optional archive extraction. None of them revert `Completed`;
    /// failures are reported through the event stream.
    async fn finalize(&self) {
        let state = &self.state;

        if let Some(expected) = state.options.expected_hash.clone() {
            match integrity::verify(&state.destination, Some(&expected)).await {
                Ok(report) => {
                    state.set_actual_hash(report.actual_hash.clone());
                    if !report.is_valid {
                        warn!(
                            "Transfer {} hash mismatch: expected {}, got {}",
                            state.id, expected, report.actual_hash
                        );
                    }
                    let _ = state.event_tx().send(CoreEvent::IntegrityChecked {
                        id: state.id,
                        report,
                    });
                }
                Err(e) => warn!("Transfer {} integrity check failed to run: {}", state.id, e),
            }
        }

        if state.options.compress {
            match postprocess::compress_file(&state.destination).await {
                Ok(report) => {
                    info!(
                        "Transfer {} compressed, ratio {:.2}",
                        state.id, report.ratio
                    );
                    let _ = state.event_tx().send(CoreEvent::CompressionFinished {
                        id: state.id,
                        report,
                    });
                }
                Err(e) => warn!("Transfer {} compression failed: {}", state.id, e),
            }
        }

        if state.options.extract {
            if let Some(dir) = state.destination.parent() {
                let (extracted, failed) =
                    postprocess::extract_archives(state.id, dir, state.event_tx()).await;
                if failed > 0 {
                    warn!(
                        "Transfer {}: {} of {} archives failed to extract",
                        state.id,
                        failed,
                        extracted + failed
                    );
                }
            }
        }
    }

    fn spawn_progress_reporter(
        &self,
        mut stop_rx: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut tracker = ProgressTracker::new(state.total_size);
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = interval.tick() => {}
                }
                // No events after cancellation
                if state.is_cancelled() {
                    break;
                }
                if state.is_paused() {
                    tracker.reset();
                    state.record_rate(0, None);
                    continue;
                }
                let downloaded = state.downloaded.load(Ordering::Acquire);
                if let Some(sample) = tracker.sample(downloaded, std::time::Instant::now()) {
                    state.record_rate(sample.speed, sample.eta);
                    let _ = state.event_tx().send(CoreEvent::TransferProgress {
                        id: state.id,
                        downloaded,
                        total: state.total_size,
                        speed: sample.speed,
                        eta: sample.eta,
                    });
                }
            }
        })
    }
}
