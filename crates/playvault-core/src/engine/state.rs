//! Shared per-transfer state
//!
//! One `TransferState` is allocated when a transfer starts and shared
//! between the manager, the scheduler, the chunk workers and the
//! progress reporter. The chunk table is a fixed arena indexed by chunk
//! id; workers never hold references into it, they go through the
//! mutex-guarded accessors here.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use playvault_types::{
    Chunk, ChunkStatus, CoreEvent, TransferOptions, TransferSnapshot, TransferStatus,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{broadcast, Notify};
use uuid::Uuid;

/// One slot of the chunk arena. `not_before` delays retry-eligible
/// chunks; `rate_limit_waits` is the separate 429/503 budget that does
/// not consume `chunk.retries`.
#[derive(Debug, Clone)]
pub struct ChunkSlot {
    pub chunk: Chunk,
    pub not_before: Option<Instant>,
    pub rate_limit_waits: u32,
}

impl ChunkSlot {
    fn new(chunk: Chunk) -> Self {
        Self {
            chunk,
            not_before: None,
            rate_limit_waits: 0,
        }
    }

    /// Eligible to start right now
    pub fn is_startable(&self, now: Instant) -> bool {
        self.chunk.status == ChunkStatus::Pending
            && self.not_before.map_or(true, |at| at <= now)
    }
}

struct StatusCell {
    status: TransferStatus,
    error: Option<String>,
}

/// Shared mutable state of one transfer
pub struct TransferState {
    pub id: Uuid,
    pub url: String,
    pub destination: PathBuf,
    pub total_size: u64,
    pub options: TransferOptions,
    pub started_at: DateTime<Utc>,
    pub paused: AtomicBool,
    pub cancelled: AtomicBool,
    /// Woken by resume() and cancel() so the scheduler never busy-polls
    pub wake: Notify,
    pub downloaded: AtomicU64,
    chunks: Mutex<Vec<ChunkSlot>>,
    status: Mutex<StatusCell>,
    speed: AtomicU64,
    eta: Mutex<Option<u64>>,
    actual_hash: Mutex<Option<String>>,
    completed_at: Mutex<Option<DateTime<Utc>>>,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl TransferState {
    pub fn new(
        url: String,
        destination: PathBuf,
        total_size: u64,
        chunks: Vec<Chunk>,
        options: TransferOptions,
        event_tx: broadcast::Sender<CoreEvent>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            url,
            destination,
            total_size,
            options,
            started_at: Utc::now(),
            paused: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            wake: Notify::new(),
            downloaded: AtomicU64::new(0),
            chunks: Mutex::new(chunks.into_iter().map(ChunkSlot::new).collect()),
            status: Mutex::new(StatusCell {
                status: TransferStatus::Initializing,
                error: None,
            }),
            speed: AtomicU64::new(0),
            eta: Mutex::new(None),
            actual_hash: Mutex::new(None),
            completed_at: Mutex::new(None),
            event_tx,
        }
    }

    pub fn status(&self) -> TransferStatus {
        self.status.lock().status
    }

    pub fn error(&self) -> Option<String> {
        self.status.lock().error.clone()
    }

    /// Transition the transfer and emit the change. Terminal states are
    /// sticky; a late worker result cannot overwrite them.
    pub fn set_status(&self, status: TransferStatus, error: Option<String>) {
        {
            let mut cell = self.status.lock();
            if cell.status.is_terminal() {
                return;
            }
            cell.status = status;
            cell.error = error.clone();
        }
        if status == TransferStatus::Completed {
            *self.completed_at.lock() = Some(Utc::now());
        }
        let _ = self.event_tx.send(CoreEvent::TransferStatusChanged {
            id: self.id,
            status,
            error,
        });
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// The scheduler is the only waiter on `wake`. `notify_one` stores
    /// a permit when it is not parked yet, so a wake landing between
    /// its flag check and its next await is not lost.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.wake.notify_one();
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    pub fn event_tx(&self) -> &broadcast::Sender<CoreEvent> {
        &self.event_tx
    }

    pub fn set_actual_hash(&self, hash: String) {
        *self.actual_hash.lock() = Some(hash);
    }

    pub fn actual_hash(&self) -> Option<String> {
        self.actual_hash.lock().clone()
    }

    /// Record the latest speed/ETA sample for status snapshots
    pub fn record_rate(&self, speed: u64, eta: Option<u64>) {
        self.speed.store(speed, Ordering::Release);
        *self.eta.lock() = eta;
    }

    // ------------------------------------------------------------------
    // Chunk arena accessors
    // ------------------------------------------------------------------

    /// Run `f` with the locked chunk table
    pub fn with_chunks<R>(&self, f: impl FnOnce(&mut Vec<ChunkSlot>) -> R) -> R {
        f(&mut self.chunks.lock())
    }

    pub fn chunk(&self, index: u32) -> Chunk {
        self.chunks.lock()[index as usize].chunk.clone()
    }

    /// Worker progress callback; keeps `downloaded == Σ chunk.downloaded`
    pub fn add_chunk_progress(&self, index: u32, bytes: u64) {
        self.chunks.lock()[index as usize].chunk.downloaded += bytes;
        self.downloaded.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn set_chunk_status(&self, index: u32, status: ChunkStatus) {
        self.chunks.lock()[index as usize].chunk.status = status;
    }

    pub fn all_chunks_completed(&self) -> bool {
        self.chunks
            .lock()
            .iter()
            .all(|s| s.chunk.status == ChunkStatus::Completed)
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        let chunks: Vec<Chunk> = self
            .chunks
            .lock()
            .iter()
            .map(|s| s.chunk.clone())
            .collect();
        let downloaded = self.downloaded.load(Ordering::Acquire);
        let cell = self.status.lock();
        TransferSnapshot {
            id: self.id,
            status: cell.status,
            downloaded,
            total_size: self.total_size,
            progress: if self.total_size == 0 {
                100.0
            } else {
                (downloaded as f64 / self.total_size as f64) * 100.0
            },
            speed: self.speed.load(Ordering::Acquire),
            eta: *self.eta.lock(),
            error: cell.error.clone(),
            chunks,
        }
    }
}
