//! Shared types for PlayVault
//!
//! This crate contains the plain data structures shared between the
//! transfer core and its consumers (route layer, persistence mirror, UI).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

// ============================================================================
// Transfer Types
// ============================================================================

/// A single resumable transfer and its chunk table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub id: Uuid,
    pub url: String,
    pub destination: PathBuf,
    pub total_size: u64,
    pub downloaded: u64,
    pub status: TransferStatus,
    pub chunks: Vec<Chunk>,
    /// Instantaneous smoothed speed in bytes/sec
    pub speed: u64,
    /// Estimated seconds remaining, None while speed is zero
    pub eta: Option<u64>,
    pub error: Option<String>,
    /// Expected content hash (lowercase hex SHA-256), if the caller has one
    pub expected_hash: Option<String>,
    /// Hash computed by the verifier after completion
    pub actual_hash: Option<String>,
    /// Produce a gzip sibling artifact after completion
    pub compress: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Transfer {
    pub fn new(url: String, destination: PathBuf, total_size: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            url,
            destination,
            total_size,
            downloaded: 0,
            status: TransferStatus::Initializing,
            chunks: Vec::new(),
            speed: 0,
            eta: None,
            error: None,
            expected_hash: None,
            actual_hash: None,
            compress: false,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            100.0
        } else {
            (self.downloaded as f64 / self.total_size as f64) * 100.0
        }
    }
}

/// Status of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Initializing,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

/// One fixed byte range of a transfer, the unit of parallel work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub index: u32,
    pub start: u64,
    /// Inclusive end offset
    pub end: u64,
    pub downloaded: u64,
    pub status: ChunkStatus,
    /// Transient-failure retries consumed so far
    pub retries: u32,
    /// Hard retry ceiling; once reached the chunk is terminally failed
    pub max_retries: u32,
}

impl Chunk {
    pub fn new(index: u32, start: u64, end: u64, max_retries: u32) -> Self {
        Self {
            index,
            start,
            end,
            downloaded: 0,
            status: ChunkStatus::Pending,
            retries: 0,
            max_retries,
        }
    }

    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn remaining(&self) -> u64 {
        self.size().saturating_sub(self.downloaded)
    }
}

/// Status of a single chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

/// Caller-supplied knobs for one transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferOptions {
    /// Fixed chunk size in bytes
    pub chunk_size: u64,
    /// Concurrency ceiling for chunk workers
    pub max_threads: usize,
    /// Hard per-chunk retry ceiling for transient failures
    pub max_retries: u32,
    /// Separate wait budget for rate-limit (429/503) responses;
    /// these do not consume `max_retries`
    pub rate_limit_budget: u32,
    /// Expected SHA-256 (lowercase hex) to verify after completion
    pub expected_hash: Option<String>,
    /// Gzip the finished file into a sibling artifact
    pub compress: bool,
    /// Scan the destination directory for archives and extract them
    pub extract: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: 50 * 1024 * 1024,
            max_threads: 4,
            max_retries: 5,
            rate_limit_budget: 20,
            expected_hash: None,
            compress: false,
            extract: false,
        }
    }
}

/// Read-only view of a transfer returned by `status()`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSnapshot {
    pub id: Uuid,
    pub status: TransferStatus,
    pub downloaded: u64,
    pub total_size: u64,
    pub progress: f64,
    pub speed: u64,
    pub eta: Option<u64>,
    pub error: Option<String>,
    pub chunks: Vec<Chunk>,
}

/// Result of an integrity check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyReport {
    pub is_valid: bool,
    pub actual_hash: String,
    pub expected_hash: Option<String>,
}

/// Result of the compression stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionReport {
    pub artifact: PathBuf,
    pub original_size: u64,
    pub compressed_size: u64,
    /// compressed / original, in (0, 1] for compressible input
    pub ratio: f64,
}

// ============================================================================
// Torrent Types
// ============================================================================

/// State machine of a torrent session as seen by the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TorrentState {
    Downloading,
    Paused,
    Completed,
    Unzipping,
    Ready,
    UnzipError,
    Error,
}

impl TorrentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TorrentState::Ready | TorrentState::UnzipError | TorrentState::Error
        )
    }
}

/// Periodic progress figures reported by the torrent engine
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TorrentProgress {
    pub downloaded: u64,
    pub total: u64,
    /// Bytes per second
    pub speed: u64,
    pub peers: u32,
}

impl TorrentProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.downloaded as f64 / self.total as f64) * 100.0
        }
    }

    pub fn eta(&self) -> Option<u64> {
        if self.speed == 0 {
            None
        } else {
            Some(self.total.saturating_sub(self.downloaded) / self.speed)
        }
    }
}

// ============================================================================
// Request Pool Types
// ============================================================================

/// Point-in-time counters from the request pool
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RequestPoolStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub retried: u64,
    pub queue_length: u64,
    pub executing: u64,
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the core; the excluded persistence/notification
/// layers mirror transfer state from this stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    TransferProgress {
        id: Uuid,
        downloaded: u64,
        total: u64,
        speed: u64,
        eta: Option<u64>,
    },
    ChunkProgress {
        transfer_id: Uuid,
        chunk_index: u32,
        downloaded: u64,
    },
    TransferStatusChanged {
        id: Uuid,
        status: TransferStatus,
        error: Option<String>,
    },
    IntegrityChecked {
        id: Uuid,
        report: VerifyReport,
    },
    CompressionFinished {
        id: Uuid,
        report: CompressionReport,
    },
    ExtractionStarted {
        id: Uuid,
        archive: PathBuf,
    },
    ExtractionFinished {
        id: Uuid,
        archive: PathBuf,
    },
    ExtractionFailed {
        id: Uuid,
        archive: PathBuf,
        error: String,
    },
    TorrentProgressed {
        id: Uuid,
        progress: TorrentProgress,
        percent: f64,
        eta: Option<u64>,
    },
    TorrentStateChanged {
        id: Uuid,
        state: TorrentState,
        error: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_is_inclusive_range() {
        let chunk = Chunk::new(0, 0, 49, 5);
        assert_eq!(chunk.size(), 50);
        assert_eq!(chunk.remaining(), 50);
    }

    #[test]
    fn empty_transfer_reports_full_progress() {
        let t = Transfer::new("http://x".into(), PathBuf::from("/tmp"), 0);
        assert_eq!(t.progress(), 100.0);
    }

    #[test]
    fn torrent_eta_undefined_at_zero_speed() {
        let p = TorrentProgress {
            downloaded: 10,
            total: 100,
            speed: 0,
            peers: 0,
        };
        assert_eq!(p.eta(), None);
        let p = TorrentProgress { speed: 30, ..p };
        assert_eq!(p.eta(), Some(3));
    }
}
