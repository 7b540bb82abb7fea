//! Chunk worker - downloads one byte range into the destination file
//!
//! Each worker issues a ranged GET and streams the body directly to its
//! own byte offset of the pre-allocated destination file. Ranges are
//! disjoint, so file writes need no locking; all status-table updates go
//! through the guarded accessors on `TransferState`.
//!
//! A worker resumes from `chunk.downloaded`, so a retried chunk only
//! refetches the bytes it is missing. Cancellation is checked between
//! stream items; pause is not - an in-flight chunk runs to completion
//! and the scheduler simply starts no new ones.

use crate::engine::state::TransferState;
use crate::error::TransferError;
use futures::StreamExt;
use playvault_types::CoreEvent;
use reqwest::Client;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

/// Event emission throttle inside the stream loop
const EVENT_INTERVAL_MS: u128 = 300;

pub struct ChunkWorker {
    state: Arc<TransferState>,
    index: u32,
    client: Client,
}

impl ChunkWorker {
    pub fn new(state: Arc<TransferState>, index: u32, client: Client) -> Self {
        Self {
            state,
            index,
            client,
        }
    }

    /// Run the chunk download to completion, returning how many bytes
    /// this attempt added.
    pub async fn run(self) -> Result<u64, TransferError> {
        let chunk = self.state.chunk(self.index);
        let start_byte = chunk.start + chunk.downloaded;
        let end_byte = chunk.end;

        if start_byte > end_byte {
            // Fully present from an earlier attempt
            return Ok(0);
        }

        debug!(
            "Chunk {} of {} requesting bytes {}-{}",
            self.index, self.state.id, start_byte, end_byte
        );

        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.state.destination)
            .await?;
        file.seek(std::io::SeekFrom::Start(start_byte)).await?;

        let response = self
            .client
            .get(&self.state.url)
            .header("Range", format!("bytes={}-{}", start_byte, end_byte))
            .send()
            .await?;

        let status = response.status();
        if !(status.is_success() || status.as_u16() == 206) {
            return Err(TransferError::from_status(
                status.as_u16(),
                format!("chunk {} range request rejected", self.index),
            ));
        }
        // A 200 to a mid-file range means the server ignored the Range
        // header; its body starts at offset 0, not at ours
        if status.as_u16() == 200 && start_byte > 0 {
            return Err(TransferError::ServerError {
                status: 200,
                message: format!("server ignored range request for chunk {}", self.index),
            });
        }

        let expected = end_byte - start_byte + 1;
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        let mut last_event = tokio::time::Instant::now();

        while let Some(item) = stream.next().await {
            if self.state.is_cancelled() {
                info!("Chunk {} observed cancellation", self.index);
                file.flush().await?;
                return Err(TransferError::Cancelled);
            }

            let bytes = match item {
                Ok(bytes) => bytes,
                Err(e) => {
                    // Keep what we wrote; the retry resumes after it
                    file.flush().await?;
                    return Err(e.into());
                }
            };
            // Never write past the chunk boundary even if the server
            // over-delivers
            let take = (bytes.len() as u64).min(expected - written);
            if take == 0 {
                break;
            }
            file.write_all(&bytes[..take as usize]).await?;
            written += take;
            self.state.add_chunk_progress(self.index, take);

            if last_event.elapsed().as_millis() >= EVENT_INTERVAL_MS {
                let _ = self.state.event_tx().send(CoreEvent::ChunkProgress {
                    transfer_id: self.state.id,
                    chunk_index: self.index,
                    downloaded: chunk.downloaded + written,
                });
                last_event = tokio::time::Instant::now();
            }
        }

        file.flush().await?;

        if written < expected {
            return Err(TransferError::ShortRead {
                expected,
                got: written,
            });
        }

        debug!(
            "Chunk {} complete ({} bytes this attempt)",
            self.index, written
        );
        Ok(written)
    }
}
