//! Chunked transfer engine
//!
//! The engine turns one URL + size into a chunk plan, drives the plan
//! with a bounded worker pool, and finishes with integrity verification
//! and optional post-processing.

mod chunk_worker;
mod manager;
pub mod planner;
mod state;
mod transfer_task;

pub mod integrity;
pub mod postprocess;
pub mod progress;

pub use manager::{SourceProbe, TransferManager};
pub use state::{ChunkSlot, TransferState};
