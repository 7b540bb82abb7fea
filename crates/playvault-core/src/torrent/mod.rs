//! Torrent session adapter - façade over an external torrent client
//!
//! The core does not speak the torrent protocol; it consumes an
//! engine's progress figures and issues pause/resume/remove commands.
//! The adapter polls the engine at one hertz, deduplicates unchanged
//! progress, drives the session state machine and hands completed
//! sessions to the post-processing pipeline when auto-extraction was
//! requested.
//!
//! State machine:
//! `Downloading -> {Paused <-> Downloading} -> Completed ->
//! [Unzipping -> Ready | UnzipError]`, or `Downloading -> Error` on a
//! fatal engine failure.

use crate::engine::postprocess;
use crate::error::TransferError;
use parking_lot::Mutex;
use playvault_types::{CoreEvent, TorrentProgress, TorrentState};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info};
use uuid::Uuid;

/// What to download
#[derive(Debug, Clone)]
pub enum TorrentSource {
    Magnet(String),
    /// Path to a .torrent descriptor file
    File(PathBuf),
}

/// Commands and queries the adapter needs from a torrent client
pub trait TorrentEngine: Send + Sync + 'static {
    /// Start a session; returns the engine's session key
    fn add(&self, source: &TorrentSource, output_dir: &Path) -> Result<String, TransferError>;
    fn pause(&self, key: &str) -> Result<(), TransferError>;
    fn resume(&self, key: &str) -> Result<(), TransferError>;
    /// Remove the session and release its resources
    fn remove(&self, key: &str) -> Result<(), TransferError>;
    fn progress(&self, key: &str) -> Result<TorrentProgress, TransferError>;
}

struct Session {
    engine_key: String,
    output_dir: PathBuf,
    auto_extract: bool,
    state: Mutex<TorrentState>,
    paused: AtomicBool,
    cancelled: AtomicBool,
}

impl Session {
    fn set_state(
        &self,
        id: Uuid,
        state: TorrentState,
        error: Option<String>,
        event_tx: &broadcast::Sender<CoreEvent>,
    ) {
        *self.state.lock() = state;
        let _ = event_tx.send(CoreEvent::TorrentStateChanged { id, state, error });
    }
}

pub struct TorrentSessionAdapter {
    engine: Arc<dyn TorrentEngine>,
    sessions: Arc<RwLock<HashMap<Uuid, Arc<Session>>>>,
    event_tx: broadcast::Sender<CoreEvent>,
    poll_interval: Duration,
}

impl TorrentSessionAdapter {
    pub fn new(engine: Arc<dyn TorrentEngine>, event_tx: broadcast::Sender<CoreEvent>) -> Self {
        Self::with_poll_interval(engine, event_tx, Duration::from_secs(1))
    }

    pub fn with_poll_interval(
        engine: Arc<dyn TorrentEngine>,
        event_tx: broadcast::Sender<CoreEvent>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            engine,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            poll_interval,
        }
    }

    /// Start a session and its poll loop. Returns the adapter's id.
    pub async fn start(
        &self,
        source: TorrentSource,
        output_dir: PathBuf,
        auto_extract: bool,
    ) -> Result<Uuid, TransferError> {
        let engine_key = self.engine.add(&source, &output_dir)?;
        let id = Uuid::new_v4();
        let session = Arc::new(Session {
            engine_key,
            output_dir,
            auto_extract,
            state: Mutex::new(TorrentState::Downloading),
            paused: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        });
        self.sessions.write().await.insert(id, session.clone());

        info!("Torrent session {} started ({:?})", id, source);
        let _ = self.event_tx.send(CoreEvent::TorrentStateChanged {
            id,
            state: TorrentState::Downloading,
            error: None,
        });

        let engine = self.engine.clone();
        let event_tx = self.event_tx.clone();
        let poll_interval = self.poll_interval;
        tokio::spawn(async move {
            Self::poll_loop(id, session, engine, event_tx, poll_interval).await;
        });
        Ok(id)
    }

    async fn poll_loop(
        id: Uuid,
        session: Arc<Session>,
        engine: Arc<dyn TorrentEngine>,
        event_tx: broadcast::Sender<CoreEvent>,
        poll_interval: Duration,
    ) {
        let mut interval = tokio::time::interval(poll_interval);
        // Emit only when the figures moved
        let mut last: Option<(u64, u64)> = None;

        loop {
            interval.tick().await;

            // Cancelled sessions go silent immediately
            if session.cancelled.load(Ordering::Acquire) {
                return;
            }
            if session.paused.load(Ordering::Acquire) {
                continue;
            }

            let progress = match engine.progress(&session.engine_key) {
                Ok(p) => p,
                Err(e) => {
                    error!("Torrent session {} engine failure: {}", id, e);
                    session.set_state(id, TorrentState::Error, Some(e.to_string()), &event_tx);
                    return;
                }
            };

            let current = (progress.downloaded, progress.total);
            if last != Some(current) {
                last = Some(current);
                let _ = event_tx.send(CoreEvent::TorrentProgressed {
                    id,
                    progress,
                    percent: progress.percent(),
                    eta: progress.eta(),
                });
            }

            if progress.total > 0 && progress.downloaded >= progress.total {
                info!("Torrent session {} complete", id);
                session.set_state(id, TorrentState::Completed, None, &event_tx);

                if session.auto_extract {
                    session.set_state(id, TorrentState::Unzipping, None, &event_tx);
                    let (_, failed) =
                        postprocess::extract_archives(id, &session.output_dir, &event_tx).await;
                    if failed == 0 {
                        session.set_state(id, TorrentState::Ready, None, &event_tx);
                    } else {
                        session.set_state(
                            id,
                            TorrentState::UnzipError,
                            Some(format!("{failed} archive(s) failed to extract")),
                            &event_tx,
                        );
                    }
                }
                return;
            }
        }
    }

    pub async fn pause(&self, id: Uuid) -> Result<(), TransferError> {
        let session = self.lookup(id).await?;
        self.engine.pause(&session.engine_key)?;
        session.paused.store(true, Ordering::Release);
        session.set_state(id, TorrentState::Paused, None, &self.event_tx);
        Ok(())
    }

    pub async fn resume(&self, id: Uuid) -> Result<(), TransferError> {
        let session = self.lookup(id).await?;
        self.engine.resume(&session.engine_key)?;
        session.paused.store(false, Ordering::Release);
        session.set_state(id, TorrentState::Downloading, None, &self.event_tx);
        Ok(())
    }

    /// Remove the session from the engine; no events follow
    pub async fn cancel(&self, id: Uuid) -> Result<(), TransferError> {
        let session = self
            .sessions
            .write()
            .await
            .remove(&id)
            .ok_or(TransferError::NotFound(id))?;
        session.cancelled.store(true, Ordering::Release);
        self.engine.remove(&session.engine_key)?;
        info!("Torrent session {} cancelled", id);
        Ok(())
    }

    pub async fn state(&self, id: Uuid) -> Result<TorrentState, TransferError> {
        Ok(*self.lookup(id).await?.state.lock())
    }

    async fn lookup(&self, id: Uuid) -> Result<Arc<Session>, TransferError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(TransferError::NotFound(id))
    }
}
