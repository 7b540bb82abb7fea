//! Post-processing pipeline - runs strictly after a transfer completes
//!
//! Two optional stages: gzip compression producing a sibling artifact,
//! and archive extraction over the destination directory. Extraction
//! failures are reported per archive and never revert the transfer's
//! completed status.

use crate::error::TransferError;
use flate2::write::GzEncoder;
use flate2::Compression;
use playvault_types::{CompressionReport, CoreEvent};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

/// Speed/ratio balance; gzip levels above this buy little for game assets
const GZIP_LEVEL: u32 = 6;

/// Gzip `path` into `<path>.gz` and report the achieved ratio
pub async fn compress_file(path: &Path) -> Result<CompressionReport, TransferError> {
    let source = path.to_path_buf();
    let artifact = PathBuf::from(format!("{}.gz", path.display()));
    let target = artifact.clone();

    let (original_size, compressed_size) = tokio::task::spawn_blocking(move || {
        let mut input = fs::File::open(&source)?;
        let output = fs::File::create(&target)?;
        let mut encoder = GzEncoder::new(output, Compression::new(GZIP_LEVEL));

        let mut buffer = vec![0u8; 1024 * 1024];
        let mut original: u64 = 0;
        loop {
            let n = input.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            encoder.write_all(&buffer[..n])?;
            original += n as u64;
        }
        encoder.finish()?.sync_all()?;
        let compressed = fs::metadata(&target)?.len();
        Ok::<_, io::Error>((original, compressed))
    })
    .await
    .map_err(|e| TransferError::Unknown(format!("compression task panicked: {e}")))??;

    Ok(CompressionReport {
        artifact,
        original_size,
        compressed_size,
        ratio: if original_size == 0 {
            1.0
        } else {
            compressed_size as f64 / original_size as f64
        },
    })
}

/// Scan `dir` for known archives and extract each sequentially, deleting
/// the archive on success. Failures are emitted per file; the caller's
/// transfer stays completed either way. Returns (extracted, failed)
/// archive counts.
pub async fn extract_archives(
    transfer_id: Uuid,
    dir: &Path,
    event_tx: &broadcast::Sender<CoreEvent>,
) -> (usize, usize) {
    let archives = match scan_archives(dir) {
        Ok(list) => list,
        Err(e) => {
            warn!("Archive scan of {:?} failed: {}", dir, e);
            let _ = event_tx.send(CoreEvent::ExtractionFailed {
                id: transfer_id,
                archive: dir.to_path_buf(),
                error: e.to_string(),
            });
            return (0, 1);
        }
    };

    let mut extracted = 0;
    let mut failed = 0;
    for archive in archives {
        let _ = event_tx.send(CoreEvent::ExtractionStarted {
            id: transfer_id,
            archive: archive.clone(),
        });

        match extract_zip(&archive, dir).await {
            Ok(entries) => {
                info!("Extracted {} entries from {:?}", entries, archive);
                if let Err(e) = tokio::fs::remove_file(&archive).await {
                    warn!("Could not remove extracted archive {:?}: {}", archive, e);
                }
                let _ = event_tx.send(CoreEvent::ExtractionFinished {
                    id: transfer_id,
                    archive,
                });
                extracted += 1;
            }
            Err(e) => {
                warn!("Extraction of {:?} failed: {}", archive, e);
                let _ = event_tx.send(CoreEvent::ExtractionFailed {
                    id: transfer_id,
                    archive,
                    error: e.to_string(),
                });
                failed += 1;
            }
        }
    }
    (extracted, failed)
}

fn scan_archives(dir: &Path) -> Result<Vec<PathBuf>, io::Error> {
    let mut archives = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file()
            && path
                .extension()
                .map_or(false, |ext| ext.eq_ignore_ascii_case("zip"))
        {
            archives.push(path);
        }
    }
    archives.sort();
    Ok(archives)
}

/// Extract one zip archive into `dir`, refusing entries whose paths
/// escape it. Returns the number of entries written.
pub async fn extract_zip(archive: &Path, dir: &Path) -> Result<usize, TransferError> {
    let archive = archive.to_path_buf();
    let dir = dir.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let file = fs::File::open(&archive)?;
        let mut zip = zip::ZipArchive::new(file).map_err(|e| TransferError::Extraction {
            archive: archive.display().to_string(),
            message: e.to_string(),
        })?;

        let mut written = 0usize;
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i).map_err(|e| TransferError::Extraction {
                archive: archive.display().to_string(),
                message: e.to_string(),
            })?;

            // enclosed_name rejects absolute paths and `..` traversal
            let relative = match entry.enclosed_name() {
                Some(p) => p.to_path_buf(),
                None => {
                    return Err(TransferError::Extraction {
                        archive: archive.display().to_string(),
                        message: format!("entry {} has an unsafe path", entry.name()),
                    })
                }
            };
            let target = dir.join(relative);

            if entry.is_dir() {
                fs::create_dir_all(&target)?;
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = fs::File::create(&target)?;
            io::copy(&mut entry, &mut out)?;
            written += 1;
        }
        Ok(written)
    })
    .await
    .map_err(|e| TransferError::Unknown(format!("extraction task panicked: {e}")))?
}
