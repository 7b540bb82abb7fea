//! Integrity verification - streaming SHA-256 over the finished file
//!
//! Per-chunk digests computed in parallel cannot be combined into a
//! whole-file hash, so verification is a sequential post-pass over the
//! assembled file.

use crate::error::TransferError;
use playvault_types::VerifyReport;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

const READ_BUF: usize = 1024 * 1024;

/// Compute the file's SHA-256 as lowercase hex
pub async fn hash_file(path: &Path) -> Result<String, TransferError> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUF];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Hash the file and compare against `expected` (case-insensitive hex).
/// With no expectation the report carries the actual hash and is valid.
pub async fn verify(path: &Path, expected: Option<&str>) -> Result<VerifyReport, TransferError> {
    let actual = hash_file(path).await?;
    let is_valid = match expected {
        Some(e) => e.eq_ignore_ascii_case(&actual),
        None => true,
    };
    Ok(VerifyReport {
        is_valid,
        actual_hash: actual,
        expected_hash: expected.map(|s| s.to_lowercase()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.bin");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let report = verify(
            &path,
            Some("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"),
        )
        .await
        .unwrap();
        assert!(report.is_valid);
    }

    #[tokio::test]
    async fn repeated_verification_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, vec![7u8; 4096]).await.unwrap();

        let first = hash_file(&path).await.unwrap();
        let second = hash_file(&path).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn mismatch_is_reported_not_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, b"payload").await.unwrap();

        let report = verify(&path, Some("00".repeat(32).as_str())).await.unwrap();
        assert!(!report.is_valid);
        assert_eq!(report.actual_hash.len(), 64);
        // The file is left in place for manual remediation
        assert!(path.exists());
    }
}
