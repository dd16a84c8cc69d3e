//! Append-only undo log for file mutations.
//!
//! Each record keeps SHA-256 fingerprints of the before/after content and a
//! gzip+base64 snapshot of the *before* content only, so one record undoes
//! exactly one mutation.

use crate::error::AppError;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditHistoryRecord {
    pub ts: String,
    pub path: PathBuf,
    #[serde(default)]
    pub meta: Value,
    pub before_sha256: String,
    pub after_sha256: String,
    pub before_gzip_b64: String,
    #[serde(default = "default_true")]
    pub existed_before: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub path: PathBuf,
    /// The file did not exist before the edit and was removed again.
    pub removed: bool,
    pub restored_bytes: usize,
}

pub fn sha256_hex(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}

fn encode_snapshot(content: &[u8]) -> Result<String, AppError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content)?;
    let gz = encoder.finish()?;
    Ok(BASE64_STANDARD.encode(gz))
}

fn decode_snapshot(payload: &str) -> Result<Vec<u8>, AppError> {
    let gz = BASE64_STANDARD
        .decode(payload.as_bytes())
        .map_err(|e| AppError::RollbackError(format!("Corrupt snapshot encoding: {}", e)))?;
    let mut raw = Vec::new();
    GzDecoder::new(gz.as_slice()).read_to_end(&mut raw)?;
    Ok(raw)
}

#[derive(Debug, Clone)]
pub struct RollbackLog {
    history_file: PathBuf,
}

impl RollbackLog {
    pub fn new(history_file: impl Into<PathBuf>) -> Self {
        Self {
            history_file: history_file.into(),
        }
    }

    pub fn history_file(&self) -> &Path {
        &self.history_file
    }

    #[instrument(skip(self, before, after, meta), fields(path = %path.display()))]
    pub async fn append(
        &self,
        path: &Path,
        before: &[u8],
        after: &[u8],
        existed_before: bool,
        meta: Value,
    ) -> Result<EditHistoryRecord, AppError> {
        if let Some(parent) = self.history_file.parent() {
            fs::create_dir_all(parent).await?;
        }
        let record = EditHistoryRecord {
            ts: Utc::now().to_rfc3339(),
            path: path.to_path_buf(),
            meta,
            before_sha256: sha256_hex(before),
            after_sha256: sha256_hex(after),
            before_gzip_b64: encode_snapshot(before)?,
            existed_before,
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_file)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!(before = %record.before_sha256, after = %record.after_sha256, "Edit recorded");
        Ok(record)
    }

    async fn read_lines(&self) -> Result<Vec<String>, AppError> {
        match fs::read_to_string(&self.history_file).await {
            Ok(text) => Ok(text
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn records(&self) -> Result<Vec<EditHistoryRecord>, AppError> {
        self.read_lines()
            .await?
            .iter()
            .map(|line| serde_json::from_str(line).map_err(AppError::from))
            .collect()
    }

    pub async fn len(&self) -> Result<usize, AppError> {
        Ok(self.read_lines().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool, AppError> {
        Ok(self.len().await? == 0)
    }

    /// Restores the file touched by the most recent record and drops that record.
    ///
    /// Refuses when the file no longer matches the recorded after-content.
    pub async fn rollback_last_edit(&self) -> Result<RollbackOutcome, AppError> {
        self.rollback_inner(false).await
    }

    /// Like [`Self::rollback_last_edit`] but skips the external-modification check.
    pub async fn force_rollback_last_edit(&self) -> Result<RollbackOutcome, AppError> {
        self.rollback_inner(true).await
    }

    #[instrument(skip(self))]
    async fn rollback_inner(&self, force: bool) -> Result<RollbackOutcome, AppError> {
        let mut lines = self.read_lines().await?;
        let last = lines
            .last()
            .ok_or_else(|| AppError::RollbackError("No edit history found".to_string()))?;
        let record: EditHistoryRecord = serde_json::from_str(last)
            .map_err(|e| AppError::RollbackError(format!("Invalid edit history record: {}", e)))?;

        if !force {
            let current = match fs::read(&record.path).await {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            };
            let current_sha = current.as_deref().map(sha256_hex);
            if current_sha.as_deref() != Some(record.after_sha256.as_str()) {
                warn!(path = %record.path.display(), "File changed since the recorded edit; refusing rollback");
                return Err(AppError::RollbackError(format!(
                    "{} was modified after the recorded edit; refusing to overwrite it",
                    record.path.display()
                )));
            }
        }

        let before = decode_snapshot(&record.before_gzip_b64)?;
        if sha256_hex(&before) != record.before_sha256 {
            return Err(AppError::RollbackError(format!(
                "Snapshot for {} does not match its fingerprint",
                record.path.display()
            )));
        }

        let removed = if record.existed_before {
            if let Some(parent) = record.path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&record.path, &before).await?;
            false
        } else {
            match fs::remove_file(&record.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            true
        };

        lines.pop();
        let mut rewritten = lines.join("\n");
        if !rewritten.is_empty() {
            rewritten.push('\n');
        }
        let tmp = self.history_file.with_extension("jsonl.tmp");
        fs::write(&tmp, rewritten.as_bytes()).await?;
        fs::rename(&tmp, &self.history_file).await?;

        info!(path = %record.path.display(), removed, "Rolled back last edit");
        Ok(RollbackOutcome {
            path: record.path,
            removed,
            restored_bytes: before.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn rollback_restores_bytes_and_pops_one_record() {
        let dir = TempDir::new().unwrap();
        let log = RollbackLog::new(dir.path().join("logs/edit_history.jsonl"));
        let file = dir.path().join("a.txt");

        let v1 = b"line one\r\nline two\r\n".to_vec();
        let v2 = b"line one\r\nchanged\r\n".to_vec();
        let v3 = b"third".to_vec();
        std::fs::write(&file, &v1).unwrap();

        std::fs::write(&file, &v2).unwrap();
        log.append(&file, &v1, &v2, true, json!({"type": "edit_lines"})).await.unwrap();
        std::fs::write(&file, &v3).unwrap();
        log.append(&file, &v2, &v3, true, json!({"type": "edit_lines"})).await.unwrap();
        assert_eq!(log.len().await.unwrap(), 2);

        let outcome = log.rollback_last_edit().await.unwrap();
        assert_eq!(outcome.path, file);
        assert!(!outcome.removed);
        assert_eq!(std::fs::read(&file).unwrap(), v2);
        assert_eq!(log.len().await.unwrap(), 1);

        log.rollback_last_edit().await.unwrap();
        assert_eq!(std::fs::read(&file).unwrap(), v1);
        assert!(log.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn rollback_of_created_file_removes_it() {
        let dir = TempDir::new().unwrap();
        let log = RollbackLog::new(dir.path().join("edit_history.jsonl"));
        let file = dir.path().join("new.txt");
        std::fs::write(&file, b"hello").unwrap();
        log.append(&file, b"", b"hello", false, Value::Null).await.unwrap();

        let outcome = log.rollback_last_edit().await.unwrap();
        assert!(outcome.removed);
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn refuses_when_file_changed_externally() {
        let dir = TempDir::new().unwrap();
        let log = RollbackLog::new(dir.path().join("edit_history.jsonl"));
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"after").unwrap();
        log.append(&file, b"before", b"after", true, Value::Null).await.unwrap();
        std::fs::write(&file, b"someone else wrote this").unwrap();

        let err = log.rollback_last_edit().await.unwrap_err();
        assert!(matches!(err, AppError::RollbackError(_)));
        assert_eq!(log.len().await.unwrap(), 1);

        log.force_rollback_last_edit().await.unwrap();
        assert_eq!(std::fs::read(&file).unwrap(), b"before");
        assert_eq!(log.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_log_reports_nothing_to_roll_back() {
        let dir = TempDir::new().unwrap();
        let log = RollbackLog::new(dir.path().join("missing.jsonl"));
        assert!(matches!(log.rollback_last_edit().await, Err(AppError::RollbackError(_))));
    }

    #[test]
    fn snapshot_encoding_is_reversible() {
        let payload = encode_snapshot("ünïcode\n".as_bytes()).unwrap();
        assert_eq!(decode_snapshot(&payload).unwrap(), "ünïcode\n".as_bytes());
    }
}
