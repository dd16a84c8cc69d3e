use crate::config::Config;
use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::error;

const MAX_LOGGED_FIELD_CHARS: usize = 1024;
const SANITIZED_FIELDS: &[&str] = &["content", "search", "replace"];

/// JSONL record of every executed command and how it ended.
pub struct AuditLogger {
    log_file_path: PathBuf,
    max_size_bytes: u64,
}

impl AuditLogger {
    pub fn new(config: &Config) -> Self {
        let log_file_path = config.audit_log_file();
        if let Some(parent_dir) = log_file_path.parent() {
            if !parent_dir.exists() {
                if let Err(e) = std::fs::create_dir_all(parent_dir) {
                    error!(path = %parent_dir.display(), error = %e, "Failed to create audit log directory");
                }
            }
        }
        Self {
            log_file_path,
            max_size_bytes: config.audit_log_max_size_bytes,
        }
    }

    pub fn log_file_path(&self) -> &PathBuf {
        &self.log_file_path
    }

    async fn rotate_log_if_needed(&self) -> Result<()> {
        let metadata = match fs::metadata(&self.log_file_path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if metadata.len() >= self.max_size_bytes {
            let timestamp = Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string();
            let file_stem = self
                .log_file_path
                .file_stem()
                .unwrap_or_default()
                .to_string_lossy();
            let extension = self
                .log_file_path
                .extension()
                .unwrap_or_default()
                .to_string_lossy();
            let backup_path = self
                .log_file_path
                .with_file_name(format!("{}_{}.{}", file_stem, timestamp, extension));
            fs::rename(&self.log_file_path, backup_path).await?;
        }
        Ok(())
    }

    /// Never fails the caller; write problems are only traced.
    pub async fn log_command(&self, kind: &str, arguments: &Value, observation: &str) {
        if let Err(e) = self.try_log_command(kind, arguments, observation).await {
            error!(kind = %kind, error = %e, "Failed to write audit log");
        }
    }

    async fn try_log_command(&self, kind: &str, arguments: &Value, observation: &str) -> Result<()> {
        self.rotate_log_if_needed().await?;

        let outcome = if observation.starts_with("FAILURE") {
            "failure"
        } else {
            "success"
        };
        let entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "kind": kind,
            "arguments": sanitize_arguments(arguments),
            "outcome": outcome,
        });
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

/// Replaces oversized text fields so file bodies do not end up in the log.
fn sanitize_arguments(arguments: &Value) -> Value {
    let mut sanitized = arguments.clone();
    if let Some(obj) = sanitized.as_object_mut() {
        for field in SANITIZED_FIELDS {
            if let Some(val) = obj.get_mut(*field) {
                let len = val.as_str().map(|s| s.chars().count()).unwrap_or(0);
                if len > MAX_LOGGED_FIELD_CHARS {
                    *val = Value::String(format!("<{} truncated for log, {} chars>", field, len));
                }
            }
        }
    }
    sanitized
}
