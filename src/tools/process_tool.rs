use crate::error::AppError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, Signal, System, UpdateKind};
use tokio::fs;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, instrument, warn};

/// Environment variable carrying each child's tracking token.
pub const TRACKING_ENV_VAR: &str = "TERMINAL_AGENT_PROC_UUID";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Running,
    Completed,
    Failed,
    Killed,
    TerminatedUnknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub uuid: String,
    pub command: String,
    pub pid: u32,
    pub start_time: String,
    pub status: RecordStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
}

/// Persistent registry of spawned children that survives the agent process.
#[derive(Debug)]
pub struct ProcessTracker {
    records_file: PathBuf,
    file_lock: TokioMutex<()>,
    system: StdMutex<System>,
}

impl ProcessTracker {
    pub fn new(records_file: impl Into<PathBuf>) -> Self {
        Self {
            records_file: records_file.into(),
            file_lock: TokioMutex::new(()),
            system: StdMutex::new(System::new()),
        }
    }

    pub fn records_file(&self) -> &Path {
        &self.records_file
    }

    async fn load_records(&self) -> Vec<ProcessRecord> {
        let text = match fs::read_to_string(&self.records_file).await {
            Ok(t) => t,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_str(&text) {
            Ok(records) => records,
            Err(e) => {
                warn!(path = %self.records_file.display(), error = %e, "Unreadable process records, starting fresh");
                Vec::new()
            }
        }
    }

    async fn save_records(&self, records: &[ProcessRecord]) -> Result<(), AppError> {
        if let Some(parent) = self.records_file.parent() {
            fs::create_dir_all(parent).await?;
        }
        let text = serde_json::to_string_pretty(records)?;
        fs::write(&self.records_file, text).await?;
        Ok(())
    }

    pub async fn records(&self) -> Vec<ProcessRecord> {
        let _guard = self.file_lock.lock().await;
        self.load_records().await
    }

    #[instrument(skip(self, command, cwd))]
    pub async fn add_process(&self, command: &str, pid: u32, proc_uuid: &str, cwd: &Path) -> Result<(), AppError> {
        let _guard = self.file_lock.lock().await;
        let mut records = self.load_records().await;
        records.push(ProcessRecord {
            uuid: proc_uuid.to_string(),
            command: command.to_string(),
            pid,
            start_time: Utc::now().to_rfc3339(),
            status: RecordStatus::Running,
            exit_code: None,
            cwd: cwd.to_string_lossy().to_string(),
            platform: std::env::consts::OS.to_string(),
            memory_mb: None,
        });
        self.save_records(&records).await
    }

    #[instrument(skip(self))]
    pub async fn update_status(&self, proc_uuid: &str, status: RecordStatus, exit_code: Option<i32>) -> Result<(), AppError> {
        let _guard = self.file_lock.lock().await;
        let mut records = self.load_records().await;
        let Some(record) = records.iter_mut().find(|r| r.uuid == proc_uuid) else {
            return Ok(());
        };
        record.status = status;
        if exit_code.is_some() {
            record.exit_code = exit_code;
        }
        self.save_records(&records).await
    }

    /// Records still marked running whose process is verifiably alive.
    ///
    /// Records that fail verification are rewritten as `terminated_unknown`.
    #[instrument(skip(self))]
    pub async fn running_processes(&self) -> Result<Vec<ProcessRecord>, AppError> {
        let _guard = self.file_lock.lock().await;
        let mut records = self.load_records().await;
        let mut active = Vec::new();
        let mut needs_save = false;

        for record in records.iter_mut().filter(|r| r.status == RecordStatus::Running) {
            match self.probe(record) {
                Some(memory_mb) => {
                    let mut live = record.clone();
                    live.memory_mb = Some(memory_mb);
                    active.push(live);
                }
                None => {
                    debug!(pid = record.pid, uuid = %record.uuid, "Tracked process is gone");
                    record.status = RecordStatus::TerminatedUnknown;
                    needs_save = true;
                }
            }
        }
        if needs_save {
            self.save_records(&records).await?;
        }
        Ok(active)
    }

    /// Resident memory in MB when the record's process is alive.
    fn probe(&self, record: &ProcessRecord) -> Option<u64> {
        let mut system = self.system.lock().ok()?;
        let pid = Pid::from_u32(record.pid);
        // The plain refresh leaves environ and cmd empty.
        let refresh = ProcessRefreshKind::new()
            .with_memory()
            .with_environ(UpdateKind::Always)
            .with_cmd(UpdateKind::Always);
        if !system.refresh_process_specifics(pid, refresh) {
            return None;
        }
        let process = system.process(pid)?;
        if process.status() == ProcessStatus::Zombie {
            return None;
        }
        let environ = process.environ();
        let alive = if !environ.is_empty() {
            let needle = format!("{}={}", TRACKING_ENV_VAR, record.uuid);
            environ.iter().any(|entry| *entry == needle)
        } else {
            // Environment unreadable: fall back to the command line.
            !record.command.is_empty() && process.cmd().join(" ").contains(&record.command)
        };
        alive.then(|| process.memory() / (1024 * 1024))
    }

    /// Sends SIGTERM to `pid` and all of its descendants, deepest first.
    ///
    /// Returns false when the root process could not be signalled.
    #[instrument(skip(self))]
    pub fn terminate_tree(&self, pid: u32) -> bool {
        let Ok(mut system) = self.system.lock() else {
            return false;
        };
        system.refresh_processes();
        let root = Pid::from_u32(pid);

        let mut tree = vec![root];
        let mut idx = 0;
        while idx < tree.len() {
            let parent = tree[idx];
            tree.extend(
                system
                    .processes()
                    .iter()
                    .filter(|(_, p)| p.parent() == Some(parent))
                    .map(|(child, _)| *child),
            );
            idx += 1;
        }

        let mut root_signalled = false;
        for target in tree.iter().rev() {
            if let Some(process) = system.process(*target) {
                let delivered = process.kill_with(Signal::Term).unwrap_or_else(|| process.kill());
                if *target == root {
                    root_signalled = delivered;
                }
            }
        }
        debug!(pid, tree_size = tree.len(), root_signalled, "Sent termination to process tree");
        root_signalled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn status_updates_are_persisted() {
        let dir = TempDir::new().unwrap();
        let tracker = ProcessTracker::new(dir.path().join("process_tracker.json"));
        tracker.add_process("echo hi", 1234, "uuid-1", dir.path()).await.unwrap();
        tracker
            .update_status("uuid-1", RecordStatus::Completed, Some(0))
            .await
            .unwrap();

        let records = tracker.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RecordStatus::Completed);
        assert_eq!(records[0].exit_code, Some(0));
    }

    #[tokio::test]
    async fn dead_records_are_marked_terminated_unknown() {
        let dir = TempDir::new().unwrap();
        let tracker = ProcessTracker::new(dir.path().join("process_tracker.json"));
        tracker
            .add_process("definitely-not-running", 3_999_999, "ghost", dir.path())
            .await
            .unwrap();

        assert!(tracker.running_processes().await.unwrap().is_empty());
        assert_eq!(tracker.records().await[0].status, RecordStatus::TerminatedUnknown);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn live_child_is_verified_by_tracking_token() {
        let dir = TempDir::new().unwrap();
        let tracker = ProcessTracker::new(dir.path().join("process_tracker.json"));
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .env(TRACKING_ENV_VAR, "token-123")
            .spawn()
            .unwrap();
        tracker.add_process("sleep 30", child.id(), "token-123", dir.path()).await.unwrap();
        tracker.add_process("sleep 30", child.id(), "other-token", dir.path()).await.unwrap();

        let running = tracker.running_processes().await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].uuid, "token-123");

        assert!(tracker.terminate_tree(child.id()));
        child.wait().unwrap();
    }
}
