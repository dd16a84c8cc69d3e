use crate::config::Config;
use crate::error::AppError;
use crate::tools::process_tool::{ProcessTracker, RecordStatus, TRACKING_ENV_VAR};
use crate::utils::output_clip::{clip_tail, DEFAULT_MAX_RETURN_CHARS};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio as StdProcessStdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command as TokioCommand};
use tokio::sync::{watch, Mutex as TokioMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Lines kept per terminal; older lines are evicted first.
pub const OUTPUT_BUFFER_CAP: usize = 1000;

const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct TerminalTimeouts {
    /// How long a command not declared long-running may block.
    pub short_timeout: Duration,
    /// Observation window for commands declared long-running.
    pub long_window: Duration,
    pub poll_interval: Duration,
}

impl Default for TerminalTimeouts {
    fn default() -> Self {
        Self {
            short_timeout: Duration::from_secs(120),
            long_window: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn prefix(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// Bounded line buffer shared between the reader tasks and status queries.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    lines: StdMutex<VecDeque<(StreamKind, String)>>,
}

impl OutputBuffer {
    pub fn push(&self, stream: StreamKind, line: String) {
        if let Ok(mut lines) = self.lines.lock() {
            if lines.len() == OUTPUT_BUFFER_CAP {
                lines.pop_front();
            }
            lines.push_back((stream, line));
        }
    }

    pub fn len(&self) -> usize {
        self.lines.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<(StreamKind, String)> {
        self.lines.lock().map(|l| l.iter().cloned().collect()).unwrap_or_default()
    }

    /// Interleaved view, one `stdout: ` / `stderr: ` prefixed line each.
    pub fn render_prefixed(&self) -> String {
        self.snapshot()
            .iter()
            .map(|(stream, line)| format!("{}: {}\n", stream.prefix(), line))
            .collect()
    }

    /// `Stdout:` block followed by a `Stderr:` block.
    pub fn render_split(&self) -> String {
        let snapshot = self.snapshot();
        let collect = |kind: StreamKind| -> String {
            snapshot
                .iter()
                .filter(|(s, _)| *s == kind)
                .map(|(_, line)| format!("{}\n", line))
                .collect()
        };
        format!(
            "Stdout:\n{}\nStderr:\n{}",
            collect(StreamKind::Stdout),
            collect(StreamKind::Stderr)
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub success: bool,
    pub id: String,
    pub output: String,
    pub error: String,
    /// The process is still registered and running in the background.
    pub running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TerminalStatus {
    pub id: String,
    pub command: String,
    pub pid: Option<u32>,
    pub is_running: bool,
    pub exit_code: Option<i32>,
    pub uptime_secs: u64,
    pub is_long_running: bool,
    pub started_at: String,
}

#[derive(Debug)]
pub struct TerminalProcess {
    id: String,
    command: String,
    cwd: PathBuf,
    pid: Option<u32>,
    tracking_token: String,
    is_long_running: AtomicBool,
    started: Instant,
    started_at: DateTime<Utc>,
    output: Arc<OutputBuffer>,
    exit_code: StdMutex<Option<i32>>,
    finished_rx: watch::Receiver<bool>,
    stdin: TokioMutex<Option<ChildStdin>>,
    kill_request: Notify,
    monitor: StdMutex<Option<JoinHandle<()>>>,
}

impl TerminalProcess {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn output(&self) -> &OutputBuffer {
        &self.output
    }

    pub fn is_finished(&self) -> bool {
        *self.finished_rx.borrow()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.lock().ok().and_then(|c| *c)
    }

    async fn wait_finished(&self) {
        let mut rx = self.finished_rx.clone();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Awaits the monitor task once it has reported the exit.
    async fn join_monitor(&self) {
        let handle = self.monitor.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(id = %self.id, error = %e, "Terminal monitor task failed");
            }
        }
    }

    fn status(&self) -> TerminalStatus {
        TerminalStatus {
            id: self.id.clone(),
            command: self.command.clone(),
            pid: self.pid,
            is_running: !self.is_finished(),
            exit_code: self.exit_code(),
            uptime_secs: self.started.elapsed().as_secs(),
            is_long_running: self.is_long_running.load(Ordering::Relaxed),
            started_at: self.started_at.to_rfc3339(),
        }
    }
}

/// Spawns and supervises shell subprocesses for `run_command`.
#[derive(Debug)]
pub struct TerminalManager {
    files_root: PathBuf,
    default_shell: Option<String>,
    blocked_commands: Vec<String>,
    timeouts: TerminalTimeouts,
    tracker: Arc<ProcessTracker>,
    terminals: TokioMutex<HashMap<String, Arc<TerminalProcess>>>,
}

fn shell_command(default_shell: Option<&str>, command: &str) -> TokioCommand {
    match default_shell {
        Some(shell) => {
            let lower = shell.to_lowercase();
            let flag = if lower.contains("powershell") || lower.contains("pwsh") {
                "-Command"
            } else if lower.ends_with("cmd") || lower.ends_with("cmd.exe") {
                "/C"
            } else {
                "-c"
            };
            let mut cmd = TokioCommand::new(shell);
            cmd.arg(flag).arg(command);
            cmd
        }
        None if cfg!(windows) => {
            let mut cmd = TokioCommand::new("cmd");
            cmd.arg("/C").arg(command);
            cmd
        }
        None => {
            let mut cmd = TokioCommand::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        }
    }
}

fn spawn_reader<R>(stream: R, kind: StreamKind, buffer: Arc<OutputBuffer>) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&raw);
                    buffer.push(kind, line.trim_end_matches(&['\n', '\r'][..]).to_string());
                }
                Err(e) => {
                    debug!(stream = kind.prefix(), error = %e, "Output reader stopped");
                    break;
                }
            }
        }
    })
}

async fn terminate_child(child: &mut Child, pid: Option<u32>, tracker: &ProcessTracker) -> std::io::Result<ExitStatus> {
    if let Some(pid) = pid {
        if cfg!(windows) {
            let result = TokioCommand::new("taskkill")
                .args(["/F", "/T", "/PID", &pid.to_string()])
                .stdout(StdProcessStdio::null())
                .stderr(StdProcessStdio::null())
                .status()
                .await;
            if let Err(e) = result {
                warn!(pid, error = %e, "taskkill failed, falling back to direct kill");
                let _ = child.start_kill();
            }
        } else if !tracker.terminate_tree(pid) {
            let _ = child.start_kill();
        }
    } else {
        let _ = child.start_kill();
    }
    match timeout(KILL_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(pid = ?pid, "Process ignored termination, killing");
            let _ = child.start_kill();
            child.wait().await
        }
    }
}

impl TerminalManager {
    pub fn new(config: &Config, tracker: Arc<ProcessTracker>) -> Self {
        Self {
            files_root: config.files_root.clone(),
            default_shell: config.default_shell.clone(),
            blocked_commands: config.blocked_commands.clone(),
            timeouts: TerminalTimeouts::default(),
            tracker,
            terminals: TokioMutex::new(HashMap::new()),
        }
    }

    pub fn with_timeouts(mut self, timeouts: TerminalTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn tracker(&self) -> &Arc<ProcessTracker> {
        &self.tracker
    }

    /// Case-insensitive substring match against the blocked list.
    pub fn blocked_pattern(&self, command: &str) -> Option<&str> {
        let lower = command.to_lowercase();
        self.blocked_commands
            .iter()
            .find(|pattern| !pattern.is_empty() && lower.contains(&pattern.to_lowercase()))
            .map(String::as_str)
    }

    /// Runs `command` through the shell and classifies it as short or long-running.
    #[instrument(skip(self), fields(command = %command))]
    pub async fn run(&self, command: &str, is_long_running: bool, cwd: Option<&Path>) -> Result<RunOutcome, AppError> {
        if let Some(pattern) = self.blocked_pattern(command) {
            warn!(pattern = %pattern, "Command execution blocked");
            return Err(AppError::CommandBlocked(command.to_string()));
        }

        let id: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let tracking_token = Uuid::new_v4().to_string();
        let run_cwd = cwd.map(Path::to_path_buf).unwrap_or_else(|| self.files_root.clone());

        let mut cmd = shell_command(self.default_shell.as_deref(), command);
        cmd.current_dir(&run_cwd)
            .env(TRACKING_ENV_VAR, &tracking_token)
            .stdin(StdProcessStdio::piped())
            .stdout(StdProcessStdio::piped())
            .stderr(StdProcessStdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            error!(error = %e, "Failed to spawn command");
            AppError::ProcessSpawnError(format!("Failed to spawn command '{}': {}", command, e))
        })?;
        let pid = child.id();

        let output = Arc::new(OutputBuffer::default());
        let stdout_task = child
            .stdout
            .take()
            .map(|s| spawn_reader(s, StreamKind::Stdout, output.clone()));
        let stderr_task = child
            .stderr
            .take()
            .map(|s| spawn_reader(s, StreamKind::Stderr, output.clone()));
        let (finished_tx, finished_rx) = watch::channel(false);

        let terminal = Arc::new(TerminalProcess {
            id: id.clone(),
            command: command.to_string(),
            cwd: run_cwd.clone(),
            pid,
            tracking_token: tracking_token.clone(),
            is_long_running: AtomicBool::new(is_long_running),
            started: Instant::now(),
            started_at: Utc::now(),
            output,
            exit_code: StdMutex::new(None),
            finished_rx,
            stdin: TokioMutex::new(child.stdin.take()),
            kill_request: Notify::new(),
            monitor: StdMutex::new(None),
        });
        self.terminals.lock().await.insert(id.clone(), terminal.clone());

        if let Some(pid) = pid {
            if let Err(e) = self.tracker.add_process(command, pid, &tracking_token, &run_cwd).await {
                warn!(error = %e, "Failed to record process");
            }
        }
        info!(id = %id, pid = ?pid, is_long_running, "Command started");

        let monitored = terminal.clone();
        let tracker = self.tracker.clone();
        let monitor = tokio::spawn(async move {
            let mut killed = false;
            let status = tokio::select! {
                status = child.wait() => status,
                _ = monitored.kill_request.notified() => {
                    killed = true;
                    terminate_child(&mut child, monitored.pid, &tracker).await
                }
            };
            for task in [stdout_task, stderr_task].into_iter().flatten() {
                if timeout(READER_DRAIN_TIMEOUT, task).await.is_err() {
                    debug!(id = %monitored.id, "Output reader still held open by a descendant");
                }
            }
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(id = %monitored.id, error = %e, "Failed to wait for command");
                    Some(-1)
                }
            };
            if let Ok(mut slot) = monitored.exit_code.lock() {
                *slot = code;
            }
            let record_status = if killed {
                RecordStatus::Killed
            } else if code == Some(0) {
                RecordStatus::Completed
            } else {
                RecordStatus::Failed
            };
            if let Err(e) = tracker
                .update_status(&monitored.tracking_token, record_status, code.or(killed.then_some(-1)))
                .await
            {
                warn!(id = %monitored.id, error = %e, "Failed to update process record");
            }
            info!(id = %monitored.id, exit_code = ?code, killed, "Command finished");
            let _ = finished_tx.send(true);
        });
        if let Ok(mut slot) = terminal.monitor.lock() {
            *slot = Some(monitor);
        }

        let finished_in_window = if is_long_running {
            let deadline = Instant::now() + self.timeouts.long_window;
            loop {
                if terminal.is_finished() {
                    break true;
                }
                if Instant::now() >= deadline {
                    break false;
                }
                sleep(self.timeouts.poll_interval).await;
            }
        } else {
            timeout(self.timeouts.short_timeout, terminal.wait_finished()).await.is_ok()
        };

        if finished_in_window {
            terminal.wait_finished().await;
            terminal.join_monitor().await;
            self.terminals.lock().await.remove(&id);
            let exit_code = terminal.exit_code();
            let output = clip_tail(&terminal.output.render_split(), DEFAULT_MAX_RETURN_CHARS, Some(&id));
            let success = exit_code == Some(0);
            let error = if success {
                String::new()
            } else {
                match exit_code {
                    Some(code) => format!("Exit Code: {}", code),
                    None => "Terminated by signal".to_string(),
                }
            };
            return Ok(RunOutcome { success, id, output, error, running: false });
        }

        terminal.is_long_running.store(true, Ordering::Relaxed);
        let partial = clip_tail(&terminal.output.render_prefixed(), DEFAULT_MAX_RETURN_CHARS, Some(&id));
        let output = if is_long_running {
            format!("Initial Output ({}s):\n{}", self.timeouts.long_window.as_secs(), partial)
        } else {
            format!(
                "Still running after {}s; moved to background (it may be waiting for input).\nInitial Output:\n{}",
                self.timeouts.short_timeout.as_secs(),
                partial
            )
        };
        Ok(RunOutcome {
            success: true,
            id,
            output,
            error: String::new(),
            running: true,
        })
    }

    async fn get(&self, id: &str) -> Result<Arc<TerminalProcess>, AppError> {
        self.terminals
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::TerminalNotFound(id.to_string()))
    }

    /// Status of one terminal; a finished terminal is deregistered once reported.
    pub async fn status(&self, id: &str) -> Result<TerminalStatus, AppError> {
        let terminal = self.get(id).await?;
        let status = terminal.status();
        if !status.is_running {
            self.terminals.lock().await.remove(id);
        }
        Ok(status)
    }

    /// Terminals whose process is still alive, oldest first.
    pub async fn list(&self) -> Vec<TerminalStatus> {
        let terminals = self.terminals.lock().await;
        let mut running: Vec<&Arc<TerminalProcess>> = terminals.values().filter(|t| !t.is_finished()).collect();
        running.sort_by_key(|t| t.started);
        running.iter().map(|t| t.status()).collect()
    }

    pub async fn read_output(&self, id: &str) -> Result<String, AppError> {
        Ok(self.get(id).await?.output.render_prefixed())
    }

    #[instrument(skip(self, data))]
    pub async fn send_input(&self, id: &str, data: &str) -> Result<(), AppError> {
        let terminal = self.get(id).await?;
        if terminal.is_finished() {
            return Err(AppError::ProcessError(format!("Terminal {} has already exited", id)));
        }
        let mut stdin = terminal.stdin.lock().await;
        let pipe = stdin
            .as_mut()
            .ok_or_else(|| AppError::ProcessError(format!("Terminal {} has no stdin", id)))?;
        pipe.write_all(data.as_bytes()).await?;
        pipe.flush().await?;
        Ok(())
    }

    /// Kills the process tree behind `id` and deregisters it.
    #[instrument(skip(self))]
    pub async fn stop(&self, id: &str) -> Result<String, AppError> {
        let terminal = self
            .terminals
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| AppError::TerminalNotFound(id.to_string()))?;
        if terminal.is_finished() {
            terminal.join_monitor().await;
            return Ok(format!("Terminal {} was already terminated", id));
        }
        terminal.kill_request.notify_one();
        match timeout(KILL_GRACE + READER_DRAIN_TIMEOUT + Duration::from_secs(1), terminal.wait_finished()).await {
            Ok(()) => {
                terminal.join_monitor().await;
                info!(id = %id, "Terminal stopped");
                Ok(format!("Terminal {} terminated successfully", id))
            }
            Err(_) => Err(AppError::TimeoutError(format!("Terminal {} did not exit after kill", id))),
        }
    }

    /// Returns (stopped, failed) counts.
    pub async fn stop_all(&self) -> (usize, usize) {
        let ids: Vec<String> = self.terminals.lock().await.keys().cloned().collect();
        let mut stopped = 0;
        let mut failed = 0;
        for id in ids {
            match self.stop(&id).await {
                Ok(_) => stopped += 1,
                Err(e) => {
                    warn!(id = %id, error = %e, "Failed to stop terminal");
                    failed += 1;
                }
            }
        }
        (stopped, failed)
    }
}
