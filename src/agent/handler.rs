use crate::command::{Command, ExternalKind};
use crate::config::Config;
use crate::error::AppError;
use crate::tools::edit_tool::{EditEngine, LineEdit};
use crate::tools::filesystem_tool::{FileMutation, FilesystemManager, ReadOutcome};
use crate::tools::process_tool::ProcessTracker;
use crate::tools::ripgrep_tool::RipgrepSearcher;
use crate::tools::task_tool::TaskManager;
use crate::tools::terminal_tool::TerminalManager;
use crate::utils::audit_logger::AuditLogger;
use crate::utils::rollback_log::RollbackLog;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Executes a command kind this crate does not implement itself (web search, OCR, ...).
#[async_trait]
pub trait ExternalHandler: Send + Sync {
    async fn handle(&self, kind: ExternalKind, args: &BTreeMap<String, String>) -> Result<String, AppError>;
}

/// Observations produced by one command, plus the file mutations it made.
#[derive(Debug, Default)]
pub struct Execution {
    pub observations: Vec<String>,
    pub mutations: Vec<FileMutation>,
}

impl Execution {
    fn push(&mut self, observation: String) {
        self.observations.push(observation);
    }
}

/// Every tool the agent can drive, routed by command kind.
pub struct CommandDispatcher {
    filesystem: Arc<FilesystemManager>,
    edits: EditEngine,
    terminals: Arc<TerminalManager>,
    searcher: RipgrepSearcher,
    tasks: TaskManager,
    audit: AuditLogger,
    external: HashMap<ExternalKind, Arc<dyn ExternalHandler>>,
}

impl CommandDispatcher {
    pub fn new(config: &Config, rollback: Arc<RollbackLog>, tracker: Arc<ProcessTracker>) -> Self {
        let filesystem = Arc::new(FilesystemManager::new(config, rollback));
        Self {
            edits: EditEngine::new(filesystem.clone()),
            terminals: Arc::new(TerminalManager::new(config, tracker)),
            searcher: RipgrepSearcher::new(&config.files_root),
            tasks: TaskManager::new(),
            audit: AuditLogger::new(config),
            external: HashMap::new(),
            filesystem,
        }
    }

    pub fn with_terminals(mut self, terminals: TerminalManager) -> Self {
        self.terminals = Arc::new(terminals);
        self
    }

    pub fn with_searcher(mut self, searcher: RipgrepSearcher) -> Self {
        self.searcher = searcher;
        self
    }

    pub fn register_external(&mut self, kind: ExternalKind, handler: Arc<dyn ExternalHandler>) {
        info!(kind = kind.tag(), "External handler registered");
        self.external.insert(kind, handler);
    }

    pub fn filesystem(&self) -> &Arc<FilesystemManager> {
        &self.filesystem
    }

    pub fn terminals(&self) -> &Arc<TerminalManager> {
        &self.terminals
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    /// Runs one command; handler errors come back as `FAILURE:` observations, never as `Err`.
    #[instrument(skip(self), fields(kind = command.kind()))]
    pub async fn execute(&mut self, command: &Command) -> Execution {
        let mut execution = Execution::default();
        if let Command::RunCommand { command: text, is_long_running, cwd } = command {
            self.run_commands(text, *is_long_running, cwd.as_deref(), &mut execution).await;
        } else {
            let observation = match self.dispatch(command, &mut execution).await {
                Ok(observation) => observation,
                Err(e) => {
                    warn!(error = %e, "Command failed");
                    failure(&e)
                }
            };
            execution.push(observation);
        }

        let arguments = serde_json::to_value(command).unwrap_or(Value::Null);
        for observation in &execution.observations {
            self.audit.log_command(command.kind(), &arguments, observation).await;
        }
        execution
    }

    async fn dispatch(&mut self, command: &Command, execution: &mut Execution) -> Result<String, AppError> {
        match command {
            Command::SearchFiles { pattern } => {
                let result = self.filesystem.search_files(pattern).await?;
                if !result.matches.is_empty() {
                    return Ok(format!(
                        "SUCCESS: Found {} files:\n{}",
                        result.matches.len(),
                        self.filesystem.render_file_tree(&result.matches)
                    ));
                }
                let mut observation = format!("SUCCESS: No files found matching {}", result.pattern);
                if !result.suggestions.is_empty() {
                    observation.push_str("\nSuggestions:");
                    for suggestion in &result.suggestions {
                        observation.push_str(&format!("\n- {}", suggestion));
                    }
                }
                Ok(observation)
            }
            Command::SearchInFiles { regex, glob, root, max_matches } => {
                let result = self.searcher.search_in_files(regex, glob, root, *max_matches).await?;
                if result.total == 0 {
                    return Ok(format!(
                        "SUCCESS: No regex matches found\nRegex: {}\nGlob: {}\nRoot: {}",
                        result.regex,
                        result.glob,
                        result.root.display()
                    ));
                }
                Ok(format!(
                    "SUCCESS: Regex matches found\nRegex: {}\nGlob: {}\nMatches: {} (files: {})\n{}",
                    result.regex,
                    result.glob,
                    result.total,
                    result.matches.len(),
                    result.render_tree()
                ))
            }
            Command::ReadFile { path, start_line, end_line } => {
                match self.filesystem.read_file(path, *start_line, *end_line).await? {
                    ReadOutcome::Duplicate { path, start_line, end_line } => Ok(format!(
                        "SUCCESS: Read skipped (duplicate)\nFile: {}\nRange: {}-{}\nContent: <omitted>",
                        path.display(),
                        start_line,
                        end_line
                    )),
                    ReadOutcome::Fresh(range) => {
                        let clamped = range
                            .clamped_from
                            .map(|n| format!(" | clamped_from={}", n))
                            .unwrap_or_default();
                        Ok(format!(
                            "SUCCESS: Read {}\nLines: {} | Range: {}-{}{}\nContent:\n{}",
                            range.path.display(),
                            range.total_lines,
                            range.start_line,
                            range.end_line,
                            clamped,
                            range.content
                        ))
                    }
                }
            }
            Command::WriteFile { path, content, overwrite } => {
                let mutation = self.filesystem.write_file(path, content, *overwrite).await?;
                let observation = format!(
                    "SUCCESS: Saved to {} | +{} | -{}",
                    mutation.path.display(),
                    mutation.added,
                    mutation.deleted
                );
                execution.mutations.push(mutation);
                Ok(observation)
            }
            Command::EditLines { path, delete_start, delete_end, insert_at, auto_indent, content } => {
                let edit = LineEdit {
                    delete_start: *delete_start,
                    delete_end: *delete_end,
                    insert_at: *insert_at,
                    auto_indent: *auto_indent,
                    content: content.clone(),
                };
                let mutation = self.edits.edit_lines(path, &edit).await?;
                let observation = format!(
                    "SUCCESS: Edited {} | +{} | -{}",
                    mutation.path.display(),
                    mutation.added,
                    mutation.deleted
                );
                execution.mutations.push(mutation);
                Ok(observation)
            }
            Command::ReplaceInFile { path, search, replace, count, regex, auto_indent } => {
                let mutation = self
                    .edits
                    .replace_in_file(path, search, replace, *count, *regex, *auto_indent)
                    .await?;
                let observation = format!(
                    "SUCCESS: Replaced in {} | times={} | +{} | -{}",
                    mutation.path.display(),
                    mutation.replacements.unwrap_or(0),
                    mutation.added,
                    mutation.deleted
                );
                execution.mutations.push(mutation);
                Ok(observation)
            }
            Command::RunCommand { .. } => Err(AppError::InvalidInputArgument(
                "run_command is executed line by line".to_string(),
            )),
            Command::TaskAdd { id, content, status, progress } => {
                let task = self.tasks.add(id.as_deref(), content, status.as_deref(), *progress)?;
                Ok(format!("SUCCESS: Task added ({})", task.id))
            }
            Command::TaskUpdate { id, content, status, progress } => {
                let task = self
                    .tasks
                    .update(id, content.as_deref(), status.as_deref(), *progress)?;
                Ok(format!("SUCCESS: Task updated ({})", task.id))
            }
            Command::TaskDelete { id } => {
                let task = self.tasks.delete(id)?;
                Ok(format!("SUCCESS: Task deleted ({})", task.id))
            }
            Command::TaskList => Ok(format!("SUCCESS: Task list\n{}", self.tasks.render())),
            Command::TaskClear => {
                let removed = self.tasks.clear();
                debug!(removed, "Tasks cleared");
                Ok("SUCCESS: Tasks cleared".to_string())
            }
            Command::External { kind, args } => {
                let handler = self.external.get(kind).cloned().ok_or_else(|| {
                    AppError::InvalidInputArgument(format!("No handler installed for {}", kind.tag()))
                })?;
                handler.handle(*kind, args).await
            }
        }
    }

    /// Each non-empty line runs as its own process and yields its own observation.
    async fn run_commands(&self, text: &str, is_long_running: bool, cwd: Option<&str>, execution: &mut Execution) {
        let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        if lines.is_empty() {
            execution.push("FAILURE: Empty command".to_string());
            return;
        }
        let run_cwd = match cwd.map(str::trim).filter(|c| !c.is_empty()) {
            Some(raw) => match self.filesystem.resolve(raw) {
                Ok(dir) if dir.is_dir() => Some(dir),
                Ok(dir) => {
                    execution.push(format!("FAILURE: Working directory not found: {}", dir.display()));
                    return;
                }
                Err(e) => {
                    execution.push(failure(&e));
                    return;
                }
            },
            None => None,
        };

        for line in lines {
            if self.terminals.blocked_pattern(line).is_some() {
                warn!(command = %line, "Dangerous command blocked");
                execution.push(format!("FAILURE: Dangerous command blocked: {}", line));
                continue;
            }
            let outcome = match self.terminals.run(line, is_long_running, run_cwd.as_deref()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    execution.push(failure(&e));
                    continue;
                }
            };
            let observation = if !outcome.success {
                format!(
                    "FAILURE: Command failed\nTerminal ID: {}\nCommand: {}\n{}\n{}",
                    outcome.id, line, outcome.error, outcome.output
                )
            } else if outcome.running {
                format!(
                    "SUCCESS: Command started (running)\nTerminal ID: {}\nCommand: {}\n{}\n{}",
                    outcome.id,
                    line,
                    outcome.output,
                    self.render_running_terminals().await
                )
            } else {
                format!(
                    "SUCCESS: Command executed\nTerminal ID: {}\nCommand: {}\n{}",
                    outcome.id, line, outcome.output
                )
            };
            execution.push(observation);
        }
    }

    pub async fn render_running_terminals(&self) -> String {
        let running = self.terminals.list().await;
        if running.is_empty() {
            return String::new();
        }
        let mut lines = vec!["Running Terminals:".to_string()];
        for t in running {
            lines.push(format!("- id={} uptime={}s cmd={}", t.id, t.uptime_secs, t.command));
        }
        lines.join("\n")
    }
}

fn failure(error: &AppError) -> String {
    match error {
        AppError::InvalidInputArgument(msg) | AppError::EditError(msg) | AppError::InvalidPath(msg) => {
            format!("FAILURE: {}", msg)
        }
        other => format!("FAILURE: {}", other),
    }
}
