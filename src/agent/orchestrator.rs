//! The per-turn loop: stream a reply, parse commands, gate them, run them,
//! feed observations back, repeat until the model answers in prose.

use crate::agent::approval::{ApprovalGate, ApprovalPrompt, BatchDecision, CommandDecision, PendingCommand};
use crate::agent::handler::{CommandDispatcher, ExternalHandler};
use crate::agent::history::{estimate_tokens, request_messages, CompactionPlan, Message, KEEP_LAST_MESSAGES};
use crate::agent::interrupt::InterruptHandle;
use crate::agent::llm_client::{ChatClient, StreamChunk};
use crate::agent::prompt::{system_prompt, user_context};
use crate::command::{contains_tag_fragments, parse_commands, ExternalKind};
use crate::config::Config;
use crate::error::AppError;
use crate::tools::process_tool::ProcessTracker;
use crate::tools::task_tool::TaskManager;
use crate::tools::terminal_tool::TerminalManager;
use crate::utils::output_clip::{clip_head_tail, DEFAULT_HEAD_CHARS};
use crate::utils::rollback_log::{RollbackLog, RollbackOutcome};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

pub const FORMAT_FEEDBACK: &str = "ERROR: Invalid Format! Use one or more closed tags. No tag if no task.";
pub const USER_CANCELLED: &str = "User cancelled execution";
pub const USER_INTERRUPTED: &str = "User interrupted execution";
const INTERRUPTED_MARKER: &str = "\n\n[Interrupted by user]";
const TOOL_RESULT_PRINT_CHARS: usize = 8000;

/// Called with the full message list after every model turn and observation batch.
pub type HistoryCallback = Box<dyn Fn(&[Message]) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStat {
    pub path: PathBuf,
    pub added: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    /// The model replied in prose; nothing left to run.
    Answered,
    /// Stopped after the first executed batch, as configured.
    StoppedAfterExecution,
    Cancelled,
    Interrupted,
    MaxCycles,
    TransportFailed,
    Crashed,
    /// Empty input with no history to continue from.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct TurnReport {
    pub outcome: TurnOutcome,
    pub cycles: usize,
    pub compacted: bool,
    /// Per-file totals of this turn's edits.
    pub modifications: Vec<FileStat>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRollback {
    pub requested: usize,
    pub rolled_back: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChatMarker {
    history_len: usize,
    op_count: usize,
}

enum CycleStep {
    Continue,
    Finished(TurnOutcome),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum StreamPhase {
    Start,
    Reasoning,
    Answer,
}

/// Aggregates edits per file, ordered case-insensitively by path.
pub fn modification_stats(ops: &[FileStat]) -> Vec<FileStat> {
    let mut totals: BTreeMap<(String, PathBuf), (usize, usize)> = BTreeMap::new();
    for op in ops {
        let key = (op.path.to_string_lossy().to_lowercase(), op.path.clone());
        let entry = totals.entry(key).or_default();
        entry.0 += op.added;
        entry.1 += op.deleted;
    }
    totals
        .into_iter()
        .map(|((_, path), (added, deleted))| FileStat { path, added, deleted })
        .collect()
}

/// Callback writing the whole conversation to one JSON file, overwritten on each update.
pub fn autosave_to(path: PathBuf) -> HistoryCallback {
    Box::new(move |messages: &[Message]| {
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %e, "Failed to create session directory");
                return;
            }
        }
        match serde_json::to_string_pretty(messages) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    warn!(path = %path.display(), error = %e, "Session autosave failed");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize session"),
        }
    })
}

/// One assistant session: conversation state, tools, approval state and undo bookkeeping.
pub struct Agent {
    config: Config,
    client: Arc<dyn ChatClient>,
    prompt: Arc<dyn ApprovalPrompt>,
    gate: ApprovalGate,
    dispatcher: CommandDispatcher,
    rollback: Arc<RollbackLog>,
    tracker: Arc<ProcessTracker>,
    interrupt: InterruptHandle,
    system_message: Message,
    history: Vec<Message>,
    operations: Vec<FileStat>,
    chat_markers: Vec<ChatMarker>,
    console: Box<dyn Write + Send>,
    on_history_updated: Option<HistoryCallback>,
}

impl Agent {
    pub fn new(config: Config, client: Arc<dyn ChatClient>, prompt: Arc<dyn ApprovalPrompt>) -> Self {
        let rollback = Arc::new(RollbackLog::new(config.edit_history_file()));
        let tracker = Arc::new(ProcessTracker::new(config.process_records_file()));
        let dispatcher = CommandDispatcher::new(&config, rollback.clone(), tracker.clone());
        Self {
            gate: ApprovalGate::new(&config),
            config,
            client,
            prompt,
            dispatcher,
            rollback,
            tracker,
            interrupt: InterruptHandle::new(),
            system_message: Message::system(system_prompt()),
            history: Vec::new(),
            operations: Vec::new(),
            chat_markers: Vec::new(),
            console: Box::new(std::io::stdout()),
            on_history_updated: None,
        }
    }

    pub fn with_console(mut self, console: Box<dyn Write + Send>) -> Self {
        self.console = console;
        self
    }

    pub fn with_history_callback(mut self, callback: HistoryCallback) -> Self {
        self.on_history_updated = Some(callback);
        self
    }

    pub fn with_terminals(mut self, terminals: TerminalManager) -> Self {
        self.dispatcher = self.dispatcher.with_terminals(terminals);
        self
    }

    pub fn with_dispatcher(mut self, configure: impl FnOnce(CommandDispatcher) -> CommandDispatcher) -> Self {
        self.dispatcher = configure(self.dispatcher);
        self
    }

    pub fn register_external(&mut self, kind: ExternalKind, handler: Arc<dyn ExternalHandler>) {
        self.dispatcher.register_external(kind, handler);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn operations(&self) -> &[FileStat] {
        &self.operations
    }

    pub fn tasks(&self) -> &TaskManager {
        self.dispatcher.tasks()
    }

    pub fn terminals(&self) -> &Arc<TerminalManager> {
        self.dispatcher.terminals()
    }

    pub fn process_tracker(&self) -> &Arc<ProcessTracker> {
        &self.tracker
    }

    pub fn rollback_log(&self) -> &Arc<RollbackLog> {
        &self.rollback
    }

    pub async fn render_running_terminals(&self) -> String {
        self.dispatcher.render_running_terminals().await
    }

    /// Forgets the conversation; file edits stay in the rollback log.
    pub fn clear_history(&mut self) {
        self.history.clear();
        self.chat_markers.clear();
        self.dispatcher.filesystem().clear_read_cache();
    }

    fn say(&mut self, text: &str) {
        let _ = writeln!(self.console, "{}", text);
        let _ = self.console.flush();
    }

    fn notify_history(&self, working: &[Message]) {
        if let Some(callback) = &self.on_history_updated {
            let mut full = Vec::with_capacity(working.len() + 1);
            full.push(self.system_message.clone());
            full.extend(working.iter().cloned());
            callback(&full);
        }
    }

    /// Handles one user turn, running up to `max_cycles` model round trips.
    #[instrument(skip(self, input), fields(input_chars = input.len()))]
    pub async fn chat(&mut self, input: &str) -> TurnReport {
        let marker = ChatMarker {
            history_len: self.history.len(),
            op_count: self.operations.len(),
        };
        if input.trim().is_empty() && self.history.is_empty() {
            return TurnReport {
                outcome: TurnOutcome::Skipped,
                cycles: 0,
                compacted: false,
                modifications: Vec::new(),
                error: None,
            };
        }
        self.interrupt.reset();

        let mut working = self.history.clone();
        if !input.trim().is_empty() {
            let context = user_context(input, &self.config.files_root, self.dispatcher.tasks());
            working.push(Message::user(context));
        }

        let mut marker_len = marker.history_len;
        let mut compacted = false;
        let mut cycles = 0;
        let mut outcome = None;
        let mut turn_error = None;

        while cycles < self.config.max_cycles {
            cycles += 1;
            self.say(&format!("[Cycle {}/{}] Processing...", cycles, self.config.max_cycles));
            if self.interrupt.is_interrupted() {
                working.push(Message::user(USER_INTERRUPTED));
                outcome = Some(TurnOutcome::Interrupted);
                break;
            }

            if !compacted {
                if let Some(compact) = self.compact(&working).await {
                    let added_this_turn = working.len().saturating_sub(marker_len);
                    marker_len = compact.len().saturating_sub(added_this_turn).max(1);
                    // Earlier turn boundaries point into the summarised span.
                    self.chat_markers.clear();
                    working = compact;
                    compacted = true;
                }
            }

            match self.run_cycle(&mut working).await {
                Ok(CycleStep::Continue) => {}
                Ok(CycleStep::Finished(done)) => {
                    outcome = Some(done);
                    break;
                }
                Err(e) if e.is_transport() => {
                    error!(error = %e, "Model request failed");
                    self.say(&format!("[Request Error] {}", e));
                    turn_error = Some(e.to_string());
                    outcome = Some(TurnOutcome::TransportFailed);
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Cycle failed");
                    self.say(&format!("[Cycle Error] {}", e));
                    working.push(Message::user(format!("ERROR: Agent crashed with error: {}", e)));
                    turn_error = Some(e.to_string());
                    outcome = Some(TurnOutcome::Crashed);
                    break;
                }
            }
        }

        let outcome = outcome.unwrap_or_else(|| {
            warn!(max_cycles = self.config.max_cycles, "Max cycles reached");
            TurnOutcome::MaxCycles
        });
        if outcome == TurnOutcome::MaxCycles {
            self.say("[Tip] Max cycles reached.");
        }

        self.history = working;
        let modifications = modification_stats(&self.operations[marker.op_count.min(self.operations.len())..]);
        self.print_modification_stats(&modifications);
        self.chat_markers.push(ChatMarker {
            history_len: marker_len,
            op_count: marker.op_count,
        });
        info!(?outcome, cycles, "Chat turn finished");

        TurnReport {
            outcome,
            cycles,
            compacted,
            modifications,
            error: turn_error,
        }
    }

    /// Summarises older history once it passes the token threshold.
    async fn compact(&mut self, working: &[Message]) -> Option<Vec<Message>> {
        let plan = CompactionPlan::for_history(
            &self.system_message,
            working,
            self.config.token_threshold,
            KEEP_LAST_MESSAGES,
        )?;
        debug!(summarized = plan.to_summarize.len(), kept = plan.keep.len(), "Compacting history");
        match self.client.summarize(&plan.summary_request()).await {
            Ok(summary) if !summary.trim().is_empty() => {
                info!(summarized = plan.to_summarize.len(), "History compacted into persistent summary");
                self.say("[History] Older messages folded into the persistent summary.");
                Some(plan.apply(&summary))
            }
            Ok(_) => {
                warn!("Summariser returned nothing; history left as is");
                None
            }
            Err(e) => {
                warn!(error = %e, "History compaction failed");
                None
            }
        }
    }

    async fn run_cycle(&mut self, working: &mut Vec<Message>) -> Result<CycleStep, AppError> {
        let messages = request_messages(&self.system_message, working);
        let estimate = estimate_tokens(&messages);
        debug!(estimate, messages = messages.len(), "Sending request");
        self.say(&format!("[Token Estimate] ~{} tokens", estimate));

        let client = self.client.clone();
        let interrupt = self.interrupt.clone();
        let console = &mut self.console;
        let mut phase = StreamPhase::Start;
        let mut on_chunk = |chunk: StreamChunk<'_>| {
            match chunk {
                StreamChunk::Reasoning(text) => {
                    if phase != StreamPhase::Reasoning {
                        let _ = write!(console, "\n[Thinking]\n");
                        phase = StreamPhase::Reasoning;
                    }
                    let _ = write!(console, "{}", text);
                }
                StreamChunk::Content(text) => {
                    if phase == StreamPhase::Reasoning {
                        let _ = write!(console, "\n[Answer]\n");
                    }
                    phase = StreamPhase::Answer;
                    let _ = write!(console, "{}", text);
                }
            }
            let _ = console.flush();
        };
        let reply = client.stream_chat(&messages, &interrupt, &mut on_chunk).await?;

        self.say(&format!("\n{}", "-".repeat(40)));
        if let Some(usage) = &reply.usage {
            let line = format!(
                "[Usage] prompt={} completion={} total={} cache_hit={}",
                usage.prompt_tokens,
                usage.completion_tokens,
                usage.total_tokens,
                usage.prompt_cache_hit_tokens.unwrap_or(0)
            );
            self.say(&line);
        }

        let mut content = reply.content;
        if reply.interrupted {
            content.push_str(INTERRUPTED_MARKER);
        }
        working.push(Message::assistant(content.clone()));
        self.notify_history(working);
        if reply.interrupted {
            working.push(Message::user(USER_INTERRUPTED));
            return Ok(CycleStep::Finished(TurnOutcome::Interrupted));
        }

        let commands = parse_commands(&content);
        if commands.is_empty() {
            if contains_tag_fragments(&content) {
                debug!("Reply mentions tags but none parsed; sending format feedback");
                working.push(Message::user(FORMAT_FEEDBACK));
                return Ok(CycleStep::Continue);
            }
            return Ok(CycleStep::Finished(TurnOutcome::Answered));
        }

        let decision = self.gate.review_batch(&commands, self.prompt.as_ref()).await;
        if decision == BatchDecision::Cancel {
            working.push(Message::user(USER_CANCELLED));
            return Ok(CycleStep::Finished(TurnOutcome::Cancelled));
        }
        let batch_approved = matches!(decision, BatchDecision::ApproveOnce | BatchDecision::ApproveForSession);

        let total = commands.len();
        let mut observations = Vec::new();
        let mut stop = None;
        let mut executed_any = false;
        for (idx, command) in commands.iter().enumerate() {
            if self.interrupt.is_interrupted() {
                stop = Some(TurnOutcome::Interrupted);
                break;
            }
            if !batch_approved && !self.gate.is_whitelisted(command) {
                let pending = PendingCommand {
                    summary: command.to_string(),
                    auto_approved: false,
                };
                match self.prompt.confirm_command(idx + 1, total, &pending).await {
                    CommandDecision::Approve => {}
                    CommandDecision::Reject => {
                        stop = Some(TurnOutcome::Cancelled);
                        break;
                    }
                    CommandDecision::Interrupt => {
                        self.interrupt.interrupt();
                        stop = Some(TurnOutcome::Interrupted);
                        break;
                    }
                }
            }

            executed_any = true;
            self.say(&format!("[{}/{}] {}", idx + 1, total, command));
            let execution = self.dispatcher.execute(command).await;
            for mutation in execution.mutations {
                self.operations.push(FileStat {
                    path: mutation.path,
                    added: mutation.added,
                    deleted: mutation.deleted,
                });
            }
            for observation in execution.observations {
                self.say(&clip_head_tail(&observation, TOOL_RESULT_PRINT_CHARS, DEFAULT_HEAD_CHARS));
                observations.push(observation);
            }
        }

        if !observations.is_empty() {
            working.push(Message::user(observations.join("\n")));
            self.notify_history(working);
        }
        match stop {
            Some(TurnOutcome::Interrupted) => {
                working.push(Message::user(USER_INTERRUPTED));
                Ok(CycleStep::Finished(TurnOutcome::Interrupted))
            }
            Some(other) => {
                working.push(Message::user(USER_CANCELLED));
                Ok(CycleStep::Finished(other))
            }
            None if executed_any && self.config.stop_after_first_tool_execution => {
                Ok(CycleStep::Finished(TurnOutcome::StoppedAfterExecution))
            }
            None => Ok(CycleStep::Continue),
        }
    }

    fn print_modification_stats(&mut self, stats: &[FileStat]) {
        if stats.is_empty() {
            return;
        }
        self.say("\n===== File Modification Stats =====");
        for stat in stats {
            self.say(&format!("File: {}\n  +({}) | -({})", stat.path.display(), stat.added, stat.deleted));
        }
        self.say("===================================");
    }

    /// Undoes the most recent file mutation.
    #[instrument(skip(self))]
    pub async fn rollback_last_edit(&mut self) -> Result<RollbackOutcome, AppError> {
        let outcome = self.rollback.rollback_last_edit().await?;
        self.forget_edit(&outcome);
        Ok(outcome)
    }

    /// Like [`Agent::rollback_last_edit`] but restores even if the file changed since.
    #[instrument(skip(self))]
    pub async fn force_rollback_last_edit(&mut self) -> Result<RollbackOutcome, AppError> {
        let outcome = self.rollback.force_rollback_last_edit().await?;
        self.forget_edit(&outcome);
        Ok(outcome)
    }

    fn forget_edit(&mut self, outcome: &RollbackOutcome) {
        self.operations.pop();
        self.dispatcher.filesystem().invalidate(&outcome.path);
    }

    /// Undoes every edit of the last chat turn and drops its messages.
    ///
    /// Stops at the first edit that cannot be rolled back; history is truncated regardless.
    #[instrument(skip(self))]
    pub async fn rollback_last_turn(&mut self) -> Result<TurnRollback, AppError> {
        let marker = self
            .chat_markers
            .pop()
            .ok_or_else(|| AppError::RollbackError("No chat turn to roll back".to_string()))?;
        let requested = self.operations.len().saturating_sub(marker.op_count);
        let mut rolled_back = 0;
        let mut failure = None;
        for _ in 0..requested {
            match self.rollback.rollback_last_edit().await {
                Ok(outcome) => {
                    self.dispatcher.filesystem().invalidate(&outcome.path);
                    rolled_back += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Turn rollback stopped early");
                    failure = Some(e.to_string());
                    break;
                }
            }
        }
        self.operations.truncate(marker.op_count);
        self.history.truncate(marker.history_len);
        self.dispatcher.filesystem().clear_read_cache();
        info!(requested, rolled_back, "Rolled back last chat turn");
        Ok(TurnRollback {
            requested,
            rolled_back,
            error: failure,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stat(path: &str, added: usize, deleted: usize) -> FileStat {
        FileStat {
            path: PathBuf::from(path),
            added,
            deleted,
        }
    }

    #[test]
    fn stats_are_summed_per_file_and_sorted_case_insensitively() {
        let stats = modification_stats(&[stat("b.rs", 1, 0), stat("A.rs", 2, 1), stat("b.rs", 3, 4)]);
        assert_eq!(stats, vec![stat("A.rs", 2, 1), stat("b.rs", 4, 4)]);
        assert!(modification_stats(&[]).is_empty());
    }

    #[test]
    fn autosave_writes_the_message_list() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions").join("s_autosave.json");
        let save = autosave_to(path.clone());
        save(&[Message::system("sys"), Message::user("hi")]);
        let saved: Vec<Message> = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved[1], Message::user("hi"));
    }
}
