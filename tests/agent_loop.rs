use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use terminal_agent::agent::approval::{BatchDecision, CommandDecision, ScriptedPrompt};
use terminal_agent::agent::orchestrator::{FORMAT_FEEDBACK, USER_CANCELLED, USER_INTERRUPTED};
use terminal_agent::agent::{Agent, Message, ScriptedChatClient, TurnOutcome};
use terminal_agent::config::Config;
use terminal_agent::error::AppError;
use terminal_agent::tools::process_tool::ProcessTracker;
use terminal_agent::tools::terminal_tool::{TerminalManager, TerminalTimeouts};

fn workspace() -> (TempDir, PathBuf, Config) {
    let dir = TempDir::new().unwrap();
    let root = dunce::canonicalize(dir.path()).unwrap();
    let config = Config::for_root(&root);
    (dir, root, config)
}

fn agent(config: Config, client: &Arc<ScriptedChatClient>, prompt: &Arc<ScriptedPrompt>) -> Agent {
    Agent::new(config, client.clone(), prompt.clone()).with_console(Box::new(std::io::sink()))
}

fn write_tag(path: &str, content: &str) -> String {
    format!("<write_file><path>{}</path><content>{}</content></write_file>", path, content)
}

fn last_content(messages: &[Message]) -> &str {
    messages.last().map(|m| m.content.as_str()).unwrap_or_default()
}

fn exists(root: &Path, name: &str) -> bool {
    root.join(name).exists()
}

#[tokio::test]
async fn prose_reply_ends_the_turn() {
    let (_dir, _root, config) = workspace();
    let client = Arc::new(ScriptedChatClient::new(["Nothing to do here."]));
    let prompt = Arc::new(ScriptedPrompt::new());
    let mut agent = agent(config, &client, &prompt);

    let report = agent.chat("hello").await;
    assert_eq!(report.outcome, TurnOutcome::Answered);
    assert_eq!(report.cycles, 1);
    assert_eq!(agent.history().len(), 2);
    assert!(agent.history()[0].content.contains("## USER INPUT\nhello"));
    assert_eq!(prompt.batch_prompts(), 0);
}

#[tokio::test]
async fn approved_write_feeds_observation_back() {
    let (_dir, root, config) = workspace();
    let client = Arc::new(ScriptedChatClient::new([write_tag("notes.txt", "a\nb\n"), "Done.".to_string()]));
    let prompt = Arc::new(ScriptedPrompt::new().with_batch_answers([BatchDecision::ApproveOnce]));
    let mut agent = agent(config, &client, &prompt);

    let report = agent.chat("write notes").await;
    assert_eq!(report.outcome, TurnOutcome::Answered);
    assert_eq!(report.cycles, 2);
    assert!(exists(&root, "notes.txt"));
    assert_eq!(prompt.batch_prompts(), 1);

    let second_request = &client.requests()[1];
    assert!(last_content(second_request).starts_with("SUCCESS: Saved to"));
    assert_eq!(report.modifications.len(), 1);
    assert_eq!(report.modifications[0].path, root.join("notes.txt"));
    assert!(report.modifications[0].added > 0);
    assert_eq!(report.modifications[0].deleted, 0);
}

#[tokio::test]
async fn unclosed_tags_get_format_feedback() {
    let (_dir, _root, config) = workspace();
    let client = Arc::new(ScriptedChatClient::new(["<read_file><path>a.txt</path>", "Sorry, answered."]));
    let prompt = Arc::new(ScriptedPrompt::new());
    let mut agent = agent(config, &client, &prompt);

    let report = agent.chat("read a.txt").await;
    assert_eq!(report.outcome, TurnOutcome::Answered);
    assert_eq!(report.cycles, 2);
    assert_eq!(last_content(&client.requests()[1]), FORMAT_FEEDBACK);
}

#[tokio::test]
async fn cancelled_batch_runs_nothing() {
    let (_dir, root, config) = workspace();
    let client = Arc::new(ScriptedChatClient::new([write_tag("x.txt", "x")]));
    let prompt = Arc::new(ScriptedPrompt::new().with_batch_answers([BatchDecision::Cancel]));
    let mut agent = agent(config, &client, &prompt);

    let report = agent.chat("make x").await;
    assert_eq!(report.outcome, TurnOutcome::Cancelled);
    assert!(!exists(&root, "x.txt"));
    assert_eq!(last_content(agent.history()), USER_CANCELLED);
    assert_eq!(client.requests().len(), 1);
}

#[tokio::test]
async fn mixed_batch_asks_once_and_runs_whitelisted_commands_too() {
    let (_dir, root, config) = workspace();
    let reply = format!("<task_add><content>plan</content></task_add>{}", write_tag("y.txt", "y"));
    let client = Arc::new(ScriptedChatClient::new([reply, "ok".to_string()]));
    let prompt = Arc::new(ScriptedPrompt::new().with_batch_answers([BatchDecision::ApproveOnce]));
    let mut agent = agent(config, &client, &prompt);

    agent.chat("plan and write").await;
    assert_eq!(prompt.batch_prompts(), 1);
    assert_eq!(prompt.command_prompts(), 0);
    assert!(exists(&root, "y.txt"));
    assert_eq!(agent.tasks().tasks().len(), 1);

    let observations = last_content(&client.requests()[1]).to_string();
    let lines: Vec<&str> = observations.lines().collect();
    assert_eq!(lines[0], "SUCCESS: Task added (T1)");
    assert!(lines[1].starts_with("SUCCESS: Saved to"));
}

#[tokio::test]
async fn per_command_rejection_stops_the_batch() {
    let (_dir, root, config) = workspace();
    let reply = format!("{}{}", write_tag("first.txt", "1"), write_tag("second.txt", "2"));
    let client = Arc::new(ScriptedChatClient::new([reply]));
    let prompt = Arc::new(
        ScriptedPrompt::new()
            .with_batch_answers([BatchDecision::PerCommand])
            .with_command_answers([CommandDecision::Approve, CommandDecision::Reject]),
    );
    let mut agent = agent(config, &client, &prompt);

    let report = agent.chat("write both").await;
    assert_eq!(report.outcome, TurnOutcome::Cancelled);
    assert_eq!(prompt.command_prompts(), 2);
    assert!(exists(&root, "first.txt"));
    assert!(!exists(&root, "second.txt"));
    assert_eq!(last_content(agent.history()), USER_CANCELLED);
}

#[tokio::test]
async fn per_command_interrupt_ends_the_turn() {
    let (_dir, root, config) = workspace();
    let client = Arc::new(ScriptedChatClient::new([write_tag("z.txt", "z")]));
    let prompt = Arc::new(
        ScriptedPrompt::new()
            .with_batch_answers([BatchDecision::PerCommand])
            .with_command_answers([CommandDecision::Interrupt]),
    );
    let mut agent = agent(config, &client, &prompt);

    let report = agent.chat("write z").await;
    assert_eq!(report.outcome, TurnOutcome::Interrupted);
    assert!(!exists(&root, "z.txt"));
    assert_eq!(last_content(agent.history()), USER_INTERRUPTED);
}

#[tokio::test]
async fn stop_after_first_execution_skips_the_follow_up_request() {
    let (_dir, _root, mut config) = workspace();
    config.stop_after_first_tool_execution = true;
    let client = Arc::new(ScriptedChatClient::new(["<run_command><command>echo hi</command></run_command>"]));
    let prompt = Arc::new(ScriptedPrompt::new());
    let mut agent = agent(config, &client, &prompt);

    let report = agent.chat("say hi").await;
    assert_eq!(report.outcome, TurnOutcome::StoppedAfterExecution);
    assert_eq!(client.requests().len(), 1);
    let observation = last_content(agent.history());
    assert!(observation.starts_with("SUCCESS: Command executed"));
    assert!(observation.contains("hi"));
}

#[tokio::test]
async fn max_cycles_bounds_the_turn() {
    let (_dir, _root, mut config) = workspace();
    config.max_cycles = 2;
    let client = Arc::new(ScriptedChatClient::new(["<task_list></task_list>", "<task_list></task_list>", "unused"]));
    let prompt = Arc::new(ScriptedPrompt::new());
    let mut agent = agent(config, &client, &prompt);

    let report = agent.chat("loop").await;
    assert_eq!(report.outcome, TurnOutcome::MaxCycles);
    assert_eq!(report.cycles, 2);
    assert_eq!(client.requests().len(), 2);
}

#[tokio::test]
async fn transport_failure_is_not_recorded_in_history() {
    let (_dir, _root, config) = workspace();
    let client = Arc::new(ScriptedChatClient::new(Vec::<String>::new()));
    let prompt = Arc::new(ScriptedPrompt::new());
    let mut agent = agent(config, &client, &prompt);

    let report = agent.chat("anyone there?").await;
    assert_eq!(report.outcome, TurnOutcome::TransportFailed);
    assert!(report.error.is_some());
    assert_eq!(agent.history().len(), 1);
    assert!(agent.history().iter().all(|m| !m.content.contains("Agent crashed")));
}

#[tokio::test]
async fn interrupted_stream_keeps_the_partial_reply() {
    let (_dir, root, config) = workspace();
    let client = Arc::new(
        ScriptedChatClient::new(Vec::<String>::new()).with_interrupted_reply("<write_file><path>x.txt</path>"),
    );
    let prompt = Arc::new(ScriptedPrompt::new());
    let mut agent = agent(config, &client, &prompt);

    let report = agent.chat("write x").await;
    assert_eq!(report.outcome, TurnOutcome::Interrupted);
    assert_eq!(report.cycles, 1);
    let history = agent.history();
    assert_eq!(history.len(), 3);
    assert_eq!(history[1].content, "<write_file><path>x.txt</path>\n\n[Interrupted by user]");
    assert_eq!(history[2].content, USER_INTERRUPTED);
    assert!(!exists(&root, "x.txt"));
    assert_eq!(prompt.batch_prompts(), 0);
}

#[tokio::test]
async fn non_transport_failure_is_recorded_as_a_crash() {
    let (_dir, _root, config) = workspace();
    let client = Arc::new(
        ScriptedChatClient::new(Vec::<String>::new())
            .with_failure(AppError::InvalidInputArgument("malformed request".into())),
    );
    let prompt = Arc::new(ScriptedPrompt::new());
    let mut agent = agent(config, &client, &prompt);

    let report = agent.chat("go").await;
    assert_eq!(report.outcome, TurnOutcome::Crashed);
    assert!(report.error.as_deref().unwrap_or_default().contains("malformed request"));
    assert_eq!(agent.history().len(), 2);
    assert!(last_content(agent.history()).starts_with("ERROR: Agent crashed with error: "));
}

#[tokio::test]
async fn unauthorized_failure_is_a_transport_failure() {
    let (_dir, _root, config) = workspace();
    let client = Arc::new(ScriptedChatClient::new(Vec::<String>::new()).with_failure(AppError::Unauthorized));
    let prompt = Arc::new(ScriptedPrompt::new());
    let mut agent = agent(config, &client, &prompt);

    let report = agent.chat("go").await;
    assert_eq!(report.outcome, TurnOutcome::TransportFailed);
    assert!(report.error.as_deref().unwrap_or_default().contains("401"));
}

#[tokio::test]
async fn empty_first_input_is_skipped() {
    let (_dir, _root, config) = workspace();
    let client = Arc::new(ScriptedChatClient::new(["never sent"]));
    let prompt = Arc::new(ScriptedPrompt::new());
    let mut agent = agent(config, &client, &prompt);

    let report = agent.chat("   ").await;
    assert_eq!(report.outcome, TurnOutcome::Skipped);
    assert!(client.requests().is_empty());
    assert!(agent.history().is_empty());
}

#[tokio::test]
async fn rollback_last_turn_reverts_files_and_history() {
    let (_dir, root, config) = workspace();
    let client = Arc::new(ScriptedChatClient::new([
        "First answer.".to_string(),
        write_tag("made.txt", "content\n"),
        "Written.".to_string(),
    ]));
    let prompt = Arc::new(ScriptedPrompt::new().with_batch_answers([BatchDecision::ApproveOnce]));
    let mut agent = agent(config, &client, &prompt);

    agent.chat("hi").await;
    let after_first = agent.history().len();
    agent.chat("make a file").await;
    assert!(exists(&root, "made.txt"));

    let rollback = agent.rollback_last_turn().await.unwrap();
    assert_eq!(rollback.requested, 1);
    assert_eq!(rollback.rolled_back, 1);
    assert!(rollback.error.is_none());
    assert!(!exists(&root, "made.txt"));
    assert_eq!(agent.history().len(), after_first);
    assert!(agent.operations().is_empty());

    agent.rollback_last_turn().await.unwrap();
    assert!(agent.history().is_empty());
    assert!(agent.rollback_last_turn().await.is_err());
}

#[tokio::test]
async fn compaction_folds_old_turns_into_a_summary() {
    let (_dir, _root, mut config) = workspace();
    config.token_threshold = 10;
    let replies: Vec<String> = (0..6).map(|i| format!("answer {}", i)).collect();
    let client = Arc::new(ScriptedChatClient::new(replies).with_summaries(["- user greeted five times"]));
    let prompt = Arc::new(ScriptedPrompt::new());
    let mut agent = agent(config, &client, &prompt);

    // Nothing is folded while the history fits in the kept tail.
    for i in 0..5 {
        let report = agent.chat(&format!("turn {}", i)).await;
        assert!(!report.compacted);
    }
    assert_eq!(agent.history().len(), 10);

    let report = agent.chat("turn 5").await;
    assert!(report.compacted);
    assert_eq!(report.outcome, TurnOutcome::Answered);
    assert!(agent.history()[0].is_persistent_summary());
    assert_eq!(agent.history()[0].summary_text(), "- user greeted five times");
    assert_eq!(agent.history().len(), 12);

    agent.rollback_last_turn().await.unwrap();
    assert_eq!(agent.history().len(), 10);
    assert!(agent.history()[0].is_persistent_summary());
    assert!(agent.rollback_last_turn().await.is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn slow_command_moves_to_background() {
    let (_dir, root, config) = workspace();
    let tracker = Arc::new(ProcessTracker::new(root.join("logs").join("procs.json")));
    let terminals = TerminalManager::new(&config, tracker).with_timeouts(TerminalTimeouts {
        short_timeout: Duration::from_millis(300),
        long_window: Duration::from_millis(300),
        poll_interval: Duration::from_millis(50),
    });
    let client = Arc::new(ScriptedChatClient::new([
        "<run_command><command>sleep 5</command></run_command>",
        "Started.",
    ]));
    let prompt = Arc::new(ScriptedPrompt::new().with_batch_answers([BatchDecision::ApproveOnce]));
    let mut agent = agent(config, &client, &prompt).with_terminals(terminals);

    agent.chat("sleep").await;
    let observation = last_content(&client.requests()[1]).to_string();
    assert!(observation.starts_with("SUCCESS: Command started (running)"));
    assert!(observation.contains("moved to background"));
    assert!(agent.render_running_terminals().await.contains("cmd=sleep 5"));

    let (stopped, _) = agent.terminals().stop_all().await;
    assert_eq!(stopped, 1);
}
