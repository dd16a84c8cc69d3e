use anyhow::{Context, Result};
use std::io::Write;
use std::sync::Arc;
use terminal_agent::agent::orchestrator::autosave_to;
use terminal_agent::agent::{Agent, OpenAiCompatClient, StdinPrompt};
use terminal_agent::config::Config;
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

const HELP: &str = "Commands: rollback [force|turn] | terminals | processes | output <id> | input <id> <text> | stop <id> | tasks | clear | help | exit";

fn setup_logging(log_level_str: &str) -> Result<()> {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("terminal_agent={}", level)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")
}

async fn read_line() -> Option<String> {
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line),
        }
    })
    .await
    .ok()
    .flatten()
}

/// Handles a REPL command; returns false for input meant for the model.
async fn handle_local(agent: &mut Agent, input: &str) -> bool {
    match input {
        "help" => println!("{}", HELP),
        "rollback" => match agent.rollback_last_edit().await {
            Ok(outcome) => println!("Rolled back {}", outcome.path.display()),
            Err(e) => println!("Rollback failed: {}", e),
        },
        "rollback force" => match agent.force_rollback_last_edit().await {
            Ok(outcome) => println!("Rolled back {} (forced)", outcome.path.display()),
            Err(e) => println!("Rollback failed: {}", e),
        },
        "processes" => match agent.process_tracker().running_processes().await {
            Ok(records) if records.is_empty() => println!("No tracked processes are running."),
            Ok(records) => {
                for record in records {
                    println!("- pid={} started={} cmd={}", record.pid, record.start_time, record.command);
                }
            }
            Err(e) => println!("Process check failed: {}", e),
        },
        "rollback turn" => match agent.rollback_last_turn().await {
            Ok(report) => {
                println!("Rolled back {}/{} edits of the last turn", report.rolled_back, report.requested);
                if let Some(err) = report.error {
                    println!("Stopped early: {}", err);
                }
            }
            Err(e) => println!("Rollback failed: {}", e),
        },
        "terminals" => println!("{}", agent.render_running_terminals().await),
        "tasks" => println!("{}", agent.tasks().render()),
        "clear" => {
            agent.clear_history();
            println!("History cleared.");
        }
        other => {
            let (verb, rest) = other.split_once(' ').unwrap_or((other, ""));
            let rest = rest.trim();
            match verb {
                "stop" if !rest.is_empty() => match agent.terminals().stop(rest).await {
                    Ok(message) => println!("{}", message),
                    Err(e) => println!("Stop failed: {}", e),
                },
                "output" if !rest.is_empty() => match agent.terminals().read_output(rest).await {
                    Ok(output) => println!("{}", output),
                    Err(e) => println!("{}", e),
                },
                "input" if !rest.is_empty() => {
                    let (id, text) = rest.split_once(' ').unwrap_or((rest, ""));
                    match agent.terminals().send_input(id, &format!("{}\n", text)).await {
                        Ok(()) => println!("Sent to {}", id),
                        Err(e) => println!("{}", e),
                    }
                }
                _ => return false,
            }
        }
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    setup_logging(&config.log_level)?;

    tracing::info!(version = %env!("CARGO_PKG_VERSION"), root = %config.files_root.display(), "Starting terminal-agent");
    tracing::debug!("Loaded configuration: {:?}", config);

    if which::which("rg").is_err() {
        tracing::warn!("ripgrep (rg) is not installed or not in PATH. search_in_files falls back to the built-in walker.");
    }

    let client = OpenAiCompatClient::new(&config).context("Failed to build HTTP client")?;
    let mut agent = Agent::new(config.clone(), Arc::new(client), Arc::new(StdinPrompt));
    if config.auto_save_session {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = config.sessions_dir().join(format!("{}_autosave.json", stamp));
        tracing::info!(path = %path.display(), "Session autosave enabled");
        agent = agent.with_history_callback(autosave_to(path));
    }

    let interrupt = agent.interrupt_handle();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if interrupt.is_interrupted() {
                eprintln!("\nInterrupted twice; exiting.");
                std::process::exit(130);
            }
            interrupt.interrupt();
            eprintln!("\n[Interrupt requested]");
        }
    });

    println!("terminal-agent {} in {}", env!("CARGO_PKG_VERSION"), config.files_root.display());
    println!("{}", HELP);
    loop {
        print!("\n> ");
        std::io::stdout().flush().ok();
        let Some(line) = read_line().await else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if matches!(input, "exit" | "quit") {
            break;
        }
        if handle_local(&mut agent, input).await {
            continue;
        }
        let report = agent.chat(input).await;
        agent.interrupt_handle().reset();
        tracing::info!(outcome = ?report.outcome, cycles = report.cycles, "Turn complete");
    }

    let (stopped, failed) = agent.terminals().stop_all().await;
    tracing::info!(stopped, failed, "Shut down");
    Ok(())
}
