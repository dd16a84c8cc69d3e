use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

pub const DEFAULT_WHITELISTED_TOOLS: &[&str] = &[
    "search_files",
    "search_in_files",
    "read_file",
    "task_add",
    "task_update",
    "task_delete",
    "task_list",
    "task_clear",
];

pub const DEFAULT_WHITELISTED_COMMANDS: &[&str] = &["ls", "dir", "pwd", "whoami", "echo", "cat", "type"];

pub const DEFAULT_BLOCKED_COMMANDS: &[&str] = &["rm -rf", "format", "del /f/s/q", "mkfs"];

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub base_url: String,
    pub model_name: String,
    pub files_root: PathBuf,
    pub max_cycles: usize,
    pub token_threshold: usize,
    pub stop_after_first_tool_execution: bool,
    pub whitelisted_tools: Vec<String>,
    pub whitelisted_commands: Vec<String>,
    pub blocked_commands: Vec<String>,
    pub default_shell: Option<String>,
    pub log_level: String,
    pub log_dir: PathBuf,
    pub audit_log_max_size_bytes: u64,
    pub auto_save_session: bool,
}

fn expand_tilde(path_str: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path_str).as_ref())
}

fn env_list(name: &str, defaults: &[&str]) -> Vec<String> {
    match std::env::var(name) {
        Ok(raw) => raw
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Err(_) => defaults.iter().map(|s| s.to_string()).collect(),
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", name, e)),
        _ => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on"),
        Err(_) => default,
    }
}

impl Config {
    /// Defaults rooted at `files_root`, without reading the environment.
    pub fn for_root(files_root: impl AsRef<Path>) -> Self {
        let files_root = files_root.as_ref().to_path_buf();
        let log_dir = files_root.join("logs");
        Config {
            api_key: String::new(),
            base_url: "https://api.deepseek.com".to_string(),
            model_name: "deepseek-chat".to_string(),
            files_root,
            max_cycles: 30,
            token_threshold: 30_000,
            stop_after_first_tool_execution: false,
            whitelisted_tools: DEFAULT_WHITELISTED_TOOLS.iter().map(|s| s.to_string()).collect(),
            whitelisted_commands: DEFAULT_WHITELISTED_COMMANDS.iter().map(|s| s.to_string()).collect(),
            blocked_commands: DEFAULT_BLOCKED_COMMANDS.iter().map(|s| s.to_string()).collect(),
            default_shell: None,
            log_level: "info".to_string(),
            log_dir,
            audit_log_max_size_bytes: 10 * 1024 * 1024,
            auto_save_session: false,
        }
    }

    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let files_root = match std::env::var("FILES_ROOT") {
            Ok(raw) if !raw.trim().is_empty() => expand_tilde(raw.trim()),
            _ => std::env::current_dir().context("Failed to read current directory")?,
        };
        let files_root = dunce::canonicalize(&files_root)
            .with_context(|| format!("Failed to canonicalize FILES_ROOT: {}", files_root.display()))?;
        if !files_root.is_dir() {
            anyhow::bail!("FILES_ROOT is not a valid directory: {:?}", files_root);
        }

        let mut config = Config::for_root(&files_root);

        config.api_key = std::env::var("AGENT_API_KEY").unwrap_or_default();
        if config.api_key.trim().is_empty() {
            warn!("AGENT_API_KEY is not set. Requests to the model endpoint will be rejected.");
        }
        if let Ok(base_url) = std::env::var("AGENT_BASE_URL") {
            if !base_url.trim().is_empty() {
                config.base_url = base_url.trim().to_string();
            }
        }
        if let Ok(model) = std::env::var("AGENT_MODEL") {
            if !model.trim().is_empty() {
                config.model_name = model.trim().to_string();
            }
        }

        config.max_cycles = env_parse("MAX_CYCLES", config.max_cycles)?;
        config.token_threshold = env_parse("TOKEN_THRESHOLD", config.token_threshold)?;
        config.stop_after_first_tool_execution =
            env_bool("STOP_AFTER_FIRST_TOOL_EXECUTION", config.stop_after_first_tool_execution);
        config.whitelisted_tools = env_list("WHITELISTED_TOOLS", DEFAULT_WHITELISTED_TOOLS);
        config.whitelisted_commands = env_list("WHITELISTED_COMMANDS", DEFAULT_WHITELISTED_COMMANDS);
        config.blocked_commands = env_list("BLOCKED_COMMANDS", DEFAULT_BLOCKED_COMMANDS);
        config.default_shell = std::env::var("DEFAULT_SHELL").ok().filter(|s| !s.is_empty());
        config.log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        config.auto_save_session = env_bool("AUTO_SAVE_SESSION", false);

        if let Ok(raw) = std::env::var("AGENT_LOG_DIR") {
            if !raw.trim().is_empty() {
                config.log_dir = expand_tilde(raw.trim());
            }
        }

        config.audit_log_max_size_bytes = std::env::var("AUDIT_LOG_MAX_SIZE_MB")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<u64>()
            .map(|mb| mb * 1024 * 1024)
            .unwrap_or(10 * 1024 * 1024);

        if config.max_cycles == 0 {
            warn!("MAX_CYCLES is 0; every chat turn will end before contacting the model.");
        }

        Ok(config)
    }

    pub fn edit_history_file(&self) -> PathBuf {
        self.log_dir.join("edit_history.jsonl")
    }

    pub fn process_records_file(&self) -> PathBuf {
        self.log_dir.join("process_tracker.json")
    }

    pub fn audit_log_file(&self) -> PathBuf {
        self.log_dir.join("tool_calls.log")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.log_dir.join("sessions")
    }

    pub fn chat_endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}
