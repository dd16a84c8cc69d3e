use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Every tag name the scanner recognises, in the order they are documented to the model.
pub const COMMAND_TAGS: &[&str] = &[
    "search_files",
    "search_in_files",
    "read_file",
    "write_file",
    "edit_lines",
    "replace_in_file",
    "run_command",
    "task_add",
    "task_update",
    "task_delete",
    "task_list",
    "task_clear",
    "web_search",
    "visit_page",
    "ocr_image",
    "ocr_document",
];

/// Kinds executed outside this crate through a pluggable handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalKind {
    WebSearch,
    VisitPage,
    OcrImage,
    OcrDocument,
}

impl ExternalKind {
    pub fn tag(&self) -> &'static str {
        match self {
            ExternalKind::WebSearch => "web_search",
            ExternalKind::VisitPage => "visit_page",
            ExternalKind::OcrImage => "ocr_image",
            ExternalKind::OcrDocument => "ocr_document",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "web_search" => Some(ExternalKind::WebSearch),
            "visit_page" => Some(ExternalKind::VisitPage),
            "ocr_image" => Some(ExternalKind::OcrImage),
            "ocr_document" => Some(ExternalKind::OcrDocument),
            _ => None,
        }
    }

    /// The field that must be non-empty, followed by the optional ones.
    pub fn fields(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            ExternalKind::WebSearch => ("query", &["max_results"]),
            ExternalKind::VisitPage => ("url", &[]),
            ExternalKind::OcrImage => ("path", &[]),
            ExternalKind::OcrDocument => ("path", &["start_page", "end_page"]),
        }
    }
}

/// One validated unit of model-requested action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    SearchFiles {
        pattern: String,
    },
    SearchInFiles {
        regex: String,
        glob: String,
        root: String,
        max_matches: usize,
    },
    ReadFile {
        path: String,
        start_line: i64,
        end_line: i64,
    },
    WriteFile {
        path: String,
        content: String,
        overwrite: bool,
    },
    EditLines {
        path: String,
        delete_start: Option<i64>,
        delete_end: Option<i64>,
        insert_at: Option<i64>,
        auto_indent: bool,
        content: String,
    },
    ReplaceInFile {
        path: String,
        search: String,
        replace: String,
        count: i64,
        regex: bool,
        auto_indent: bool,
    },
    RunCommand {
        command: String,
        is_long_running: bool,
        cwd: Option<String>,
    },
    TaskAdd {
        id: Option<String>,
        content: String,
        status: Option<String>,
        progress: Option<i64>,
    },
    TaskUpdate {
        id: String,
        content: Option<String>,
        status: Option<String>,
        progress: Option<i64>,
    },
    TaskDelete {
        id: String,
    },
    TaskList,
    TaskClear,
    External {
        kind: ExternalKind,
        args: BTreeMap<String, String>,
    },
}

impl Command {
    /// The tag name this command was parsed from; also the whitelist key.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::SearchFiles { .. } => "search_files",
            Command::SearchInFiles { .. } => "search_in_files",
            Command::ReadFile { .. } => "read_file",
            Command::WriteFile { .. } => "write_file",
            Command::EditLines { .. } => "edit_lines",
            Command::ReplaceInFile { .. } => "replace_in_file",
            Command::RunCommand { .. } => "run_command",
            Command::TaskAdd { .. } => "task_add",
            Command::TaskUpdate { .. } => "task_update",
            Command::TaskDelete { .. } => "task_delete",
            Command::TaskList => "task_list",
            Command::TaskClear => "task_clear",
            Command::External { kind, .. } => kind.tag(),
        }
    }

    /// Whether executing this command can change files on disk.
    pub fn mutates_files(&self) -> bool {
        matches!(
            self,
            Command::WriteFile { .. } | Command::EditLines { .. } | Command::ReplaceInFile { .. }
        )
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    let first = text.lines().next().unwrap_or("");
    if first.chars().count() > max_chars {
        let head: String = first.chars().take(max_chars).collect();
        format!("{}...", head)
    } else if text.lines().nth(1).is_some() {
        format!("{} ...", first)
    } else {
        first.to_string()
    }
}

/// One-line summary used in approval listings.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SearchFiles { pattern } => write!(f, "search_files {}", pattern),
            Command::SearchInFiles { regex, glob, root, .. } => {
                write!(f, "search_in_files /{}/ in {} ({})", regex, root, glob)
            }
            Command::ReadFile { path, start_line, end_line } => {
                write!(f, "read_file {} [{}-{}]", path, start_line, end_line)
            }
            Command::WriteFile { path, content, overwrite } => write!(
                f,
                "write_file {} ({} lines{})",
                path,
                content.lines().count(),
                if *overwrite { ", overwrite" } else { "" }
            ),
            Command::EditLines { path, delete_start, delete_end, insert_at, content, .. } => {
                write!(f, "edit_lines {}", path)?;
                if let Some(ds) = delete_start {
                    write!(f, " delete {}-{}", ds, delete_end.unwrap_or(*ds))?;
                }
                if let Some(ins) = insert_at {
                    write!(f, " insert@{}", ins)?;
                }
                write!(f, " (+{} lines)", content.lines().count())
            }
            Command::ReplaceInFile { path, search, count, regex, .. } => write!(
                f,
                "replace_in_file {} {}'{}' x{}",
                path,
                if *regex { "regex " } else { "" },
                clip(search, 40),
                count
            ),
            Command::RunCommand { command, is_long_running, cwd } => {
                write!(f, "run_command `{}`", clip(command, 80))?;
                if *is_long_running {
                    write!(f, " (long-running)")?;
                }
                if let Some(cwd) = cwd {
                    write!(f, " in {}", cwd)?;
                }
                Ok(())
            }
            Command::TaskAdd { content, .. } => write!(f, "task_add {}", clip(content, 60)),
            Command::TaskUpdate { id, status, .. } => {
                write!(f, "task_update {} {}", id, status.as_deref().unwrap_or(""))
            }
            Command::TaskDelete { id } => write!(f, "task_delete {}", id),
            Command::TaskList => write!(f, "task_list"),
            Command::TaskClear => write!(f, "task_clear"),
            Command::External { kind, args } => {
                let (required, _) = kind.fields();
                write!(
                    f,
                    "{} {}",
                    kind.tag(),
                    clip(args.get(required).map(String::as_str).unwrap_or(""), 80)
                )
            }
        }
    }
}
