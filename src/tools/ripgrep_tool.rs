use crate::error::AppError;
use crate::tools::filesystem_tool::{collect_files, matches_glob, PathTree};
use crate::utils::path_utils::resolve_path;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio as StdProcessStdio;
use tokio::process::Command as TokioCommand;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, instrument, warn};

pub const DEFAULT_MAX_MATCHES: usize = 200;
pub const DEFAULT_GLOB: &str = "**/*";
const MAX_SHOWN_LINE_CHARS: usize = 240;
const RG_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchBackend {
    Ripgrep,
    Builtin,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentSearchResult {
    pub regex: String,
    pub glob: String,
    pub root: PathBuf,
    /// Matched (line number, line) pairs grouped per file.
    pub matches: BTreeMap<PathBuf, Vec<(u64, String)>>,
    pub total: usize,
    pub backend: SearchBackend,
}

impl ContentSearchResult {
    fn push(&mut self, path: PathBuf, line: u64, text: String) {
        self.matches.entry(path).or_default().push((line, text));
        self.total += 1;
    }

    pub fn render_tree(&self) -> String {
        let mut tree = PathTree::default();
        for (path, lines) in &self.matches {
            let rel = path.strip_prefix(&self.root).unwrap_or(path);
            let node = tree.insert(rel);
            for (line_no, text) in lines {
                let shown = text.trim_end();
                let shown = if shown.chars().count() > MAX_SHOWN_LINE_CHARS {
                    format!("{}...", shown.chars().take(MAX_SHOWN_LINE_CHARS).collect::<String>())
                } else {
                    shown.to_string()
                };
                node.annotate(format!("L{}: {}", line_no, shown));
            }
        }
        tree.render(&self.root.to_string_lossy())
    }
}

/// Regex search across file contents, via ripgrep when installed.
#[derive(Debug)]
pub struct RipgrepSearcher {
    files_root: PathBuf,
    rg_path: Option<PathBuf>,
}

impl RipgrepSearcher {
    pub fn new(files_root: &Path) -> Self {
        let rg_path = match which::which("rg") {
            Ok(p) => Some(p),
            Err(_) => {
                debug!("ripgrep (rg) not found in PATH; using the built-in search");
                None
            }
        };
        Self {
            files_root: files_root.to_path_buf(),
            rg_path,
        }
    }

    /// Forces the in-process search even when ripgrep is available.
    pub fn builtin_only(mut self) -> Self {
        self.rg_path = None;
        self
    }

    #[instrument(skip(self), fields(regex = %regex))]
    pub async fn search_in_files(
        &self,
        regex: &str,
        glob: &str,
        root: &str,
        max_matches: usize,
    ) -> Result<ContentSearchResult, AppError> {
        let compiled = Regex::new(regex).map_err(|e| AppError::InvalidInputArgument(format!("Invalid regex: {}", e)))?;
        let root_path = resolve_path(if root.trim().is_empty() { "." } else { root }, &self.files_root)?;
        if !root_path.is_dir() {
            return Err(AppError::InvalidPath(format!("Search root is not a directory: {}", root_path.display())));
        }
        let glob = if glob.trim().is_empty() { DEFAULT_GLOB } else { glob.trim() };
        let max_matches = if max_matches == 0 { DEFAULT_MAX_MATCHES } else { max_matches };

        let mut result = ContentSearchResult {
            regex: regex.to_string(),
            glob: glob.to_string(),
            root: root_path.clone(),
            matches: BTreeMap::new(),
            total: 0,
            backend: SearchBackend::Builtin,
        };

        if let Some(rg) = &self.rg_path {
            match self.run_ripgrep(rg, regex, &root_path, glob, max_matches, &mut result).await {
                Ok(()) => {
                    result.backend = SearchBackend::Ripgrep;
                    return Ok(result);
                }
                Err(e) => {
                    warn!(error = %e, "ripgrep failed, falling back to built-in search");
                    result.matches.clear();
                    result.total = 0;
                }
            }
        }

        self.run_builtin(&compiled, &root_path, glob, max_matches, &mut result).await?;
        Ok(result)
    }

    async fn run_ripgrep(
        &self,
        rg: &Path,
        regex: &str,
        root: &Path,
        glob: &str,
        max_matches: usize,
        result: &mut ContentSearchResult,
    ) -> Result<(), AppError> {
        let mut cmd = TokioCommand::new(rg);
        cmd.current_dir(root)
            .arg("--json")
            .arg("--line-number")
            .arg("-e")
            .arg(regex)
            .arg(".")
            .stdout(StdProcessStdio::piped())
            .stderr(StdProcessStdio::piped());

        let output = match timeout(RG_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!(error = %e, "Failed to spawn ripgrep");
                return Err(AppError::ProcessSpawnError(format!("Failed to spawn ripgrep: {}", e)));
            }
            Err(_) => return Err(AppError::TimeoutError("ripgrep search timed out".to_string())),
        };
        // Exit code 1 means no matches.
        if !output.status.success() && output.status.code() != Some(1) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::ProcessError(format!("ripgrep failed ({:?}): {}", output.status, stderr)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line_str in stdout.lines() {
            if result.total >= max_matches {
                break;
            }
            let json_val: serde_json::Value = match serde_json::from_str(line_str) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "Failed to parse ripgrep JSON line");
                    continue;
                }
            };
            if json_val.get("type").and_then(|t| t.as_str()) != Some("match") {
                continue;
            }
            let Some(data) = json_val.get("data") else { continue };
            let path_text = data
                .get("path")
                .and_then(|p| p.get("text"))
                .and_then(|t| t.as_str())
                .unwrap_or_default();
            let rel = path_text.trim_start_matches("./");
            if !matches_glob(rel, glob) {
                continue;
            }
            let line_no = data.get("line_number").and_then(|n| n.as_u64()).unwrap_or(0);
            let text = data
                .get("lines")
                .and_then(|l| l.get("text"))
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .trim_end_matches(&['\n', '\r'][..])
                .to_string();
            result.push(root.join(rel), line_no, text);
        }
        Ok(())
    }

    async fn run_builtin(
        &self,
        compiled: &Regex,
        root: &Path,
        glob: &str,
        max_matches: usize,
        result: &mut ContentSearchResult,
    ) -> Result<(), AppError> {
        for file in collect_files(root).await? {
            let rel = match file.strip_prefix(root) {
                Ok(rel) => rel.to_string_lossy().to_string(),
                Err(_) => continue,
            };
            if !matches_glob(&rel, glob) {
                continue;
            }
            let Ok(bytes) = tokio::fs::read(&file).await else {
                continue;
            };
            if bytes[..bytes.len().min(8192)].contains(&0) {
                continue;
            }
            let text = String::from_utf8_lossy(&bytes);
            for (idx, line) in text.lines().enumerate() {
                if compiled.is_match(line) {
                    result.push(file.clone(), idx as u64 + 1, line.to_string());
                    if result.total >= max_matches {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workspace() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("src/lib.rs"), "fn alpha() {}\nfn beta() {}\n").unwrap();
        std::fs::write(root.join("notes.md"), "alpha notes\n").unwrap();
        (dir, root)
    }

    #[tokio::test]
    async fn builtin_search_groups_by_file_and_honours_glob() {
        let (_dir, root) = workspace();
        let searcher = RipgrepSearcher::new(&root).builtin_only();
        let result = searcher.search_in_files("alpha", "*.rs", ".", 0).await.unwrap();
        assert_eq!(result.backend, SearchBackend::Builtin);
        assert_eq!(result.total, 1);
        let lines = &result.matches[&root.join("src/lib.rs")];
        assert_eq!(lines, &vec![(1, "fn alpha() {}".to_string())]);
        assert!(result.render_tree().contains("└── L1: fn alpha() {}"));
    }

    #[tokio::test]
    async fn max_matches_caps_results() {
        let (_dir, root) = workspace();
        let searcher = RipgrepSearcher::new(&root).builtin_only();
        let result = searcher.search_in_files("fn|alpha", DEFAULT_GLOB, ".", 2).await.unwrap();
        assert_eq!(result.total, 2);
    }

    #[tokio::test]
    async fn invalid_regex_is_rejected() {
        let (_dir, root) = workspace();
        let searcher = RipgrepSearcher::new(&root);
        let err = searcher.search_in_files("(", DEFAULT_GLOB, ".", 10).await.unwrap_err();
        assert!(err.to_string().contains("Invalid regex"));
    }

    #[tokio::test]
    async fn either_backend_finds_the_same_lines() {
        let (_dir, root) = workspace();
        let result = RipgrepSearcher::new(&root)
            .search_in_files("beta", DEFAULT_GLOB, "src", 10)
            .await
            .unwrap();
        assert_eq!(result.total, 1);
        assert_eq!(result.matches[&root.join("src/lib.rs")][0].0, 2);
    }
}
