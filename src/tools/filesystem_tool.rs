use crate::config::Config;
use crate::error::AppError;
use crate::tools::edit_tool::diff_counts;
use crate::utils::line_ending_handler::{detect_line_ending, normalize_line_endings, LineEndingStyle};
use crate::utils::path_utils::{display_relative, resolve_path};
use crate::utils::rollback_log::RollbackLog;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::SystemTime;
use tokio::fs;
use tracing::{debug, instrument, warn};
use wildmatch::WildMatch;

/// Largest line window a single read returns.
pub const MAX_READ_WINDOW: usize = 160;
pub const MAX_READ_CHARS: usize = 20_000;
pub const SEARCH_FILES_LIMIT: usize = 50;
const READ_CACHE_CAP: usize = 200;
const SUGGESTION_CUTOFF: f64 = 0.4;

#[derive(Debug, Clone, Serialize)]
pub struct ReadRange {
    pub path: PathBuf,
    pub total_lines: usize,
    pub start_line: usize,
    pub end_line: usize,
    /// Requested end line when the window was clamped.
    pub clamped_from: Option<usize>,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub enum ReadOutcome {
    Fresh(ReadRange),
    Duplicate { path: PathBuf, start_line: usize, end_line: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct FileMutation {
    pub path: PathBuf,
    pub added: usize,
    pub deleted: usize,
    pub created: bool,
    pub replacements: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchFilesResult {
    pub pattern: String,
    pub matches: Vec<PathBuf>,
    pub suggestions: Vec<String>,
}

/// Directory tree used to render search results.
#[derive(Debug, Default)]
pub struct PathTree {
    children: BTreeMap<String, PathTree>,
    notes: Vec<String>,
}

impl PathTree {
    pub fn insert(&mut self, rel_path: &Path) -> &mut PathTree {
        let mut node = self;
        for part in rel_path.components() {
            let name = part.as_os_str().to_string_lossy().to_string();
            node = node.children.entry(name).or_default();
        }
        node
    }

    pub fn annotate(&mut self, note: String) {
        self.notes.push(note);
    }

    pub fn render(&self, root_label: &str) -> String {
        let mut lines = vec![format!("{}/", root_label.trim_end_matches('/'))];
        self.render_into("", &mut lines);
        lines.join("\n")
    }

    fn render_into(&self, prefix: &str, out: &mut Vec<String>) {
        let total = self.notes.len() + self.children.len();
        let mut idx = 0;
        for note in &self.notes {
            idx += 1;
            let connector = if idx == total { "└── " } else { "├── " };
            out.push(format!("{}{}{}", prefix, connector, note));
        }
        for (name, child) in &self.children {
            idx += 1;
            let last = idx == total;
            out.push(format!("{}{}{}", prefix, if last { "└── " } else { "├── " }, name));
            let next = format!("{}{}", prefix, if last { "    " } else { "│   " });
            child.render_into(&next, out);
        }
    }
}

/// Glob match against the relative path or its basename; `*` crosses `/`.
///
/// `./` and `**/` prefixes, `/**/` segments and a trailing `/**` are relaxed
/// so `src/**/*.rs` also matches `src/main.rs`.
pub fn matches_glob(rel_path: &str, pattern: &str) -> bool {
    let norm = rel_path.replace('\\', "/");
    let gp = pattern.replace('\\', "/");
    let mut candidates = vec![gp.clone()];
    if let Some(rest) = gp.strip_prefix("./") {
        candidates.push(rest.to_string());
    }
    if let Some(rest) = gp.strip_prefix("**/") {
        candidates.push(rest.to_string());
    }

    let mut expanded = Vec::new();
    for mut cand in candidates {
        expanded.push(cand.clone());
        while cand.contains("/**/") {
            cand = cand.replacen("/**/", "/", 1);
            expanded.push(cand.clone());
        }
        if let Some(stripped) = cand.strip_suffix("/**") {
            expanded.push(stripped.to_string());
        }
    }

    let basename = norm.rsplit('/').next().unwrap_or(&norm);
    expanded.iter().any(|cand| {
        let matcher = WildMatch::new(cand);
        matcher.matches(&norm) || matcher.matches(basename)
    })
}

/// All files below `root` in sorted depth-first order, skipping hidden directories.
pub async fn collect_files(root: &Path) -> Result<Vec<PathBuf>, AppError> {
    let mut files = Vec::new();
    let mut dirs_to_visit = vec![root.to_path_buf()];
    while let Some(current_dir) = dirs_to_visit.pop() {
        let mut read_dir = match fs::read_dir(&current_dir).await {
            Ok(rd) => rd,
            Err(e) => {
                warn!(dir = %current_dir.display(), error = %e, "Could not read directory");
                continue;
            }
        };
        let mut subdirs = Vec::new();
        let mut dir_files = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let file_type = match entry.file_type().await {
                Ok(t) => t,
                Err(_) => continue,
            };
            let name = entry.file_name().to_string_lossy().to_string();
            if file_type.is_dir() {
                if !name.starts_with('.') {
                    subdirs.push(entry.path());
                }
            } else {
                dir_files.push(entry.path());
            }
        }
        dir_files.sort();
        files.extend(dir_files);
        subdirs.sort();
        dirs_to_visit.extend(subdirs.into_iter().rev());
    }
    Ok(files)
}

fn looks_binary(path: &Path, bytes: &[u8]) -> Option<String> {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let top = mime.type_().as_str();
    if matches!(top, "image" | "audio" | "video") || mime.subtype() == "pdf" || mime.subtype() == "zip" {
        return Some(mime.to_string());
    }
    let sample = &bytes[..bytes.len().min(8192)];
    sample.contains(&0).then(|| "binary content".to_string())
}

/// Reads, writes and searches workspace files; every write is recorded for rollback.
#[derive(Debug)]
pub struct FilesystemManager {
    files_root: PathBuf,
    rollback: Arc<RollbackLog>,
    read_cache: StdMutex<HashMap<(PathBuf, usize, usize), (SystemTime, u64)>>,
    read_seq: StdMutex<u64>,
}

impl FilesystemManager {
    pub fn new(config: &Config, rollback: Arc<RollbackLog>) -> Self {
        Self {
            files_root: config.files_root.clone(),
            rollback,
            read_cache: StdMutex::new(HashMap::new()),
            read_seq: StdMutex::new(0),
        }
    }

    pub fn files_root(&self) -> &Path {
        &self.files_root
    }

    pub fn rollback_log(&self) -> &Arc<RollbackLog> {
        &self.rollback
    }

    pub fn resolve(&self, path_str: &str) -> Result<PathBuf, AppError> {
        resolve_path(path_str, &self.files_root)
    }

    pub fn display(&self, path: &Path) -> String {
        display_relative(path, &self.files_root)
    }

    /// Raw bytes of `path`, or `None` when it does not exist.
    pub async fn read_existing(&self, path: &Path) -> Result<Option<Vec<u8>>, AppError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Drops cached reads of `path` so the next read is served fresh.
    pub fn invalidate(&self, path: &Path) {
        if let Ok(mut cache) = self.read_cache.lock() {
            cache.retain(|(p, _, _), _| p != path);
        }
    }

    pub fn clear_read_cache(&self) {
        if let Ok(mut cache) = self.read_cache.lock() {
            cache.clear();
        }
    }

    fn check_duplicate(&self, key: &(PathBuf, usize, usize), mtime: SystemTime) -> bool {
        let Ok(mut cache) = self.read_cache.lock() else {
            return false;
        };
        if matches!(cache.get(key), Some((cached, _)) if *cached >= mtime) {
            return true;
        }
        let seq = self
            .read_seq
            .lock()
            .map(|mut s| {
                *s += 1;
                *s
            })
            .unwrap_or(0);
        cache.insert(key.clone(), (mtime, seq));
        if cache.len() > READ_CACHE_CAP {
            if let Some(oldest) = cache.iter().min_by_key(|(_, (_, seq))| *seq).map(|(k, _)| k.clone()) {
                cache.remove(&oldest);
            }
        }
        false
    }

    /// Line-numbered read of `[start_line, end_line]`, clamped to [`MAX_READ_WINDOW`] lines.
    #[instrument(skip(self), fields(path = %path_str))]
    pub async fn read_file(&self, path_str: &str, start_line: i64, end_line: i64) -> Result<ReadOutcome, AppError> {
        if start_line < 1 || end_line < start_line {
            return Err(AppError::InvalidInputArgument(format!(
                "Invalid range: {}-{}",
                start_line, end_line
            )));
        }
        let start = start_line as usize;
        let requested_end = end_line as usize;
        let (end, clamped_from) = if requested_end - start + 1 > MAX_READ_WINDOW {
            (start + MAX_READ_WINDOW - 1, Some(requested_end))
        } else {
            (requested_end, None)
        };

        let path = self.resolve(path_str)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|_| AppError::InvalidPath(format!("File not found: {}", path.display())))?;
        if metadata.is_dir() {
            return Err(AppError::InvalidPath(format!("{} is a directory", path.display())));
        }
        let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if self.check_duplicate(&(path.clone(), start, end), mtime) {
            debug!("Duplicate read skipped");
            return Ok(ReadOutcome::Duplicate { path, start_line: start, end_line: end });
        }

        let bytes = fs::read(&path).await?;
        if let Some(kind) = looks_binary(&path, &bytes) {
            self.invalidate(&path);
            return Err(AppError::InvalidInputArgument(format!(
                "{} is not a text file ({})",
                path.display(),
                kind
            )));
        }
        let text = String::from_utf8_lossy(&bytes);
        let all: Vec<&str> = text.lines().collect();
        let total_lines = all.len();
        let actual_end = end.min(total_lines);
        let width = actual_end.max(1).to_string().len();

        let mut content = if start <= actual_end {
            all[start - 1..actual_end]
                .iter()
                .enumerate()
                .map(|(i, line)| format!("{:>width$}: {}", start + i, line, width = width))
                .collect::<Vec<_>>()
                .join("\n")
        } else {
            String::new()
        };
        if content.chars().count() > MAX_READ_CHARS {
            content = content.chars().take(MAX_READ_CHARS).collect::<String>() + "\n... (truncated)";
        }

        Ok(ReadOutcome::Fresh(ReadRange {
            path,
            total_lines,
            start_line: start,
            end_line: actual_end,
            clamped_from,
            content,
        }))
    }

    /// Writes `after_text` over `path` and appends the rollback record. When the
    /// record cannot be appended the write is undone, so every change on disk stays undoable.
    pub async fn commit(
        &self,
        path: &Path,
        before: Option<Vec<u8>>,
        after_text: &str,
        meta: Value,
    ) -> Result<FileMutation, AppError> {
        let before_text = before
            .as_deref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default();
        let (added, deleted) = diff_counts(&before_text, after_text);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, after_text.as_bytes()).await?;
        self.invalidate(path);

        let created = before.is_none();
        if let Err(e) = self
            .rollback
            .append(path, before.as_deref().unwrap_or_default(), after_text.as_bytes(), !created, meta)
            .await
        {
            let restored = match &before {
                Some(bytes) => fs::write(path, bytes).await,
                None => fs::remove_file(path).await,
            };
            if let Err(restore_err) = restored {
                warn!(path = %path.display(), error = %restore_err, "Failed to undo write after rollback log failure");
            }
            return Err(e);
        }
        debug!(path = %path.display(), added, deleted, created, "File committed");
        Ok(FileMutation {
            path: path.to_path_buf(),
            added,
            deleted,
            created,
            replacements: None,
        })
    }

    #[instrument(skip(self, content), fields(path = %path_str))]
    pub async fn write_file(&self, path_str: &str, content: &str, overwrite: bool) -> Result<FileMutation, AppError> {
        let path = self.resolve(path_str)?;
        let before = self.read_existing(&path).await?;
        let final_content = match &before {
            Some(_) if !overwrite => {
                return Err(AppError::EditError(
                    "Refuse to overwrite existing file via write_file. Use edit_lines, or set <overwrite>true</overwrite> explicitly."
                        .to_string(),
                ))
            }
            Some(existing) => {
                let style = detect_line_ending(&String::from_utf8_lossy(existing));
                if style == LineEndingStyle::Unknown {
                    content.to_string()
                } else {
                    normalize_line_endings(content, style)
                }
            }
            None => content.to_string(),
        };
        self.commit(&path, before, &final_content, serde_json::json!({"type": "write_file"}))
            .await
    }

    /// Glob search over the workspace, capped at [`SEARCH_FILES_LIMIT`] results.
    #[instrument(skip(self))]
    pub async fn search_files(&self, pattern: &str) -> Result<SearchFilesResult, AppError> {
        let pattern = if pattern.trim().is_empty() { "*" } else { pattern.trim() };
        let mut matches = Vec::new();
        for file in collect_files(&self.files_root).await? {
            let rel = match file.strip_prefix(&self.files_root) {
                Ok(rel) => rel.to_string_lossy().to_string(),
                Err(_) => continue,
            };
            if matches_glob(&rel, pattern) {
                matches.push(file);
                if matches.len() >= SEARCH_FILES_LIMIT {
                    break;
                }
            }
        }
        let suggestions = if matches.is_empty() {
            self.suggest_similar(pattern).await
        } else {
            Vec::new()
        };
        Ok(SearchFilesResult {
            pattern: pattern.to_string(),
            matches,
            suggestions,
        })
    }

    /// Re-targets a pattern whose leading directory does not exist onto similarly named ones.
    async fn suggest_similar(&self, pattern: &str) -> Vec<String> {
        let norm = pattern.replace('\\', "/");
        let norm = norm.strip_prefix("./").unwrap_or(&norm);
        let Some((first, rest)) = norm.split_once('/') else {
            return Vec::new();
        };
        if first.is_empty() || first.contains(&['*', '?', '[', ']'][..]) {
            return Vec::new();
        }
        let Ok(mut read_dir) = fs::read_dir(&self.files_root).await else {
            return Vec::new();
        };
        let mut scored = Vec::new();
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir || name.starts_with('.') {
                continue;
            }
            let score = strsim::normalized_levenshtein(first, &name);
            if score >= SUGGESTION_CUTOFF {
                scored.push((score, name));
            }
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal).then(a.1.cmp(&b.1)));
        scored
            .into_iter()
            .take(5)
            .map(|(_, name)| format!("{}/{}", name, rest))
            .collect()
    }

    pub fn render_file_tree(&self, files: &[PathBuf]) -> String {
        let mut tree = PathTree::default();
        for file in files {
            let rel = file.strip_prefix(&self.files_root).unwrap_or(file);
            tree.insert(rel);
        }
        tree.render(&self.files_root.to_string_lossy())
    }
}
