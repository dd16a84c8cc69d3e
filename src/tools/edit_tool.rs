use crate::error::AppError;
use crate::tools::filesystem_tool::{FileMutation, FilesystemManager};
use crate::utils::line_ending_handler::{detect_line_ending, normalize_line_endings, to_lf};
use regex::RegexBuilder;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Line-indexed edit; every line number refers to the file before the edit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineEdit {
    pub delete_start: Option<i64>,
    pub delete_end: Option<i64>,
    pub insert_at: Option<i64>,
    pub auto_indent: bool,
    pub content: String,
}

fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

fn leading_ws(line: &str) -> &str {
    let end = line.len() - line.trim_start_matches(&[' ', '\t'][..]).len();
    &line[..end]
}

/// Strips the block's common indentation and prefixes each non-blank line with `indent`.
pub fn reindent_block(block: &[String], indent: &str) -> Vec<String> {
    let min_ws = block
        .iter()
        .filter(|l| !is_blank(l))
        .map(|l| leading_ws(l).len())
        .min()
        .unwrap_or(0);
    block
        .iter()
        .map(|line| {
            if is_blank(line) {
                String::new()
            } else {
                format!("{}{}", indent, &line[min_ws..])
            }
        })
        .collect()
}

/// Indentation of the nearest non-blank original line at or above index `idx`
/// (the insertion point itself first), searching downwards when everything above is blank.
fn indent_near(original: &[String], idx: usize) -> String {
    if original.is_empty() {
        return String::new();
    }
    let start = idx.min(original.len() - 1);
    original[..=start]
        .iter()
        .rev()
        .chain(original[start..].iter())
        .find(|l| !is_blank(l))
        .map(|l| leading_ws(l).to_string())
        .unwrap_or_default()
}

/// Applies `edit` to `original` and returns the new line list.
///
/// Deletion removes the inclusive range clamped to the file. The insertion
/// point is shifted left past a deleted range before it, clamped to the start
/// of a deleted range it falls into, and used unchanged when it precedes the
/// deletion. Content without an insertion point replaces the deleted range,
/// or is appended when nothing is deleted either.
pub fn apply_line_edit(original: &[String], edit: &LineEdit) -> Vec<String> {
    let total = original.len();
    let (ds, de) = match edit.delete_start {
        Some(start) if total > 0 => {
            let start = start.max(1) as usize;
            let end = edit.delete_end.map(|e| e.max(1) as usize).unwrap_or(start).max(start);
            (start.min(total), end.min(total))
        }
        _ => (0, 0),
    };

    let mut lines = original.to_vec();
    if ds > 0 {
        lines.drain(ds - 1..de);
    }
    if edit.content.is_empty() {
        return lines;
    }

    let (index, indent_idx) = match edit.insert_at {
        Some(at) => {
            let at = at.max(1) as usize;
            let index = if ds > 0 && at > de {
                at - 1 - (de - ds + 1)
            } else if ds > 0 && at >= ds {
                ds - 1
            } else {
                at - 1
            };
            (index.min(lines.len()), at - 1)
        }
        None if ds > 0 => (ds - 1, ds - 1),
        None => (lines.len(), total.saturating_sub(1)),
    };

    let mut block: Vec<String> = to_lf(&edit.content).lines().map(str::to_string).collect();
    if edit.auto_indent {
        block = reindent_block(&block, &indent_near(original, indent_idx));
    }
    lines.splice(index..index, block);
    lines
}

fn join_like(original_text: &str, lines: &[String]) -> String {
    let mut out = lines.join("\n");
    let had_trailing = original_text.ends_with('\n') || original_text.ends_with('\r');
    if !out.is_empty() && (had_trailing || original_text.is_empty()) {
        out.push('\n');
    }
    normalize_line_endings(&out, detect_line_ending(original_text))
}

/// Text-level `edit_lines`: returns the new file content for `before`.
pub fn edit_lines_text(before: &str, edit: &LineEdit) -> String {
    let original: Vec<String> = to_lf(before).lines().map(str::to_string).collect();
    join_like(before, &apply_line_edit(&original, edit))
}

/// (added, deleted) line counts between two versions.
pub fn diff_counts(before: &str, after: &str) -> (usize, usize) {
    let mut added = 0;
    let mut deleted = 0;
    // diff::lines yields a phantom empty line after a trailing newline.
    let before: Vec<&str> = before.lines().collect();
    let after: Vec<&str> = after.lines().collect();
    for change in diff::slice(&before, &after) {
        match change {
            diff::Result::Left(_) => deleted += 1,
            diff::Result::Right(_) => added += 1,
            diff::Result::Both(_, _) => {}
        }
    }
    (added, deleted)
}

/// Replaces up to `count` literal occurrences, scanning forward from each replacement.
pub fn replace_literal(content: &str, search: &str, replace: &str, count: usize, auto_indent: bool) -> (String, usize) {
    if search.is_empty() {
        return (content.to_string(), 0);
    }
    let mut out = String::with_capacity(content.len());
    let mut cursor = 0;
    let mut replaced = 0;
    while replaced < count {
        let Some(rel) = content[cursor..].find(search) else {
            break;
        };
        let idx = cursor + rel;
        out.push_str(&content[cursor..idx]);

        if auto_indent {
            let line_start = content[..idx].rfind('\n').map(|p| p + 1).unwrap_or(0);
            let indent = leading_ws(&content[line_start..]);
            let block: Vec<String> = replace.lines().map(str::to_string).collect();
            let mut lines = reindent_block(&block, indent);
            if idx > line_start {
                if let Some(first) = lines.first_mut() {
                    *first = first.trim_start_matches(&[' ', '\t'][..]).to_string();
                }
            }
            out.push_str(&lines.join("\n"));
        } else {
            out.push_str(replace);
        }
        cursor = idx + search.len();
        replaced += 1;
    }
    out.push_str(&content[cursor..]);
    (out, replaced)
}

/// Multi-line regex replacement; `$1`-style group references are expanded.
pub fn replace_regex(content: &str, pattern: &str, replace: &str, count: usize) -> Result<(String, usize), AppError> {
    let re = RegexBuilder::new(pattern)
        .multi_line(true)
        .build()
        .map_err(|e| AppError::EditError(format!("Invalid regex: {}", e)))?;
    let replaced = re.find_iter(content).take(count).count();
    Ok((re.replacen(content, count, replace).into_owned(), replaced))
}

/// Applies line edits and replacements to files, recording each for rollback.
#[derive(Debug)]
pub struct EditEngine {
    filesystem: Arc<FilesystemManager>,
}

impl EditEngine {
    pub fn new(filesystem: Arc<FilesystemManager>) -> Self {
        Self { filesystem }
    }

    #[instrument(skip(self, edit), fields(path = %path_str))]
    pub async fn edit_lines(&self, path_str: &str, edit: &LineEdit) -> Result<FileMutation, AppError> {
        let path = self.filesystem.resolve(path_str)?;
        let before = self.filesystem.read_existing(&path).await?;
        let before_text = before
            .as_deref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default();
        let after_text = edit_lines_text(&before_text, edit);
        debug!(delete_start = ?edit.delete_start, delete_end = ?edit.delete_end, insert_at = ?edit.insert_at, "Applying line edit");

        let meta = json!({
            "type": "edit_lines",
            "delete_start": edit.delete_start,
            "delete_end": edit.delete_end,
            "insert_at": edit.insert_at,
        });
        self.filesystem.commit(&path, before, &after_text, meta).await
    }

    #[instrument(skip(self, search, replace), fields(path = %path_str))]
    pub async fn replace_in_file(
        &self,
        path_str: &str,
        search: &str,
        replace: &str,
        count: i64,
        regex: bool,
        auto_indent: bool,
    ) -> Result<FileMutation, AppError> {
        let count = if count <= 0 { 1 } else { count as usize };
        if regex && auto_indent {
            return Err(AppError::EditError(
                "replace_in_file with regex does not support auto_indent".to_string(),
            ));
        }
        let path = self.filesystem.resolve(path_str)?;
        let before = self
            .filesystem
            .read_existing(&path)
            .await?
            .ok_or_else(|| AppError::InvalidPath(format!("File not found: {}", path.display())))?;
        let before_text = String::from_utf8_lossy(&before).into_owned();
        let style = detect_line_ending(&before_text);
        let working = to_lf(&before_text);

        let (after_lf, replaced) = if regex {
            replace_regex(&working, search, replace, count)?
        } else {
            replace_literal(&working, &to_lf(search), &to_lf(replace), count, auto_indent)
        };
        if replaced == 0 || after_lf == working {
            return Err(AppError::EditError(
                "replace_in_file did not find any match to replace".to_string(),
            ));
        }
        let after_text = normalize_line_endings(&after_lf, style);

        let meta = json!({
            "type": "replace_in_file",
            "count": count,
            "regex": regex,
            "auto_indent": auto_indent,
            "replaced": replaced,
        });
        let mut mutation = self.filesystem.commit(&path, Some(before), &after_text, meta).await?;
        mutation.replacements = Some(replaced);
        Ok(mutation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::utils::rollback_log::RollbackLog;
    use tempfile::TempDir;

    fn numbered(prefix: &str, n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    #[test]
    fn insert_after_deleted_range_shifts_left() {
        let edit = LineEdit {
            delete_start: Some(3),
            delete_end: Some(4),
            insert_at: Some(6),
            content: "X\nY".into(),
            ..Default::default()
        };
        let out = apply_line_edit(&numbered("A", 10), &edit);
        assert_eq!(out, vec!["A1", "A2", "A5", "X", "Y", "A6", "A7", "A8", "A9", "A10"]);
    }

    #[test]
    fn insert_inside_deleted_range_clamps_to_its_start() {
        let edit = LineEdit {
            delete_start: Some(3),
            delete_end: Some(5),
            insert_at: Some(4),
            content: "X".into(),
            ..Default::default()
        };
        let out = apply_line_edit(&numbered("A", 7), &edit);
        assert_eq!(out, vec!["A1", "A2", "X", "A6", "A7"]);
    }

    #[test]
    fn insert_before_deleted_range_is_unchanged() {
        let edit = LineEdit {
            delete_start: Some(4),
            delete_end: Some(5),
            insert_at: Some(2),
            content: "X".into(),
            ..Default::default()
        };
        let out = apply_line_edit(&numbered("A", 6), &edit);
        assert_eq!(out, vec!["A1", "X", "A2", "A3", "A6"]);
    }

    #[test]
    fn delete_range_is_clamped_to_file() {
        let edit = LineEdit {
            delete_start: Some(2),
            delete_end: Some(99),
            ..Default::default()
        };
        assert_eq!(apply_line_edit(&numbered("A", 3), &edit), vec!["A1"]);
    }

    #[test]
    fn content_without_insert_point_replaces_deleted_range() {
        let edit = LineEdit {
            delete_start: Some(2),
            delete_end: Some(2),
            content: "B".into(),
            ..Default::default()
        };
        assert_eq!(apply_line_edit(&numbered("A", 3), &edit), vec!["A1", "B", "A3"]);
    }

    #[test]
    fn auto_indent_skips_blank_insertion_line_upwards() {
        let original: Vec<String> = vec!["fn main() {".into(), "    let a = 1;".into(), "".into(), "}".into()];
        let edit = LineEdit {
            insert_at: Some(3),
            auto_indent: true,
            content: "        let b = 2;\n\n          nested();".into(),
            ..Default::default()
        };
        let out = apply_line_edit(&original, &edit);
        assert_eq!(
            out,
            vec!["fn main() {", "    let a = 1;", "    let b = 2;", "", "      nested();", "", "}"]
        );
    }

    #[test]
    fn auto_indent_follows_the_line_at_the_insertion_point() {
        let original: Vec<String> = vec!["if x:".into(), "    a()".into()];
        let edit = LineEdit {
            insert_at: Some(2),
            auto_indent: true,
            content: "b()".into(),
            ..Default::default()
        };
        assert_eq!(apply_line_edit(&original, &edit), vec!["if x:", "    b()", "    a()"]);

        let replace = LineEdit {
            delete_start: Some(2),
            delete_end: Some(2),
            auto_indent: true,
            content: "c()".into(),
            ..Default::default()
        };
        assert_eq!(apply_line_edit(&original, &replace), vec!["if x:", "    c()"]);
    }

    #[test]
    fn text_edit_keeps_crlf_and_trailing_newline() {
        let after = edit_lines_text(
            "a\r\nb\r\n",
            &LineEdit {
                insert_at: Some(2),
                content: "x".into(),
                ..Default::default()
            },
        );
        assert_eq!(after, "a\r\nx\r\nb\r\n");
    }

    #[test]
    fn diff_counts_lines() {
        assert_eq!(diff_counts("a\nb\nc\n", "a\nB\nc\nd\n"), (2, 1));
        assert_eq!(diff_counts("", "x\ny\n"), (2, 0));
        assert_eq!(diff_counts("x\n", "x\ny\n"), (1, 0));
        assert_eq!(diff_counts("x\ny\n", ""), (0, 2));
    }

    #[test]
    fn literal_replace_respects_count_and_indent() {
        let (out, n) = replace_literal("x = 1\nx = 1\nx = 1\n", "x = 1", "x = 2", 2, false);
        assert_eq!(n, 2);
        assert_eq!(out, "x = 2\nx = 2\nx = 1\n");

        let (out, n) = replace_literal("    old()\n", "old()", "new()\nmore()", 1, true);
        assert_eq!(n, 1);
        assert_eq!(out, "    new()\n    more()\n");
    }

    #[test]
    fn regex_replace_is_multiline() {
        let (out, n) = replace_regex("a1\nb2\na3\n", r"^a(\d)$", "z$1", 5).unwrap();
        assert_eq!(n, 2);
        assert_eq!(out, "z1\nb2\nz3\n");
        assert!(replace_regex("x", "(", "", 1).is_err());
    }

    fn engine(dir: &TempDir) -> (EditEngine, Arc<RollbackLog>) {
        let config = Config::for_root(dir.path());
        let rollback = Arc::new(RollbackLog::new(config.edit_history_file()));
        let fs = Arc::new(FilesystemManager::new(&config, rollback.clone()));
        (EditEngine::new(fs), rollback)
    }

    #[tokio::test]
    async fn edit_then_rollback_restores_original() {
        let dir = TempDir::new().unwrap();
        let (engine, rollback) = engine(&dir);
        let file = dir.path().join("f.txt");
        std::fs::write(&file, "one\ntwo\nthree\n").unwrap();

        let mutation = engine
            .edit_lines(
                "f.txt",
                &LineEdit {
                    delete_start: Some(2),
                    delete_end: Some(2),
                    content: "TWO".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!((mutation.added, mutation.deleted), (1, 1));
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "one\nTWO\nthree\n");

        rollback.rollback_last_edit().await.unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "one\ntwo\nthree\n");
    }

    #[tokio::test]
    async fn replace_without_match_fails_and_leaves_no_record() {
        let dir = TempDir::new().unwrap();
        let (engine, rollback) = engine(&dir);
        std::fs::write(dir.path().join("f.txt"), "abc\n").unwrap();

        let err = engine
            .replace_in_file("f.txt", "zzz", "y", 1, false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::EditError(_)));
        assert!(rollback.is_empty().await.unwrap());

        let err = engine.replace_in_file("f.txt", "a", "b", 1, true, true).await.unwrap_err();
        assert!(err.to_string().contains("does not support auto_indent"));
    }
}
