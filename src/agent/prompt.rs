use crate::tools::task_tool::TaskManager;
use std::path::Path;

/// System message describing the tag protocol. Kept static so it stays cacheable upstream.
pub fn system_prompt() -> String {
    r#"# TERMINAL AGENT
## RULES
1. Explore the project before assuming anything about it.
2. You PROPOSE actions; the user approves them before they run.
3. Prefer searching file contents over guessing file locations.
4. You may emit several closed tags in one reply; they run in order.
5. If a tool finds nothing, retry with other patterns or paths instead of inventing results.
6. If no action is needed, answer in plain language and emit no tags.
7. Do only what the user asked, then answer briefly.
8. Existing files are changed with edit_lines or replace_in_file, not rewritten.

## CONTEXT
The current directory, top-level entries and task list arrive with each user message.

## TOOL TAGS (closed tags only)
- Search files by glob:
  <search_files><pattern>**/*.rs</pattern></search_files>
- Search file contents:
  <search_in_files><regex>...</regex><glob>**/*.rs</glob><root>.</root><max_matches>200</max_matches></search_in_files>
- Read a line range (both bounds required, at most 160 lines; repeated reads may be skipped):
  <read_file><path>...</path><start_line>1</start_line><end_line>160</end_line></read_file>
- Create a file (set overwrite to true to replace an existing one):
  <write_file><path>...</path><content>...</content><overwrite>false</overwrite></write_file>
- Edit lines (all numbers refer to the original file; offsets are handled for you):
  <edit_lines><path>...</path><delete_start>10</delete_start><delete_end>20</delete_end><insert_at>10</insert_at><auto_indent>true</auto_indent><content>...</content></edit_lines>
- Search and replace:
  <replace_in_file><path>...</path><search>...</search><replace>...</replace><count>1</count><regex>false</regex><auto_indent>false</auto_indent></replace_in_file>
- Run a shell command (each line runs separately; long-running ones continue in the background):
  <run_command><command>...</command><is_long_running>false</is_long_running><cwd>.</cwd></run_command>
- Task list:
  <task_add><content>...</content><status>pending</status></task_add>
  <task_update><id>T1</id><status>in_progress</status><progress>50</progress></task_update>
  <task_list></task_list> <task_delete><id>T1</id></task_delete> <task_clear></task_clear>
- Web and OCR (only when a handler is installed):
  <web_search><query>...</query></web_search> <visit_page><url>...</url></visit_page>
  <ocr_image><path>...</path></ocr_image> <ocr_document><path>...</path><start_page>1</start_page></ocr_document>
"#
    .to_string()
}

fn top_level_entries(root: &Path) -> (Vec<String>, Vec<String>) {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    if let Ok(entries) = std::fs::read_dir(root) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            match entry.file_type() {
                Ok(t) if t.is_dir() => dirs.push(name),
                Ok(t) if t.is_file() => files.push(name),
                _ => {}
            }
        }
    }
    dirs.sort();
    files.sort();
    (dirs, files)
}

/// Wraps the user's input with the working directory and current task list.
pub fn user_context(input: &str, root: &Path, tasks: &TaskManager) -> String {
    let (dirs, files) = top_level_entries(root);
    let mut context = format!(
        "Current Directory: {}\nTop-level Dirs: [{}]\nTop-level Files: [{}]",
        root.display(),
        dirs.join(", "),
        files.join(", ")
    );
    if !tasks.tasks().is_empty() {
        context.push_str("\n\n## CURRENT TASKS\n");
        context.push_str(&tasks.render());
    }
    context.push_str("\n\n## USER INPUT\n");
    context.push_str(input);
    context.push('\n');
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn system_prompt_documents_every_core_tag() {
        let prompt = system_prompt();
        for tag in ["search_files", "read_file", "edit_lines", "run_command", "task_clear"] {
            assert!(prompt.contains(&format!("<{}>", tag)), "missing {}", tag);
        }
    }

    #[test]
    fn user_context_lists_entries_and_tasks() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "").unwrap();
        let mut tasks = TaskManager::new();
        tasks.add(None, "fix bug", None, None).unwrap();

        let context = user_context("please fix", dir.path(), &tasks);
        assert!(context.contains("Top-level Dirs: [src]"));
        assert!(context.contains("Top-level Files: [Cargo.toml]"));
        assert!(context.contains("- (T1) [pending 0%] fix bug"));
        assert!(context.ends_with("## USER INPUT\nplease fix\n"));
    }
}
