//! Tolerant scanner for the tag protocol spoken by the model.
//!
//! Not an XML parser: content blocks carry raw source code
//! with unescaped angle brackets, so closing tags are located by literal search
//! only. Unclosed or incomplete tags are skipped without aborting the scan.

use super::types::{Command, ExternalKind, COMMAND_TAGS};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Finds `needle` at or after `from`, exact case first, then ASCII case-insensitively.
///
/// `lower` must be `source.to_ascii_lowercase()`, which keeps byte offsets aligned.
fn find_from(source: &str, lower: &str, needle: &str, from: usize) -> Option<usize> {
    if from > source.len() {
        return None;
    }
    source[from..]
        .find(needle)
        .or_else(|| lower[from..].find(needle))
        .map(|i| i + from)
}

/// Returns the `(inner_start, inner_end)` span of the first `<tag>…</tag>` in `source`.
fn find_tag_span(source: &str, tag: &str) -> Option<(usize, usize)> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);

    if let Some(si) = source.find(&open) {
        if let Some(ei) = source[si + open.len()..].find(&close) {
            return Some((si + open.len(), si + open.len() + ei));
        }
    }

    let lower = source.to_ascii_lowercase();
    let si = lower.find(&open)?;
    let ei = lower[si + open.len()..].find(&close)?;
    Some((si + open.len(), si + open.len() + ei))
}

/// Removes the common leading whitespace of all non-blank lines.
/// Whitespace-only lines become empty.
pub fn dedent(text: &str) -> String {
    let mut margin: Option<&str> = None;
    for line in text.split('\n') {
        if line.trim().is_empty() {
            continue;
        }
        let indent_len = line.len() - line.trim_start_matches([' ', '\t']).len();
        let indent = &line[..indent_len];
        margin = Some(match margin {
            None => indent,
            Some(current) => {
                let common = current
                    .bytes()
                    .zip(indent.bytes())
                    .take_while(|(a, b)| a == b)
                    .count();
                &current[..common]
            }
        });
    }
    let margin = margin.unwrap_or("");

    text.split('\n')
        .map(|line| {
            if line.trim().is_empty() {
                ""
            } else {
                line.strip_prefix(margin).unwrap_or(line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn normalize_block_text(raw: &str) -> String {
    let raw = raw
        .strip_prefix("\r\n")
        .or_else(|| raw.strip_prefix('\n'))
        .unwrap_or(raw);
    let raw = raw
        .strip_suffix("\r\n")
        .or_else(|| raw.strip_suffix('\n'))
        .unwrap_or(raw);
    dedent(raw)
}

/// Field value with surrounding whitespace trimmed, or `""` when absent.
fn field(source: &str, name: &str) -> String {
    match find_tag_span(source, name) {
        Some((start, end)) => source[start..end].trim().to_string(),
        None => String::new(),
    }
}

/// Multi-line field value keeping relative indentation.
fn block_field(source: &str, name: &str) -> String {
    match find_tag_span(source, name) {
        Some((start, end)) => normalize_block_text(&source[start..end]),
        None => String::new(),
    }
}

fn int_field(source: &str, name: &str) -> Option<i64> {
    let raw = field(source, name);
    if raw.is_empty() {
        return None;
    }
    raw.parse::<i64>().ok()
}

fn bool_field(source: &str, name: &str) -> bool {
    matches!(
        field(source, name).to_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Builds the command for `tag` from its inner text, or `None` when validation fails.
fn build_command(tag: &str, inner: &str) -> Option<Command> {
    let command = match tag {
        "search_files" => Command::SearchFiles {
            pattern: non_empty(field(inner, "pattern")).unwrap_or_else(|| "*".to_string()),
        },
        "search_in_files" => Command::SearchInFiles {
            regex: non_empty(field(inner, "regex"))?,
            glob: non_empty(field(inner, "glob")).unwrap_or_else(|| "**/*".to_string()),
            root: non_empty(field(inner, "root")).unwrap_or_else(|| ".".to_string()),
            max_matches: int_field(inner, "max_matches")
                .filter(|n| *n > 0)
                .map(|n| n as usize)
                .unwrap_or(200),
        },
        "read_file" => Command::ReadFile {
            path: non_empty(field(inner, "path"))?,
            start_line: int_field(inner, "start_line")?,
            end_line: int_field(inner, "end_line")?,
        },
        "write_file" => Command::WriteFile {
            path: non_empty(field(inner, "path"))?,
            content: non_empty(block_field(inner, "content"))?,
            overwrite: bool_field(inner, "overwrite"),
        },
        "edit_lines" => {
            let path = non_empty(field(inner, "path"))?;
            let delete_start = int_field(inner, "delete_start");
            let insert_at = int_field(inner, "insert_at");
            let content = block_field(inner, "content");
            if delete_start.is_none() && insert_at.is_none() && content.is_empty() {
                return None;
            }
            Command::EditLines {
                path,
                delete_start,
                delete_end: int_field(inner, "delete_end"),
                insert_at,
                auto_indent: bool_field(inner, "auto_indent"),
                content,
            }
        }
        "replace_in_file" => Command::ReplaceInFile {
            path: non_empty(field(inner, "path"))?,
            search: non_empty(block_field(inner, "search"))?,
            replace: block_field(inner, "replace"),
            count: int_field(inner, "count").unwrap_or(1),
            regex: bool_field(inner, "regex"),
            auto_indent: bool_field(inner, "auto_indent"),
        },
        "run_command" => {
            let command = non_empty(field(inner, "command")).unwrap_or_else(|| inner.trim().to_string());
            Command::RunCommand {
                command: non_empty(command)?,
                is_long_running: bool_field(inner, "is_long_running"),
                cwd: non_empty(field(inner, "cwd")),
            }
        }
        "task_add" => Command::TaskAdd {
            id: non_empty(field(inner, "id")),
            content: non_empty(block_field(inner, "content"))
                .or_else(|| non_empty(field(inner, "title")))?,
            status: non_empty(field(inner, "status")),
            progress: int_field(inner, "progress"),
        },
        "task_update" => {
            let id = non_empty(field(inner, "id"))?;
            let content =
                non_empty(block_field(inner, "content")).or_else(|| non_empty(field(inner, "title")));
            let status = non_empty(field(inner, "status"));
            let progress = int_field(inner, "progress");
            if content.is_none() && status.is_none() && progress.is_none() {
                return None;
            }
            Command::TaskUpdate { id, content, status, progress }
        }
        "task_delete" => Command::TaskDelete {
            id: non_empty(field(inner, "id"))?,
        },
        "task_list" => Command::TaskList,
        "task_clear" => Command::TaskClear,
        other => {
            let kind = ExternalKind::from_tag(other)?;
            let (required, optional) = kind.fields();
            let mut args = BTreeMap::new();
            args.insert(required.to_string(), non_empty(field(inner, required))?);
            for name in optional {
                if let Some(value) = non_empty(field(inner, name)) {
                    args.insert(name.to_string(), value);
                }
            }
            Command::External { kind, args }
        }
    };
    Some(command)
}

/// Extracts every well-formed command from one model turn, in textual order.
///
/// Structurally identical commands are kept only once.
pub fn parse_commands(text: &str) -> Vec<Command> {
    let lower = text.to_ascii_lowercase();
    let mut commands: Vec<Command> = Vec::new();
    let mut idx = 0;

    while idx < text.len() {
        let mut next: Option<(usize, &str)> = None;
        for tag in COMMAND_TAGS {
            let open = format!("<{}>", tag);
            if let Some(pos) = find_from(text, &lower, &open, idx) {
                if next.map_or(true, |(best, _)| pos < best) {
                    next = Some((pos, tag));
                }
            }
        }
        let Some((start, tag)) = next else {
            break;
        };

        let open_len = tag.len() + 2;
        let close = format!("</{}>", tag);
        let Some(end) = find_from(text, &lower, &close, start + open_len) else {
            trace!(tag, at = start, "Unclosed tag skipped");
            idx = start + open_len;
            continue;
        };

        let inner = text[start + open_len..end].trim();
        match build_command(tag, inner) {
            Some(command) => {
                if !commands.contains(&command) {
                    commands.push(command);
                } else {
                    debug!(tag, "Duplicate command dropped");
                }
            }
            None => debug!(tag, "Command missing required fields dropped"),
        }
        idx = end + close.len();
    }

    commands
}

/// Whether the text mentions protocol tags even though nothing parsed.
pub fn contains_tag_fragments(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    COMMAND_TAGS
        .iter()
        .any(|tag| lower.contains(&format!("<{}", tag)) || lower.contains(&format!("</{}", tag)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_without_tags_yields_nothing() {
        assert!(parse_commands("Sure, here is how you would do it in prose.").is_empty());
        assert!(parse_commands("").is_empty());
    }

    #[test]
    fn run_command_with_sub_tag() {
        let cmds = parse_commands("<run_command><command>cargo build</command></run_command>");
        assert_eq!(
            cmds,
            vec![Command::RunCommand {
                command: "cargo build".into(),
                is_long_running: false,
                cwd: None,
            }]
        );
    }

    #[test]
    fn run_command_falls_back_to_raw_inner_text() {
        let cmds = parse_commands("<run_command>  ls -la  </run_command>");
        assert_eq!(cmds.len(), 1);
        assert!(matches!(&cmds[0], Command::RunCommand { command, .. } if command == "ls -la"));
    }

    #[test]
    fn unclosed_inner_field_drops_whole_tag() {
        assert!(parse_commands("<task_add><content>a</task_add>").is_empty());
    }

    #[test]
    fn unclosed_outer_tag_does_not_abort_the_scan() {
        let text = "<write_file><path>a.txt</path> oops\n<task_list></task_list>";
        assert_eq!(parse_commands(text), vec![Command::TaskList]);
    }

    #[test]
    fn preserves_textual_order_across_kinds() {
        let text = "first <task_list></task_list> then \
                    <read_file><path>src/lib.rs</path><start_line>1</start_line><end_line>20</end_line></read_file> \
                    and <task_clear></task_clear>";
        let kinds: Vec<_> = parse_commands(text).iter().map(|c| c.kind()).collect();
        assert_eq!(kinds, vec!["task_list", "read_file", "task_clear"]);
    }

    #[test]
    fn read_file_without_range_is_dropped() {
        assert!(parse_commands("<read_file><path>a.rs</path><start_line>1</start_line></read_file>").is_empty());
        assert!(parse_commands("<read_file><path>a.rs</path></read_file>").is_empty());
    }

    #[test]
    fn write_file_requires_path_and_content() {
        assert!(parse_commands("<write_file><path>a.txt</path><content></content></write_file>").is_empty());
        assert!(parse_commands("<write_file><content>x</content></write_file>").is_empty());
    }

    #[test]
    fn content_keeps_relative_indentation_and_angle_brackets() {
        let text = "<write_file>\n  <path>main.rs</path>\n  <content>\n    fn main() {\n        if a < b && c > d {}\n    }\n  </content>\n</write_file>";
        let cmds = parse_commands(text);
        assert_eq!(cmds.len(), 1);
        match &cmds[0] {
            Command::WriteFile { content, .. } => {
                assert_eq!(content, "fn main() {\n    if a < b && c > d {}\n}\n");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn tags_match_case_insensitively() {
        let cmds = parse_commands("<RUN_COMMAND><Command>pwd</Command></RUN_COMMAND>");
        assert_eq!(cmds.len(), 1);
        assert!(matches!(&cmds[0], Command::RunCommand { command, .. } if command == "pwd"));
    }

    #[test]
    fn edit_lines_requires_some_operation() {
        assert!(parse_commands("<edit_lines><path>a.py</path></edit_lines>").is_empty());
        let cmds = parse_commands(
            "<edit_lines><path>a.py</path><delete_start>3</delete_start><delete_end>4</delete_end><auto_indent>true</auto_indent></edit_lines>",
        );
        assert_eq!(
            cmds,
            vec![Command::EditLines {
                path: "a.py".into(),
                delete_start: Some(3),
                delete_end: Some(4),
                insert_at: None,
                auto_indent: true,
                content: String::new(),
            }]
        );
    }

    #[test]
    fn task_add_uses_title_fallback() {
        let cmds = parse_commands("<task_add><title>Write tests</title></task_add>");
        assert!(matches!(&cmds[0], Command::TaskAdd { content, .. } if content == "Write tests"));
    }

    #[test]
    fn task_update_needs_id_and_a_change() {
        assert!(parse_commands("<task_update><status>done</status></task_update>").is_empty());
        assert!(parse_commands("<task_update><id>T1</id></task_update>").is_empty());
        let cmds = parse_commands("<task_update><id>T1</id><progress>50</progress></task_update>");
        assert_eq!(cmds.len(), 1);
    }

    #[test]
    fn identical_commands_are_deduplicated() {
        let text = "<task_list></task_list><run_command>ls</run_command><task_list></task_list><run_command>ls</run_command>";
        assert_eq!(parse_commands(text).len(), 2);
    }

    #[test]
    fn external_kinds_need_their_key_field() {
        assert!(parse_commands("<web_search></web_search>").is_empty());
        let cmds = parse_commands("<web_search><query>rust tracing</query></web_search>");
        assert_eq!(cmds[0].kind(), "web_search");
    }

    #[test]
    fn search_in_files_defaults() {
        let cmds = parse_commands("<search_in_files><regex>fn main</regex></search_in_files>");
        assert_eq!(
            cmds,
            vec![Command::SearchInFiles {
                regex: "fn main".into(),
                glob: "**/*".into(),
                root: ".".into(),
                max_matches: 200,
            }]
        );
    }

    #[test]
    fn detects_fragments_of_malformed_tags() {
        assert!(contains_tag_fragments("I will <read_file path=\"x\"/>"));
        assert!(contains_tag_fragments("done </Edit_Lines>"));
        assert!(!contains_tag_fragments("plain answer with <b>html</b>"));
    }

    #[test]
    fn dedent_ignores_blank_lines_for_margin() {
        assert_eq!(dedent("    a\n\n      b\n    c"), "a\n\n  b\nc");
        assert_eq!(dedent("\ta\n  b"), "\ta\n  b");
    }
}
