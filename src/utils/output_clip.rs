/// Output budget for a command result handed back to the model.
pub const DEFAULT_MAX_RETURN_CHARS: usize = 2000;

/// Fixed head kept by [`clip_head_tail`] when no explicit head size is given.
pub const DEFAULT_HEAD_CHARS: usize = 300;

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn byte_offset_of_char(text: &str, char_idx: usize) -> usize {
    text.char_indices().nth(char_idx).map(|(i, _)| i).unwrap_or(text.len())
}

/// Keeps only the last `max_chars` characters, prefixed with a truncation marker.
pub fn clip_tail(text: &str, max_chars: usize, terminal_id: Option<&str>) -> String {
    let total = char_len(text);
    if total <= max_chars {
        return text.to_string();
    }
    let removed = total - max_chars;
    let tail = &text[byte_offset_of_char(text, removed)..];
    let hint = match terminal_id {
        Some(id) => format!(" (full output: `output {}`)", id),
        None => String::new(),
    };
    format!("[truncated, removed {} chars]{}\n{}", removed, hint, tail)
}

/// Keeps a small head and spends the rest of the budget on the tail.
pub fn clip_head_tail(text: &str, max_chars: usize, head_chars: usize) -> String {
    let total = char_len(text);
    if total <= max_chars {
        return text.to_string();
    }
    let head_chars = head_chars.min(max_chars);
    let tail_chars = max_chars - head_chars;
    let removed = total - max_chars;
    let head = &text[..byte_offset_of_char(text, head_chars)];
    let tail = &text[byte_offset_of_char(text, total - tail_chars)..];
    format!("{}\n[truncated, removed {} chars]\n{}", head, removed, tail)
}
