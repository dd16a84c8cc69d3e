//! Conversation history: messages, the persistent summary entry, token
//! estimates and the windowing applied before each request.

use serde::{Deserialize, Serialize};

/// Prefix marking the one synthetic summary entry a history may hold.
pub const SUMMARY_SENTINEL: &str = "[Persistent summary]";
/// Entries left untouched at the tail when older history is summarised.
pub const KEEP_LAST_MESSAGES: usize = 10;

const WINDOW_CEILING_TOKENS: usize = 115_000;
const WINDOW_MIN_ENTRIES: usize = 60;
const WINDOW_HEAD: usize = 6;
const WINDOW_TAIL: usize = 54;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }

    pub fn summary(text: &str) -> Self {
        Self::system(format!("{}\n{}", SUMMARY_SENTINEL, text.trim()))
    }

    pub fn is_persistent_summary(&self) -> bool {
        self.role == Role::System && self.content.starts_with(SUMMARY_SENTINEL)
    }

    /// Body of a summary entry without its sentinel line.
    pub fn summary_text(&self) -> &str {
        match self.content.strip_prefix(SUMMARY_SENTINEL) {
            Some(rest) => rest.strip_prefix('\n').unwrap_or(rest).trim(),
            None => self.content.trim(),
        }
    }
}

/// Rough token count: one token per three characters, plus per-message overhead.
pub fn estimate_tokens<'a>(messages: impl IntoIterator<Item = &'a Message>) -> usize {
    let chars: usize = messages
        .into_iter()
        .map(|m| m.role.as_str().len() + m.content.chars().count() + 8)
        .sum();
    chars / 3
}

/// Full request list; very long, very large histories keep only their head and tail.
pub fn request_messages(system: &Message, history: &[Message]) -> Vec<Message> {
    let estimate = estimate_tokens(std::iter::once(system).chain(history.iter()));
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(system.clone());
    if estimate > WINDOW_CEILING_TOKENS && history.len() > WINDOW_MIN_ENTRIES {
        messages.extend_from_slice(&history[..WINDOW_HEAD]);
        messages.extend_from_slice(&history[history.len() - WINDOW_TAIL..]);
    } else {
        messages.extend_from_slice(history);
    }
    messages
}

pub fn format_for_summary(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("[{}]\n{}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Split of a history that has grown past the compaction threshold.
#[derive(Debug, Clone)]
pub struct CompactionPlan {
    pub existing_summary: Option<String>,
    pub to_summarize: Vec<Message>,
    pub keep: Vec<Message>,
}

impl CompactionPlan {
    /// Decides whether `history` needs compaction; `threshold == 0` disables it.
    pub fn for_history(system: &Message, history: &[Message], threshold: usize, keep_last: usize) -> Option<Self> {
        if threshold == 0 {
            return None;
        }
        if estimate_tokens(std::iter::once(system).chain(history.iter())) < threshold {
            return None;
        }
        let (existing_summary, rest) = match history.first() {
            Some(first) if first.is_persistent_summary() => (Some(first.summary_text().to_string()), &history[1..]),
            _ => (None, history),
        };
        if rest.len() <= keep_last {
            return None;
        }
        let split = rest.len() - keep_last;
        Some(Self {
            existing_summary: existing_summary.filter(|s| !s.is_empty()),
            to_summarize: rest[..split].to_vec(),
            keep: rest[split..].to_vec(),
        })
    }

    /// Text handed to the summariser: the previous summary, then the span to merge into it.
    pub fn summary_request(&self) -> String {
        let mut pieces = Vec::new();
        if let Some(existing) = &self.existing_summary {
            pieces.push(format!("Existing summary:\n{}", existing));
        }
        pieces.push(format!("New content to merge:\n{}", format_for_summary(&self.to_summarize)));
        pieces.join("\n\n")
    }

    pub fn apply(self, summary_text: &str) -> Vec<Message> {
        let mut history = Vec::with_capacity(self.keep.len() + 1);
        history.push(Message::summary(summary_text));
        history.extend(self.keep);
        history
    }
}
