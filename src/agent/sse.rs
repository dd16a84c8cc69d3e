use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token accounting reported in the final chunk of a streamed completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub prompt_cache_hit_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatStreamEvent {
    Reasoning(String),
    Content(String),
    Usage(Usage),
}

/// Incremental parser for chat-completion SSE streams.
#[derive(Debug, Default)]
pub struct SseStreamParser {
    buffer: Vec<u8>,
}

impl SseStreamParser {
    /// Feeds raw body bytes and drains every complete event.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ChatStreamEvent> {
        self.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));
        let mut events = Vec::new();

        while let Some(split) = find_frame_end(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..split + 2).collect();
            let frame = String::from_utf8_lossy(&frame[..split]);
            if let Some(payload) = extract_data_payload(&frame) {
                events.extend(map_chunk(&payload));
            }
        }
        events
    }

    /// Parses whatever is left once the body has ended without a trailing blank line.
    pub fn finish(&mut self) -> Vec<ChatStreamEvent> {
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            self.buffer.clear();
            return Vec::new();
        }
        self.buffer.extend_from_slice(b"\n\n");
        self.feed(&[])
    }

    pub fn is_empty_buffer(&self) -> bool {
        self.buffer.iter().all(u8::is_ascii_whitespace)
    }
}

fn find_frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

fn extract_data_payload(frame: &str) -> Option<String> {
    let data_lines: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .collect();
    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

fn map_chunk(payload: &str) -> Vec<ChatStreamEvent> {
    if payload == "[DONE]" {
        return Vec::new();
    }
    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        return Vec::new();
    };

    let mut events = Vec::new();
    if let Some(delta) = value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|choice| choice.get("delta"))
    {
        let text_of = |key: &str| {
            delta
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
        };
        if let Some(reasoning) = text_of("reasoning_content") {
            events.push(ChatStreamEvent::Reasoning(reasoning));
        }
        if let Some(content) = text_of("content") {
            events.push(ChatStreamEvent::Content(content));
        }
    }
    if let Some(usage) = value
        .get("usage")
        .filter(|u| u.is_object())
        .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok())
    {
        events.push(ChatStreamEvent::Usage(usage));
    }
    events
}
