use crate::agent::history::{Message, Role};
use crate::agent::interrupt::{await_or_interrupt, InterruptHandle};
use crate::agent::sse::{ChatStreamEvent, SseStreamParser, Usage};
use crate::config::Config;
use crate::error::AppError;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const STREAM_MAX_TOKENS: u32 = 8000;
const SUMMARY_MAX_TOKENS: u32 = 1200;
const SUMMARY_TIMEOUT: Duration = Duration::from_secs(120);
const ERROR_BODY_MAX_CHARS: usize = 500;

const SUMMARIZER_INSTRUCTIONS: &str = "You compress conversation history into a summary that can be cached long-term. \
Keep the key requirements, decisions and changes already made, important constraints, open items and the current state. \
Use short bullet points. Do not invent anything.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamChunk<'a> {
    Reasoning(&'a str),
    Content(&'a str),
}

/// Accumulated result of one streamed model turn.
#[derive(Debug, Clone, Default)]
pub struct ChatReply {
    pub content: String,
    pub reasoning: String,
    pub usage: Option<Usage>,
    /// The interrupt flag cut the stream short; `content` holds what arrived before it.
    pub interrupted: bool,
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Streams one completion, reporting every delta to `on_chunk` as it arrives.
    async fn stream_chat(
        &self,
        messages: &[Message],
        interrupt: &InterruptHandle,
        on_chunk: &mut (dyn for<'c> FnMut(StreamChunk<'c>) + Send),
    ) -> Result<ChatReply, AppError>;

    /// One-shot summary of `text`, used for history compaction.
    async fn summarize(&self, text: &str) -> Result<String, AppError>;
}

fn wire_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
        .collect()
}

fn clip_error_body(body: &str) -> String {
    let body = body.trim();
    if body.chars().count() > ERROR_BODY_MAX_CHARS {
        format!("{}...", body.chars().take(ERROR_BODY_MAX_CHARS).collect::<String>())
    } else {
        body.to_string()
    }
}

/// Maps a non-success HTTP status and its body to the error the agent reports.
fn status_error(status: StatusCode, body: &str) -> AppError {
    if status == StatusCode::UNAUTHORIZED {
        return AppError::Unauthorized;
    }
    AppError::TransportError {
        status: status.as_u16(),
        message: clip_error_body(body),
    }
}

/// Streaming client for OpenAI-compatible `/chat/completions` endpoints.
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    http: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatClient {
    pub fn new(config: &Config) -> Result<Self, AppError> {
        let http = Client::builder().build()?;
        Ok(Self {
            http,
            endpoint: config.chat_endpoint(),
            api_key: config.api_key.clone(),
            model: config.model_name.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AppError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(status_error(status, ""));
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| status.canonical_reason().unwrap_or("request failed").to_string());
        Err(status_error(status, &body))
    }
}

#[async_trait]
impl ChatClient for OpenAiCompatClient {
    #[instrument(skip_all, fields(model = %self.model, messages = messages.len()))]
    async fn stream_chat(
        &self,
        messages: &[Message],
        interrupt: &InterruptHandle,
        on_chunk: &mut (dyn for<'c> FnMut(StreamChunk<'c>) + Send),
    ) -> Result<ChatReply, AppError> {
        let payload = json!({
            "model": self.model,
            "messages": wire_messages(messages),
            "temperature": 0.1,
            "stream": true,
            "stream_options": {"include_usage": true},
            "max_tokens": STREAM_MAX_TOKENS,
        });
        let request = self.http.post(&self.endpoint).bearer_auth(&self.api_key).json(&payload).send();

        let mut reply = ChatReply::default();
        let Some(response) = await_or_interrupt(request, interrupt).await else {
            reply.interrupted = true;
            return Ok(reply);
        };
        let response = Self::check_status(response?).await?;

        let mut bytes = response.bytes_stream();
        let mut parser = SseStreamParser::default();
        let mut apply = |event: ChatStreamEvent, reply: &mut ChatReply| match event {
            ChatStreamEvent::Reasoning(text) => {
                on_chunk(StreamChunk::Reasoning(&text));
                reply.reasoning.push_str(&text);
            }
            ChatStreamEvent::Content(text) => {
                on_chunk(StreamChunk::Content(&text));
                reply.content.push_str(&text);
            }
            ChatStreamEvent::Usage(usage) => reply.usage = Some(usage),
        };

        loop {
            let Some(next) = await_or_interrupt(bytes.next(), interrupt).await else {
                debug!(received = reply.content.len(), "Stream interrupted");
                reply.interrupted = true;
                break;
            };
            let Some(chunk) = next else {
                for event in parser.finish() {
                    apply(event, &mut reply);
                }
                break;
            };
            for event in parser.feed(&chunk?) {
                apply(event, &mut reply);
            }
            if interrupt.is_interrupted() {
                reply.interrupted = true;
                break;
            }
        }
        Ok(reply)
    }

    #[instrument(skip_all, fields(model = %self.model, chars = text.len()))]
    async fn summarize(&self, text: &str) -> Result<String, AppError> {
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": Role::System.as_str(), "content": SUMMARIZER_INSTRUCTIONS},
                {"role": Role::User.as_str(), "content": text},
            ],
            "temperature": 0.1,
            "stream": false,
            "max_tokens": SUMMARY_MAX_TOKENS,
        });
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .timeout(SUMMARY_TIMEOUT)
            .json(&payload)
            .send()
            .await?;
        let data: Value = Self::check_status(response).await?.json().await?;
        let content = data
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        if content.is_empty() {
            warn!("Summary response carried no content");
        }
        Ok(content)
    }
}

#[derive(Debug)]
enum ScriptedStep {
    Reply(String),
    /// Streams the partial text, then raises the interrupt flag.
    InterruptAfter(String),
    Fail(AppError),
}

/// Replays canned replies in order; for tests and offline embedding.
#[derive(Debug, Default)]
pub struct ScriptedChatClient {
    replies: StdMutex<VecDeque<ScriptedStep>>,
    summaries: StdMutex<VecDeque<String>>,
    requests: StdMutex<Vec<Vec<Message>>>,
}

impl ScriptedChatClient {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: StdMutex::new(replies.into_iter().map(|r| ScriptedStep::Reply(r.into())).collect()),
            ..Self::default()
        }
    }

    fn push_step(self, step: ScriptedStep) -> Self {
        if let Ok(mut queue) = self.replies.lock() {
            queue.push_back(step);
        }
        self
    }

    /// Queues a reply that is cut off by a user interrupt after `partial` arrived.
    pub fn with_interrupted_reply(self, partial: impl Into<String>) -> Self {
        self.push_step(ScriptedStep::InterruptAfter(partial.into()))
    }

    /// Queues a request that fails with `error`.
    pub fn with_failure(self, error: AppError) -> Self {
        self.push_step(ScriptedStep::Fail(error))
    }

    pub fn with_summaries<I, S>(self, summaries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(mut queue) = self.summaries.lock() {
            queue.extend(summaries.into_iter().map(Into::into));
        }
        self
    }

    /// Every message list this client was asked to complete, in order.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChatClient for ScriptedChatClient {
    async fn stream_chat(
        &self,
        messages: &[Message],
        interrupt: &InterruptHandle,
        on_chunk: &mut (dyn for<'c> FnMut(StreamChunk<'c>) + Send),
    ) -> Result<ChatReply, AppError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(messages.to_vec());
        }
        let next = self.replies.lock().ok().and_then(|mut q| q.pop_front());
        let step = next.ok_or_else(|| AppError::TransportError {
            status: 500,
            message: "scripted replies exhausted".to_string(),
        })?;
        if interrupt.is_interrupted() {
            return Ok(ChatReply { interrupted: true, ..ChatReply::default() });
        }
        match step {
            ScriptedStep::Reply(content) => {
                on_chunk(StreamChunk::Content(&content));
                Ok(ChatReply { content, ..ChatReply::default() })
            }
            ScriptedStep::InterruptAfter(content) => {
                on_chunk(StreamChunk::Content(&content));
                interrupt.interrupt();
                Ok(ChatReply {
                    content,
                    interrupted: true,
                    ..ChatReply::default()
                })
            }
            ScriptedStep::Fail(error) => Err(error),
        }
    }

    async fn summarize(&self, _text: &str) -> Result<String, AppError> {
        Ok(self.summaries.lock().ok().and_then(|mut q| q.pop_front()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_client_replays_in_order_and_records_requests() {
        let client = ScriptedChatClient::new(["first", "second"]);
        let interrupt = InterruptHandle::new();
        let mut seen = String::new();
        let mut sink = |chunk: StreamChunk<'_>| {
            if let StreamChunk::Content(text) = chunk {
                seen.push_str(text);
            }
        };
        let reply = client
            .stream_chat(&[Message::user("hi")], &interrupt, &mut sink)
            .await
            .unwrap();
        assert_eq!(reply.content, "first");
        client.stream_chat(&[], &interrupt, &mut sink).await.unwrap();
        assert!(client.stream_chat(&[], &interrupt, &mut sink).await.is_err());
        assert_eq!(seen, "firstsecond");
        assert_eq!(client.requests()[0], vec![Message::user("hi")]);
    }

    #[tokio::test]
    async fn scripted_interrupt_keeps_partial_text_and_raises_flag() {
        let client = ScriptedChatClient::new(Vec::<String>::new())
            .with_interrupted_reply("half an ans")
            .with_failure(AppError::InvalidInputArgument("boom".into()));
        let interrupt = InterruptHandle::new();
        let mut sink = |_chunk: StreamChunk<'_>| {};
        let reply = client.stream_chat(&[], &interrupt, &mut sink).await.unwrap();
        assert!(reply.interrupted);
        assert_eq!(reply.content, "half an ans");
        assert!(interrupt.is_interrupted());

        interrupt.reset();
        let err = client.stream_chat(&[], &interrupt, &mut sink).await.unwrap_err();
        assert!(!err.is_transport());
    }

    #[test]
    fn unauthorized_status_maps_to_authentication_error() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, "bad key"),
            AppError::Unauthorized
        ));
        match status_error(StatusCode::TOO_MANY_REQUESTS, "  slow down  ") {
            AppError::TransportError { status, message } => {
                assert_eq!(status, 429);
                assert_eq!(message, "slow down");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn long_error_bodies_are_clipped() {
        let clipped = clip_error_body(&"x".repeat(2 * ERROR_BODY_MAX_CHARS));
        assert_eq!(clipped.chars().count(), ERROR_BODY_MAX_CHARS + 3);
    }

    #[test]
    fn endpoint_comes_from_config() {
        let mut config = Config::for_root("/tmp/ws");
        config.base_url = "https://example.test/v1".to_string();
        let client = OpenAiCompatClient::new(&config).unwrap();
        assert_eq!(client.endpoint(), "https://example.test/v1/chat/completions");
    }
}
