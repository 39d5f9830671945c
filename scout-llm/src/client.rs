use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, Role, StreamChunk, ToolCallFragment, ToolDefinition, Usage};
use bytes::Bytes;
use futures_util::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;

/// Chat-completion client for any OpenAI-compatible endpoint.
///
/// The base URL, API key, model and temperature come from configuration;
/// there is deliberately no provider detection beyond the
/// chat-completion-with-tool-calls contract.
#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl LlmClient {
    pub fn new(base_url: &str, api_key: &str, model: &str, temperature: f32) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            temperature,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Issue one streaming chat-completion request.
    ///
    /// The returned stream yields text deltas and raw tool-call fragments in
    /// arrival order, then a final `Done` chunk once the server signals the
    /// end of the stream.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>> {
        let req = ChatRequest::new(&self.model, self.temperature, messages, tools);
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http(format!(
                "chat completions stream status={status} body={body}"
            )));
        }

        let sse = Box::pin(decode_sse(response.bytes_stream()));
        let state = StreamState::default();

        let stream = futures_util::stream::unfold((sse, state), |(mut sse, mut state)| async move {
            loop {
                if let Some(chunk) = state.pending.pop_front() {
                    return Some((Ok(chunk), (sse, state)));
                }
                if state.finished {
                    return None;
                }

                let next = sse.as_mut().next().await?;
                match next {
                    Ok(SseEvent::Data(data)) => {
                        if data.trim() == "[DONE]" {
                            state.finished = true;
                            let usage = state.usage.take().unwrap_or_default();
                            state.pending.push_back(StreamChunk::Done { usage });
                            continue;
                        }
                        if let Err(e) = state.absorb(&data) {
                            return Some((Err(e), (sse, state)));
                        }
                    }
                    Ok(SseEvent::Other) => continue,
                    Err(e) => return Some((Err(e), (sse, state))),
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

/// Per-stream decoding state: queued chunks not yet handed to the caller
/// plus the usage totals reported by the server.
#[derive(Debug, Default)]
struct StreamState {
    pending: VecDeque<StreamChunk>,
    usage: Option<Usage>,
    finished: bool,
}

impl StreamState {
    fn absorb(&mut self, data: &str) -> Result<()> {
        let chunk: WireStreamChunk = serde_json::from_str(data)
            .map_err(|e| LlmError::StreamParse(format!("chunk json error={e} data={data}")))?;

        if let Some(u) = chunk.usage.as_ref() {
            self.usage = Some(Usage {
                prompt_tokens: u.prompt_tokens.unwrap_or(0),
                completion_tokens: u.completion_tokens.unwrap_or(0),
            });
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(());
        };

        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                self.pending.push_back(StreamChunk::Delta { content });
            }
        }

        for tc in choice.delta.tool_calls.unwrap_or_default() {
            let (name, arguments) = match tc.function {
                Some(f) => (f.name, f.arguments),
                None => (None, None),
            };
            self.pending.push_back(StreamChunk::ToolCall(ToolCallFragment {
                index: tc.index,
                id: tc.id,
                name,
                arguments,
            }));
        }

        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    temperature: f32,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

impl ChatRequest {
    fn new(
        model: &str,
        temperature: f32,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Self {
        let tools: Vec<WireTool> = tools.iter().map(to_wire_tool).collect();
        let tool_choice = if tools.is_empty() {
            None
        } else {
            Some("auto".to_string())
        };
        Self {
            model: model.to_string(),
            messages: messages.iter().map(to_wire_message).collect(),
            tools,
            tool_choice,
            temperature,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct WireTool {
    r#type: String,
    function: WireToolFunction,
}

#[derive(Debug, Serialize)]
struct WireToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

fn to_wire_tool(t: &ToolDefinition) -> WireTool {
    WireTool {
        r#type: "function".to_string(),
        function: WireToolFunction {
            name: t.name.clone(),
            description: t.description.clone(),
            parameters: t.parameters.clone(),
        },
    }
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireToolCall {
    id: String,
    r#type: String,
    function: WireToolCallFunction,
}

#[derive(Debug, Serialize)]
struct WireToolCallFunction {
    name: String,
    arguments: String,
}

fn to_wire_message(m: &ChatMessage) -> WireMessage {
    let role = match m.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    // A message that carries tool calls must never serialize with a null
    // content field; some backends reject that shape.
    let content = if m.tool_calls.is_empty() {
        Some(m.content.clone()).filter(|s| !s.is_empty() || m.role != Role::Assistant)
    } else {
        Some(m.content.clone())
    };
    WireMessage {
        role: role.to_string(),
        content,
        tool_calls: m
            .tool_calls
            .iter()
            .map(|tc| WireToolCall {
                id: tc.id.clone(),
                r#type: "function".to_string(),
                function: WireToolCallFunction {
                    name: tc.name.clone(),
                    arguments: tc.arguments.clone(),
                },
            })
            .collect(),
        tool_call_id: m.tool_call_id.clone(),
    }
}

#[derive(Debug)]
enum SseEvent {
    Data(String),
    Other,
}

fn decode_sse<S, E>(bytes_stream: S) -> impl Stream<Item = Result<SseEvent>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::fmt::Display,
{
    futures_util::stream::unfold(
        (bytes_stream, String::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                if let Some(idx) = buffer.find("\n\n") {
                    let raw = buffer[..idx].to_string();
                    buffer = buffer[idx + 2..].to_string();

                    let mut data_lines = Vec::new();
                    for line in raw.lines() {
                        let line = line.trim_end();
                        if let Some(rest) = line.strip_prefix("data:") {
                            data_lines.push(rest.trim_start().to_string());
                        }
                    }
                    if data_lines.is_empty() {
                        return Some((Ok(SseEvent::Other), (stream, buffer)));
                    }
                    return Some((Ok(SseEvent::Data(data_lines.join("\n"))), (stream, buffer)));
                }

                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                        continue;
                    }
                    Some(Err(e)) => {
                        return Some((Err(LlmError::Http(e.to_string())), (stream, buffer)));
                    }
                    None => return None,
                }
            }
        },
    )
}

#[derive(Debug, Deserialize)]
struct WireStreamChunk {
    #[serde(default)]
    choices: Vec<WireStreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChoice {
    delta: WireStreamDelta,
}

#[derive(Debug, Deserialize)]
struct WireStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireStreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireStreamToolCall {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireStreamToolFunction>,
}

#[derive(Debug, Deserialize)]
struct WireStreamToolFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCall;
    use std::convert::Infallible;

    fn sse_stream(
        events: Vec<&str>,
    ) -> impl Stream<Item = std::result::Result<Bytes, Infallible>> + Send + Unpin + 'static {
        let chunks: Vec<std::result::Result<Bytes, Infallible>> = events
            .into_iter()
            .map(|e| Ok(Bytes::from(e.to_string())))
            .collect();
        futures_util::stream::iter(chunks)
    }

    async fn collect_data(events: Vec<&str>) -> Vec<String> {
        let mut out = Vec::new();
        let mut sse = Box::pin(decode_sse(sse_stream(events)));
        while let Some(ev) = sse.next().await {
            if let SseEvent::Data(d) = ev.expect("sse event") {
                out.push(d);
            }
        }
        out
    }

    #[tokio::test]
    async fn sse_events_split_on_blank_lines_across_chunk_boundaries() {
        let data = collect_data(vec!["data: one\n\nda", "ta: two\n\n", "data: three\n\n"]).await;
        assert_eq!(data, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn sse_comment_events_are_skipped() {
        let data = collect_data(vec![": keepalive\n\ndata: payload\n\n"]).await;
        assert_eq!(data, vec!["payload"]);
    }

    #[tokio::test]
    async fn stream_state_queues_text_and_fragments_from_one_event() {
        let mut state = StreamState::default();
        state
            .absorb(
                r#"{"choices":[{"delta":{"content":"hi","tool_calls":[
                    {"index":0,"id":"call_a","function":{"name":"list_tables","arguments":""}},
                    {"index":1,"id":"call_b","function":{"name":"get_indexes","arguments":"{\"ta"}}
                ]}}]}"#,
            )
            .expect("absorb chunk");

        assert_eq!(state.pending.len(), 3);
        match state.pending.pop_front() {
            Some(StreamChunk::Delta { content }) => assert_eq!(content, "hi"),
            other => panic!("expected text delta, got {other:?}"),
        }
        match state.pending.pop_front() {
            Some(StreamChunk::ToolCall(frag)) => {
                assert_eq!(frag.index, Some(0));
                assert_eq!(frag.id.as_deref(), Some("call_a"));
                assert_eq!(frag.name.as_deref(), Some("list_tables"));
            }
            other => panic!("expected tool-call fragment, got {other:?}"),
        }
        match state.pending.pop_front() {
            Some(StreamChunk::ToolCall(frag)) => {
                assert_eq!(frag.index, Some(1));
                assert_eq!(frag.arguments.as_deref(), Some("{\"ta"));
            }
            other => panic!("expected tool-call fragment, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_state_accepts_fragments_without_index() {
        let mut state = StreamState::default();
        state
            .absorb(r#"{"choices":[{"delta":{"tool_calls":[{"function":{"arguments":"ble\"}"}}]}}]}"#)
            .expect("absorb chunk");
        match state.pending.pop_front() {
            Some(StreamChunk::ToolCall(frag)) => {
                assert_eq!(frag.index, None);
                assert_eq!(frag.id, None);
                assert_eq!(frag.arguments.as_deref(), Some("ble\"}"));
            }
            other => panic!("expected tool-call fragment, got {other:?}"),
        }
    }

    #[test]
    fn assistant_message_with_tool_calls_always_serializes_content() {
        let msg = ChatMessage {
            role: Role::Assistant,
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: "call_a".to_string(),
                name: "list_tables".to_string(),
                arguments: "{}".to_string(),
            }],
            tool_call_id: None,
        };
        let wire = serde_json::to_value(to_wire_message(&msg)).expect("serialize message");
        assert_eq!(wire["content"], serde_json::json!(""));
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "list_tables");
    }

    #[test]
    fn assistant_message_without_tool_calls_omits_empty_content() {
        let msg = ChatMessage::text(Role::Assistant, "");
        let wire = serde_json::to_value(to_wire_message(&msg)).expect("serialize message");
        assert!(wire.get("content").is_none());
    }

    #[test]
    fn user_message_keeps_empty_content() {
        let msg = ChatMessage::text(Role::User, "   ");
        let wire = serde_json::to_value(to_wire_message(&msg)).expect("serialize message");
        assert_eq!(wire["content"], serde_json::json!("   "));
    }
}
