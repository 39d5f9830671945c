//! Agent loop controller.
//!
//! Drives the bounded observe/decide/act rounds for one user turn: streams
//! model output, reassembles fragmented tool-call directives, dispatches
//! them through the operation registry, folds observations back into
//! context, and decides termination. The transport consumes the loop as a
//! sequence of typed [`AgentEvent`]s.

use crate::config::AgentConfig;
use crate::prompts::{self, AgentRole};
use crate::session::Session;
use crate::store::{ChatStore, TranscriptEntry, TranscriptRole};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use scout_llm::{ChatMessage, LlmClient, Role, StreamChunk, ToolCall, ToolCallFragment, ToolDefinition};
use scout_tools::OpRegistry;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;

const OBSERVATION_TRUNCATION_MARKER: &str = "\n\n[... tool output truncated ...]";

/// Events produced by one agent turn, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Incremental answer text, forwarded as it streams in.
    Delta(String),
    /// A directive is about to be dispatched.
    ToolInvocation {
        name: String,
        args: serde_json::Value,
    },
    /// The turn finished with a final answer.
    StreamComplete,
    /// The turn failed; the session stays usable.
    Error(String),
}

/// The slice of the model backend the loop needs. `LlmClient` implements it;
/// tests script it.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> scout_llm::Result<Pin<Box<dyn Stream<Item = scout_llm::Result<StreamChunk>> + Send>>>;
}

#[async_trait]
impl ChatBackend for LlmClient {
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> scout_llm::Result<Pin<Box<dyn Stream<Item = scout_llm::Result<StreamChunk>> + Send>>> {
        LlmClient::chat_stream(self, messages, tools).await
    }
}

/// One reassembled tool directive. Identity is the stream index; id, name
/// and argument text are concatenated across fragments in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolDirective {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Reassembles tool-call fragments that may arrive out of order, keyed by
/// the backend-supplied index. Backends that omit indices get sequential
/// ones in order of first appearance: a fragment carrying an id or name
/// opens the next unused slot, an arguments-only fragment continues the
/// most recently touched directive.
#[derive(Debug, Default)]
pub struct DirectiveAccumulator {
    slots: BTreeMap<u32, ToolDirective>,
    next_index: u32,
    last_index: Option<u32>,
}

impl DirectiveAccumulator {
    pub fn absorb(&mut self, fragment: ToolCallFragment) {
        let index = match fragment.index {
            Some(i) => i,
            None => {
                let opens_new = fragment.id.is_some() || fragment.name.is_some();
                match self.last_index {
                    Some(last) if !opens_new => last,
                    _ => self.next_index,
                }
            }
        };
        self.last_index = Some(index);
        self.next_index = self.next_index.max(index.saturating_add(1));

        let slot = self.slots.entry(index).or_default();
        if let Some(id) = fragment.id {
            slot.id.push_str(&id);
        }
        if let Some(name) = fragment.name {
            slot.name.push_str(&name);
        }
        if let Some(arguments) = fragment.arguments {
            slot.arguments.push_str(&arguments);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Directives sorted by index, ascending.
    pub fn into_directives(self) -> Vec<ToolDirective> {
        self.slots.into_values().collect()
    }
}

/// Cap an observation, appending a marker when content was dropped.
/// Re-truncating a truncated observation changes nothing before the marker.
pub fn truncate_observation(observation: String, max_chars: usize) -> String {
    if observation.chars().count() <= max_chars {
        return observation;
    }
    let mut out: String = observation.chars().take(max_chars).collect();
    out.push_str(OBSERVATION_TRUNCATION_MARKER);
    out
}

pub struct AgentRunner {
    backend: Option<Arc<dyn ChatBackend>>,
    registry: Arc<OpRegistry>,
    store: Arc<ChatStore>,
    role: AgentRole,
    max_rounds: usize,
    max_observation_chars: usize,
}

impl AgentRunner {
    pub fn new(
        backend: Option<Arc<dyn ChatBackend>>,
        registry: Arc<OpRegistry>,
        store: Arc<ChatStore>,
        cfg: &AgentConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            store,
            role: cfg.role,
            max_rounds: cfg.max_rounds,
            max_observation_chars: cfg.max_observation_chars,
        }
    }

    /// Run one user turn. Every outcome, including failure, surfaces as an
    /// event; an unsendable event means the client disconnected and the
    /// in-flight round is abandoned.
    #[tracing::instrument(level = "info", skip_all, fields(user_chars = user_text.len()))]
    pub async fn run(
        &self,
        session: &mut Session,
        user_text: &str,
        events: &UnboundedSender<AgentEvent>,
    ) {
        let Some(backend) = self.backend.clone() else {
            tracing::error!("turn rejected: no language model backend configured");
            emit(
                events,
                AgentEvent::Error(
                    "Language model backend is not configured; set [llm] api_url, api_key and model."
                        .to_string(),
                ),
            );
            return;
        };
        let (Some(database), Some(_)) = (session.database.clone(), session.chat_id) else {
            emit(
                events,
                AgentEvent::Error("Select a database and a chat first.".to_string()),
            );
            return;
        };

        // Whitespace-only input is still a turn; never silently dropped.
        if let Err(e) = session.record(
            &self.store,
            &[TranscriptEntry::new(TranscriptRole::User, user_text)],
        ) {
            tracing::error!(error = %e, "failed to persist user message");
            emit(events, AgentEvent::Error(format!("store error: {e}")));
            return;
        }

        let description = self.store.description(&database).unwrap_or_default();
        let system = ChatMessage::text(
            Role::System,
            prompts::compose_system_prompt(self.role, &database, &description),
        );
        let mut context = vec![system];
        context.extend(session.backend_messages());

        let tool_defs = OpRegistry::definitions();

        for round in 1..=self.max_rounds {
            tracing::info!(round, context_messages = context.len(), "agent round started");
            let round_started = Instant::now();

            let mut stream = match backend.chat_stream(&context, &tool_defs).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(round, error = %e, "model backend call failed");
                    emit(events, AgentEvent::Error(format!("LLM error: {e}")));
                    return;
                }
            };

            let mut answer = String::new();
            let mut accumulator = DirectiveAccumulator::default();

            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(StreamChunk::Delta { content }) => {
                        answer.push_str(&content);
                        if !emit(events, AgentEvent::Delta(content)) {
                            return;
                        }
                    }
                    Ok(StreamChunk::ToolCall(fragment)) => accumulator.absorb(fragment),
                    Ok(StreamChunk::Done { usage }) => {
                        tracing::debug!(
                            round,
                            prompt_tokens = usage.prompt_tokens,
                            completion_tokens = usage.completion_tokens,
                            "model stream finished"
                        );
                    }
                    Err(e) => {
                        tracing::error!(round, error = %e, "model stream broke");
                        emit(events, AgentEvent::Error(format!("LLM error: {e}")));
                        return;
                    }
                }
            }

            if accumulator.is_empty() {
                // Final answer for this turn.
                if let Err(e) = session.record(
                    &self.store,
                    &[TranscriptEntry::new(TranscriptRole::Assistant, answer.clone())],
                ) {
                    tracing::error!(error = %e, "failed to persist final answer");
                }
                tracing::info!(
                    round,
                    latency_ms = round_started.elapsed().as_millis() as u64,
                    answer_chars = answer.len(),
                    "turn completed with final answer"
                );
                emit(events, AgentEvent::StreamComplete);
                return;
            }

            let directives = accumulator.into_directives();
            tracing::info!(
                round,
                directive_count = directives.len(),
                "model requested tool invocations"
            );

            // The assistant entry must carry a text field even when the
            // model produced none; some backends reject null content here.
            context.push(ChatMessage {
                role: Role::Assistant,
                content: answer.clone(),
                tool_calls: directives
                    .iter()
                    .map(|d| ToolCall {
                        id: d.id.clone(),
                        name: d.name.clone(),
                        arguments: d.arguments.clone(),
                    })
                    .collect(),
                tool_call_id: None,
            });

            let mut transcript = Vec::new();
            if !answer.trim().is_empty() {
                transcript.push(TranscriptEntry::new(TranscriptRole::Assistant, answer.clone()));
            }

            for directive in &directives {
                let args: serde_json::Value = serde_json::from_str(&directive.arguments)
                    .unwrap_or_else(|_| serde_json::json!({}));

                if !emit(
                    events,
                    AgentEvent::ToolInvocation {
                        name: directive.name.clone(),
                        args: args.clone(),
                    },
                ) {
                    return;
                }
                transcript.push(TranscriptEntry::new(
                    TranscriptRole::ToolCall,
                    format!("{}({})", directive.name, args),
                ));

                let dispatch_started = Instant::now();
                let observation = self.registry.dispatch(&directive.name, &args, &database).await;
                let observation = truncate_observation(observation, self.max_observation_chars);
                tracing::info!(
                    round,
                    tool_name = %directive.name,
                    latency_ms = dispatch_started.elapsed().as_millis() as u64,
                    observation_chars = observation.len(),
                    "tool invocation completed"
                );

                context.push(ChatMessage {
                    role: Role::Tool,
                    content: observation,
                    tool_calls: vec![],
                    tool_call_id: Some(directive.id.clone()),
                });
            }

            if let Err(e) = session.record(&self.store, &transcript) {
                tracing::error!(error = %e, "failed to persist tool round transcript");
            }
        }

        tracing::error!(max_rounds = self.max_rounds, "round cap exhausted");
        emit(
            events,
            AgentEvent::Error("Agent reached the maximum number of tool rounds.".to_string()),
        );
    }
}

fn emit(events: &UnboundedSender<AgentEvent>, event: AgentEvent) -> bool {
    events.send(event).is_ok()
}
