//! Streaming chat-completion client for an OpenAI-compatible endpoint.
//!
//! Pure HTTP client: no agent logic, no tool execution. Tool-call fragments
//! are surfaced raw (index, id, name, argument text) so the caller owns
//! reassembly.

mod client;
mod error;
mod types;

pub use client::LlmClient;
pub use error::{LlmError, Result};
pub use types::{
    ChatMessage, Role, StreamChunk, ToolCall, ToolCallFragment, ToolDefinition, Usage,
};
