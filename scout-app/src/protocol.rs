//! WebSocket wire envelopes.
//!
//! The kind set and sequencing rules matter more than the field names: a
//! `message` without an active database and chat yields an `error` envelope,
//! never an agent turn.

use crate::store::{ChatRecord, TranscriptEntry};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    SetDatabase {
        database: String,
    },
    NewChat {
        #[serde(default)]
        title: Option<String>,
    },
    SelectChat {
        chat_id: i64,
    },
    Message {
        content: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    System { content: String },
    ChatCreated { chat: ChatRecord },
    History { chat_id: i64, messages: Vec<TranscriptEntry> },
    Stream { content: String },
    ToolCall { tool: String, args: serde_json::Value },
    StreamEnd,
    Error { content: String },
}

impl ServerEvent {
    pub fn error(content: impl Into<String>) -> Self {
        Self::Error {
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TranscriptRole;

    #[test]
    fn inbound_envelopes_parse_by_type_tag() {
        let set: ClientEnvelope =
            serde_json::from_str(r#"{"type":"set_database","database":"shop"}"#)
                .expect("set_database parses");
        assert_eq!(
            set,
            ClientEnvelope::SetDatabase {
                database: "shop".to_string()
            }
        );

        let msg: ClientEnvelope =
            serde_json::from_str(r#"{"type":"message","content":"hi"}"#).expect("message parses");
        assert_eq!(
            msg,
            ClientEnvelope::Message {
                content: "hi".to_string()
            }
        );

        let new_chat: ClientEnvelope =
            serde_json::from_str(r#"{"type":"new_chat"}"#).expect("new_chat parses");
        assert_eq!(new_chat, ClientEnvelope::NewChat { title: None });
    }

    #[test]
    fn unknown_envelope_kind_is_rejected() {
        assert!(serde_json::from_str::<ClientEnvelope>(r#"{"type":"reboot"}"#).is_err());
    }

    #[test]
    fn outbound_envelopes_carry_their_type_tag() {
        let stream = serde_json::to_value(ServerEvent::Stream {
            content: "hel".to_string(),
        })
        .expect("serialize stream");
        assert_eq!(stream["type"], "stream");
        assert_eq!(stream["content"], "hel");

        let end = serde_json::to_value(ServerEvent::StreamEnd).expect("serialize stream_end");
        assert_eq!(end["type"], "stream_end");

        let history = serde_json::to_value(ServerEvent::History {
            chat_id: 3,
            messages: vec![TranscriptEntry::new(TranscriptRole::ToolCall, "list_tables({})")],
        })
        .expect("serialize history");
        assert_eq!(history["messages"][0]["role"], "tool_call");
    }
}
