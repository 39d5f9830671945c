//! Per-connection session state.
//!
//! A session is owned exclusively by its WebSocket handler task and dies
//! with the connection. Nothing here is shared across sessions; the store
//! and the connector are the only shared resources.

use crate::store::{ChatStore, TranscriptEntry, TranscriptRole};
use anyhow::Result;
use scout_llm::{ChatMessage, Role};

#[derive(Debug, Default)]
pub struct Session {
    /// Selected target database, if any.
    pub database: Option<String>,
    /// Active chat, if any. Immutably tied to `database` at selection time.
    pub chat_id: Option<i64>,
    /// In-memory mirror of the active chat's transcript.
    pub history: Vec<TranscriptEntry>,
}

impl Session {
    pub fn select_database(&mut self, database: String) {
        self.database = Some(database);
        self.chat_id = None;
        self.history.clear();
    }

    pub fn select_chat(&mut self, chat_id: i64, database: String, history: Vec<TranscriptEntry>) {
        self.database = Some(database);
        self.chat_id = Some(chat_id);
        self.history = history;
    }

    /// Append entries to both the in-memory history and the persisted
    /// transcript, so a reloaded session replays the same context.
    pub fn record(&mut self, store: &ChatStore, entries: &[TranscriptEntry]) -> Result<()> {
        let Some(chat_id) = self.chat_id else {
            anyhow::bail!("no active chat to record into");
        };
        store.append_messages(chat_id, entries)?;
        self.history.extend_from_slice(entries);
        Ok(())
    }

    /// History translated into the backend's role set. `tool_call` entries
    /// exist for human display only and are dropped from model replay.
    pub fn backend_messages(&self) -> Vec<ChatMessage> {
        self.history
            .iter()
            .filter_map(|entry| {
                let role = match entry.role {
                    TranscriptRole::User => Role::User,
                    TranscriptRole::Assistant => Role::Assistant,
                    TranscriptRole::System => Role::System,
                    TranscriptRole::ToolCall => return None,
                };
                Some(ChatMessage::text(role, entry.content.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_entries_are_dropped_from_model_replay() {
        let mut session = Session::default();
        session.select_chat(
            1,
            "shop".to_string(),
            vec![
                TranscriptEntry::new(TranscriptRole::User, "check indexes"),
                TranscriptEntry::new(TranscriptRole::ToolCall, "get_indexes({\"table_name\":\"t\"})"),
                TranscriptEntry::new(TranscriptRole::Assistant, "one index, fragmented"),
            ],
        );

        let messages = session.backend_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
    }

    #[test]
    fn selecting_a_database_resets_the_active_chat() {
        let mut session = Session::default();
        session.select_chat(
            7,
            "shop".to_string(),
            vec![TranscriptEntry::new(TranscriptRole::User, "hello")],
        );
        session.select_database("billing".to_string());
        assert_eq!(session.database.as_deref(), Some("billing"));
        assert!(session.chat_id.is_none());
        assert!(session.history.is_empty());
    }

    #[test]
    fn recording_without_a_chat_fails() {
        let store = ChatStore::open_in_memory().expect("store");
        let mut session = Session::default();
        let err = session
            .record(&store, &[TranscriptEntry::new(TranscriptRole::User, "hi")])
            .expect_err("record without chat");
        assert!(err.to_string().contains("no active chat"));
    }
}
