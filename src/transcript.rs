//! Transcript store
//!
//! In-memory message log keyed by `(user_id, session_id)`. The assistant
//! message for a chat is created lazily at the first delivered token and
//! stays incomplete until a completion signal arrives. A message marked
//! complete is never mutated again.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::now_ms;

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// Lifecycle stage of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// A user prompt awaiting its reply
    Prompt,
    /// An assistant reply still receiving tokens
    StreamingResponse,
    /// A finalized assistant reply
    CompleteResponse,
}

/// One message in a chat transcript
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_content: Option<String>,
    pub chat_id: String,
    pub session_id: String,
    pub user_id: String,
    pub timestamp_ms: i64,
    pub message_type: MessageType,
    pub is_complete: bool,
    pub token_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_timestamp_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_file_name: Option<String>,
}

impl Message {
    fn user(user_id: &str, session_id: &str, chat_id: &str, content: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: MessageRole::User,
            content: content.to_string(),
            thinking_content: None,
            chat_id: chat_id.to_string(),
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            timestamp_ms: now_ms(),
            message_type: MessageType::Prompt,
            is_complete: false,
            token_count: 0,
            completion_timestamp_ms: None,
            temp_file_name: None,
        }
    }

    fn assistant(user_id: &str, session_id: &str, chat_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: MessageRole::Assistant,
            content: String::new(),
            thinking_content: None,
            chat_id: chat_id.to_string(),
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            timestamp_ms: now_ms(),
            message_type: MessageType::StreamingResponse,
            is_complete: false,
            token_count: 0,
            completion_timestamp_ms: None,
            temp_file_name: None,
        }
    }
}

type TranscriptKey = (String, String);

/// In-memory transcript store.
#[derive(Default)]
pub struct TranscriptStore {
    inner: RwLock<HashMap<TranscriptKey, Vec<Message>>>,
}

impl TranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(user_id: &str, session_id: &str) -> TranscriptKey {
        (user_id.to_string(), session_id.to_string())
    }

    /// Whether any messages exist for this session.
    pub fn has_transcript(&self, user_id: &str, session_id: &str) -> bool {
        self.inner
            .read()
            .get(&Self::key(user_id, session_id))
            .is_some_and(|m| !m.is_empty())
    }

    /// Snapshot of the transcript in append order.
    pub fn history(&self, user_id: &str, session_id: &str) -> Vec<Message> {
        self.inner
            .read()
            .get(&Self::key(user_id, session_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of prompts submitted in this session, counting in-flight ones.
    pub fn prompt_count(&self, user_id: &str, session_id: &str) -> usize {
        self.inner
            .read()
            .get(&Self::key(user_id, session_id))
            .map(|msgs| msgs.iter().filter(|m| m.role == MessageRole::User).count())
            .unwrap_or(0)
    }

    /// Append the user prompt for a new chat. Returns the stored message.
    pub fn append_user_prompt(
        &self,
        user_id: &str,
        session_id: &str,
        chat_id: &str,
        content: &str,
        temp_file_name: Option<String>,
    ) -> Message {
        let mut msg = Message::user(user_id, session_id, chat_id, content);
        msg.temp_file_name = temp_file_name;
        self.inner
            .write()
            .entry(Self::key(user_id, session_id))
            .or_default()
            .push(msg.clone());
        msg
    }

    /// Get or lazily create the in-flight assistant message for a chat.
    /// Returns its message id.
    pub fn ensure_assistant(&self, user_id: &str, session_id: &str, chat_id: &str) -> String {
        let mut inner = self.inner.write();
        let messages = inner.entry(Self::key(user_id, session_id)).or_default();
        if let Some(msg) = messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant && m.chat_id == chat_id && !m.is_complete)
        {
            return msg.id.clone();
        }
        let msg = Message::assistant(user_id, session_id, chat_id);
        let id = msg.id.clone();
        messages.push(msg);
        id
    }

    /// Append one token to the in-flight assistant message.
    pub fn append_assistant_token(
        &self,
        user_id: &str,
        session_id: &str,
        chat_id: &str,
        token: &str,
    ) {
        let mut inner = self.inner.write();
        let Some(messages) = inner.get_mut(&Self::key(user_id, session_id)) else {
            return;
        };
        if let Some(msg) = messages
            .iter_mut()
            .rev()
            .find(|m| m.role == MessageRole::Assistant && m.chat_id == chat_id && !m.is_complete)
        {
            msg.content.push_str(token);
            msg.token_count += 1;
        }
    }

    /// Remove `len` bytes from the tail of the in-flight assistant content.
    /// Used when a provisional run of tokens is relocated to the thinking
    /// lane.
    pub fn retract_assistant_tail(
        &self,
        user_id: &str,
        session_id: &str,
        chat_id: &str,
        len: usize,
    ) {
        let mut inner = self.inner.write();
        let Some(messages) = inner.get_mut(&Self::key(user_id, session_id)) else {
            return;
        };
        if let Some(msg) = messages
            .iter_mut()
            .rev()
            .find(|m| m.role == MessageRole::Assistant && m.chat_id == chat_id && !m.is_complete)
        {
            let keep = msg.content.len().saturating_sub(len);
            msg.content.truncate(keep);
        }
    }

    /// Record extracted thinking content on the in-flight assistant message.
    pub fn set_thinking(&self, user_id: &str, session_id: &str, chat_id: &str, thinking: &str) {
        let mut inner = self.inner.write();
        let Some(messages) = inner.get_mut(&Self::key(user_id, session_id)) else {
            return;
        };
        if let Some(msg) = messages
            .iter_mut()
            .rev()
            .find(|m| m.role == MessageRole::Assistant && m.chat_id == chat_id && !m.is_complete)
        {
            msg.thinking_content = Some(thinking.to_string());
        }
    }

    /// Mark the chat's assistant message complete and pair its user prompt.
    ///
    /// Returns `true` if an assistant message was finalized. Already-complete
    /// messages are left untouched.
    pub fn finalize(
        &self,
        user_id: &str,
        session_id: &str,
        chat_id: &str,
        total_tokens: u64,
    ) -> bool {
        let mut inner = self.inner.write();
        let Some(messages) = inner.get_mut(&Self::key(user_id, session_id)) else {
            return false;
        };
        let mut finalized = false;
        if let Some(msg) = messages
            .iter_mut()
            .rev()
            .find(|m| m.role == MessageRole::Assistant && m.chat_id == chat_id && !m.is_complete)
        {
            msg.is_complete = true;
            msg.message_type = MessageType::CompleteResponse;
            msg.completion_timestamp_ms = Some(now_ms());
            msg.token_count = total_tokens;
            finalized = true;
        }
        if finalized {
            if let Some(msg) = messages
                .iter_mut()
                .rev()
                .find(|m| m.role == MessageRole::User && m.chat_id == chat_id && !m.is_complete)
            {
                msg.is_complete = true;
            }
        }
        finalized
    }

    /// Remove every incomplete message for the chat, both user and assistant
    /// sides. Returns how many were removed.
    pub fn scrub_incomplete(&self, user_id: &str, session_id: &str, chat_id: &str) -> usize {
        let mut inner = self.inner.write();
        let Some(messages) = inner.get_mut(&Self::key(user_id, session_id)) else {
            return 0;
        };
        let before = messages.len();
        messages.retain(|m| m.chat_id != chat_id || m.is_complete);
        before - messages.len()
    }

    /// Store an externally fetched transcript, replacing any local copy.
    pub fn replace(&self, user_id: &str, session_id: &str, messages: Vec<Message>) {
        self.inner
            .write()
            .insert(Self::key(user_id, session_id), messages);
    }

    /// Drop the transcript for one session.
    pub fn drop_session(&self, user_id: &str, session_id: &str) {
        self.inner.write().remove(&Self::key(user_id, session_id));
    }

    /// Drop everything.
    pub fn flush_all(&self) {
        self.inner.write().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
