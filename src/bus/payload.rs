//! Bus payload decoding
//!
//! Tokens, content fragments, status markers, and session indexes share
//! queues and are discriminated structurally: a `type` tag when present,
//! otherwise the shape of the fields (`data` means token, `content` means
//! content fragment, `sessions` means index).

use serde_json::Value;

use crate::catalog::IndexedSession;

/// A decoded bus payload.
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    /// One generated token.
    Token { text: String, chat_id: Option<String> },
    /// A content fragment (some upstream workers batch tokens).
    Content { text: String, chat_id: Option<String> },
    /// Generation for the chat is complete.
    Completion,
    /// Latest-N session list for a user.
    SessionIndex {
        user_id: Option<String>,
        sessions: Vec<IndexedSession>,
    },
    /// Full transcript for one session.
    SessionHistory {
        session_id: Option<String>,
        messages: Vec<Value>,
    },
    /// Anything we cannot classify. Ignored by consumers.
    Unknown(Value),
}

impl BusMessage {
    /// Chat id carried by the payload, when any.
    pub fn chat_id(&self) -> Option<&str> {
        match self {
            Self::Token { chat_id, .. } | Self::Content { chat_id, .. } => chat_id.as_deref(),
            _ => None,
        }
    }
}

/// Decode a raw payload into a [`BusMessage`].
pub fn decode(value: &Value) -> BusMessage {
    if let Some(array) = value.as_array() {
        return decode_array(array);
    }
    let Some(obj) = value.as_object() else {
        return BusMessage::Unknown(value.clone());
    };

    match obj.get("type").and_then(Value::as_str) {
        Some("token") => {
            let text = obj
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return BusMessage::Token {
                text,
                chat_id: string_field(value, "chat_id"),
            };
        }
        Some("status") => {
            if obj.get("token").and_then(Value::as_str) == Some("done") {
                return BusMessage::Completion;
            }
            return BusMessage::Unknown(value.clone());
        }
        Some("completion") => {
            if obj.get("status").and_then(Value::as_str) == Some("done") {
                return BusMessage::Completion;
            }
            return BusMessage::Unknown(value.clone());
        }
        _ => {}
    }

    // Structural fallbacks.
    if let Some(sessions) = obj.get("sessions").and_then(Value::as_array) {
        return BusMessage::SessionIndex {
            user_id: string_field(value, "user_id"),
            sessions: sessions.iter().filter_map(decode_indexed_session).collect(),
        };
    }
    if let Some(messages) = obj.get("messages").and_then(Value::as_array) {
        return BusMessage::SessionHistory {
            session_id: string_field(value, "session_id"),
            messages: messages.to_vec(),
        };
    }
    if let Some(data) = obj.get("data").and_then(Value::as_str) {
        return BusMessage::Token {
            text: data.to_string(),
            chat_id: string_field(value, "chat_id"),
        };
    }
    if let Some(content) = obj.get("content").and_then(Value::as_str) {
        return BusMessage::Content {
            text: content.to_string(),
            chat_id: string_field(value, "chat_id"),
        };
    }

    BusMessage::Unknown(value.clone())
}

/// Arrays are either a direct `[sid, title]` pair list or a list of index
/// objects; either way they decode to a session index.
fn decode_array(array: &[Value]) -> BusMessage {
    let mut sessions = Vec::new();
    for item in array {
        if let Some(pair) = item.as_array() {
            if pair.len() >= 2 {
                sessions.push(IndexedSession {
                    id: stringify(&pair[0]),
                    title: stringify(&pair[1]),
                    created_at_ms: None,
                });
                continue;
            }
        }
        if let Some(obj) = item.as_object() {
            if let Some(inner) = obj.get("sessions").and_then(Value::as_array) {
                sessions.extend(inner.iter().filter_map(decode_indexed_session));
                continue;
            }
            if let Some(session) = decode_indexed_session(item) {
                sessions.push(session);
            }
        }
    }
    if sessions.is_empty() {
        BusMessage::Unknown(Value::Array(array.to_vec()))
    } else {
        BusMessage::SessionIndex {
            user_id: None,
            sessions,
        }
    }
}

fn decode_indexed_session(value: &Value) -> Option<IndexedSession> {
    let obj = value.as_object()?;
    let id = obj
        .get("s_id")
        .or_else(|| obj.get("session_id"))
        .or_else(|| obj.get("id"))?;
    let title = obj
        .get("s_name")
        .or_else(|| obj.get("session_name"))
        .or_else(|| obj.get("title"))
        .map(stringify)
        .unwrap_or_default();
    Some(IndexedSession {
        id: stringify(id),
        title,
        created_at_ms: obj.get("created_at").and_then(Value::as_i64),
    })
}

fn string_field(value: &Value, field: &str) -> Option<String> {
    value.get(field).map(stringify).filter(|s| !s.is_empty())
}

/// Ids arrive as either strings or numbers.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}
