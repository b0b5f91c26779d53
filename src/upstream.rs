//! Upstream HTTP client
//!
//! Submits prompts, stop requests, and session metadata calls to the
//! inference service. Token streams do not come back on these calls; they
//! arrive through the bus. Every call carries its own deadline, and a
//! timeout on the chat call does not abort the bus consumer — upstream's
//! background worker may still deliver.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::TimeoutConfig;

/// Errors from upstream calls
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Request(String),
    #[error("upstream timed out: {0}")]
    Timeout(String),
    #[error("upstream returned {code}: {body}")]
    Status { code: u16, body: String },
    #[error("upstream reply unreadable: {0}")]
    Decode(String),
}

impl UpstreamError {
    fn from_reqwest(call: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(call.to_string())
        } else {
            Self::Request(format!("{call}: {err}"))
        }
    }
}

/// Boolean flag set forwarded with every chat submission.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ChatFlags {
    #[serde(default)]
    pub summarize_flag: bool,
    #[serde(default)]
    pub codebase_search_flag: bool,
    #[serde(default)]
    pub personalize_flag: bool,
    #[serde(default)]
    pub temp_file_flag: bool,
    #[serde(default)]
    pub first_chat_flag: bool,
    #[serde(default)]
    pub web_search_flag: bool,
}

/// Chat submission payload.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub chat_id: String,
    pub session_id: String,
    pub llm_model_id: String,
    pub prompt: String,
    pub temp_file_paths: Vec<String>,
    pub room_id: String,
    #[serde(flatten)]
    pub flags: ChatFlags,
}

/// Parsed reply to a chat submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatReply {
    pub is_complete: bool,
    pub content: String,
    /// Present on first-chat replies: the LLM-generated session name.
    pub session_name: Option<String>,
}

impl ChatReply {
    /// Lenient parse; upstream builds vary in field casing.
    pub fn from_value(value: &Value) -> Self {
        let is_complete = value
            .get("is_complete")
            .or_else(|| value.get("isComplete"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let content = value
            .get("content")
            .or_else(|| value.get("response"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let session_name = value
            .get("SESSION_NAME")
            .or_else(|| value.get("session_name"))
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string);
        Self {
            is_complete,
            content,
            session_name,
        }
    }
}

/// HTTP client for the upstream inference service.
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    timeouts: TimeoutConfig,
}

impl UpstreamClient {
    pub fn new(base_url: impl Into<String>, timeouts: TimeoutConfig) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| UpstreamError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeouts,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Submit a prompt. Upstream acknowledges over HTTP and streams tokens
    /// through the bus.
    pub async fn chat(&self, token: &str, request: &ChatRequest) -> Result<ChatReply, UpstreamError> {
        let response = self
            .http
            .post(self.url("/chat"))
            .bearer_auth(token)
            .timeout(Duration::from_millis(self.timeouts.upstream_chat_ms))
            .json(request)
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest("chat", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                code: status.as_u16(),
                body,
            });
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| UpstreamError::Decode(e.to_string()))?;
        debug!(target: "upstream", chat_id = %request.chat_id, "chat acknowledged");
        Ok(ChatReply::from_value(&value))
    }

    /// Ask upstream to stop generating. Best effort; callers proceed with
    /// local cleanup whatever the outcome.
    pub async fn stop(
        &self,
        token: &str,
        user_id: &str,
        session_id: &str,
        chat_id: Option<&str>,
    ) -> Result<(), UpstreamError> {
        let mut body = json!({
            "user_id": user_id,
            "session_id": session_id,
        });
        if let Some(chat_id) = chat_id {
            body["chat_id"] = json!(chat_id);
        }
        let response = self
            .http
            .post(self.url("/stop"))
            .bearer_auth(token)
            .timeout(Duration::from_millis(self.timeouts.upstream_stop_ms))
            .json(&body)
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest("stop", e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                code: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    /// Ask upstream to publish the authoritative latest-N session list to
    /// the session-index queue.
    pub async fn request_session_index(
        &self,
        token: &str,
        user_id: &str,
    ) -> Result<(), UpstreamError> {
        let response = self
            .http
            .post(self.url("/session_name"))
            .bearer_auth(token)
            .timeout(Duration::from_millis(self.timeouts.upstream_metadata_ms))
            .json(&json!({ "user_id": user_id }))
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest("session_name", e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                code: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    /// Ask upstream to publish the transcript of one session to the
    /// session-history queue. Some builds also echo it in the HTTP body.
    pub async fn request_session_history(
        &self,
        token: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<Value>, UpstreamError> {
        let response = self
            .http
            .post(self.url("/session_history"))
            .bearer_auth(token)
            .timeout(Duration::from_millis(self.timeouts.upstream_history_ms))
            .json(&json!({ "user_id": user_id, "session_id": session_id }))
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest("session_history", e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                code: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await.ok())
    }

    /// Delete a session on upstream.
    pub async fn delete_session(
        &self,
        token: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<(), UpstreamError> {
        let response = self
            .http
            .delete(self.url(&format!("/sessions/{session_id}")))
            .bearer_auth(token)
            .timeout(Duration::from_millis(self.timeouts.upstream_metadata_ms))
            .query(&[("user_id", user_id)])
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest("delete_session", e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                code: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_reply_snake_case() {
        let reply = ChatReply::from_value(&json!({
            "is_complete": true,
            "content": "done",
            "session_name": "Debugging crash"
        }));
        assert!(reply.is_complete);
        assert_eq!(reply.content, "done");
        assert_eq!(reply.session_name.as_deref(), Some("Debugging crash"));
    }

    #[test]
    fn test_chat_reply_camel_case_and_upper_session_name() {
        let reply = ChatReply::from_value(&json!({
            "isComplete": true,
            "response": "ok",
            "SESSION_NAME": "Planning"
        }));
        assert!(reply.is_complete);
        assert_eq!(reply.content, "ok");
        assert_eq!(reply.session_name.as_deref(), Some("Planning"));
    }

    #[test]
    fn test_chat_reply_defaults() {
        let reply = ChatReply::from_value(&json!({}));
        assert!(!reply.is_complete);
        assert!(reply.content.is_empty());
        assert!(reply.session_name.is_none());
    }

    #[test]
    fn test_chat_reply_blank_session_name_discarded() {
        let reply = ChatReply::from_value(&json!({"session_name": "   "}));
        assert!(reply.session_name.is_none());
    }

    #[test]
    fn test_chat_request_serializes_flags_flat() {
        let request = ChatRequest {
            user_id: "u1".to_string(),
            chat_id: "1".to_string(),
            session_id: "19".to_string(),
            llm_model_id: "deepseek-r1".to_string(),
            prompt: "hi".to_string(),
            temp_file_paths: vec![],
            room_id: "chat_u1_19_1".to_string(),
            flags: ChatFlags {
                first_chat_flag: true,
                ..Default::default()
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["first_chat_flag"], true);
        assert_eq!(value["web_search_flag"], false);
        assert_eq!(value["room_id"], "chat_u1_19_1");
    }

    #[test]
    fn test_client_strips_trailing_slash() {
        let client = UpstreamClient::new("http://host:9000/", TimeoutConfig::default()).unwrap();
        assert_eq!(client.url("/chat"), "http://host:9000/chat");
    }
}
