use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Author of a chat message, as understood by chat-completion APIs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    /// Message text (markdown allowed).
    pub content: String,
    /// When the message was recorded; absent for messages built in code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: None,
        }
    }

    /// Same as [`ChatMessage::new`], stamped with the current time.
    pub fn now(role: Role, content: impl Into<String>) -> Self {
        Self {
            timestamp: Some(Utc::now()),
            ..Self::new(role, content)
        }
    }
}

/// Contract for any completion provider (OpenAI-compatible API, local, stub).
#[async_trait]
pub trait Completer: Send + Sync {
    /// Short name used for logging and output.
    fn name(&self) -> &'static str;

    /// Produce the assistant reply for the conversation so far.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;
}

/// Completer that echoes the last user message; useful for tests and offline runs.
pub struct EchoCompleter;

#[async_trait]
impl Completer for EchoCompleter {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let last = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        Ok(format!("Echo: {last}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_completer_repeats_last_user_message() {
        let messages = vec![
            ChatMessage::new(Role::System, "You are a medical AI assistant."),
            ChatMessage::new(Role::User, "first"),
            ChatMessage::new(Role::Assistant, "Echo: first"),
            ChatMessage::new(Role::User, "second"),
        ];

        let reply = EchoCompleter
            .complete(&messages)
            .await
            .expect("echo completer should succeed");
        assert_eq!(reply, "Echo: second");
    }

    #[test]
    fn roles_serialize_lowercase() {
        let json = serde_json::to_string(&ChatMessage::new(Role::Assistant, "hi")).expect("json");
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }
}
