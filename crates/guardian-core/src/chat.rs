use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::completion::{ChatMessage, Completer, Role};

/// Reply recorded when the completer fails.
pub const FALLBACK_REPLY: &str =
    "Sorry, I'm having trouble processing your request. Please try again later.";

/// Ordered conversation, persisted between runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ChatHistory {
    messages: Vec<ChatMessage>,
}

impl ChatHistory {
    pub fn with_system_prompt(prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::new(Role::System, prompt)],
        }
    }

    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        self.messages.push(ChatMessage::now(role, content));
    }

    /// Drop the conversation but keep system messages.
    pub fn clear(&mut self) {
        self.messages.retain(|m| m.role == Role::System);
    }

    /// Everything, including system messages; this is what the completer sees.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Messages meant to be shown to the user.
    pub fn visible(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().filter(|m| m.role != Role::System)
    }

    pub fn has_system_prompt(&self) -> bool {
        self.messages.iter().any(|m| m.role == Role::System)
    }

    /// Record `prompt`, ask the completer for a reply, and record the reply.
    ///
    /// Completer failures are logged and answered with [`FALLBACK_REPLY`].
    pub async fn exchange(
        &mut self,
        completer: &dyn Completer,
        prompt: impl Into<String>,
    ) -> &str {
        self.push(Role::User, prompt);
        let reply = match completer.complete(&self.messages).await {
            Ok(reply) => reply,
            Err(err) => {
                error!(completer = completer.name(), "completion failed: {err:#}");
                FALLBACK_REPLY.to_string()
            }
        };
        self.push(Role::Assistant, reply);
        &self.messages[self.messages.len() - 1].content
    }
}

/// A conversation stored under a user-chosen name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SavedChat {
    pub messages: ChatHistory,
    pub saved_at: DateTime<Utc>,
}

impl SavedChat {
    pub fn now(messages: ChatHistory) -> Self {
        Self {
            messages,
            saved_at: Utc::now(),
        }
    }
}

/// Saved conversations by name.
pub type SavedChats = BTreeMap<String, SavedChat>;

#[cfg(test)]
mod tests {
    use anyhow::{bail, Result};
    use async_trait::async_trait;

    use super::*;
    use crate::completion::EchoCompleter;

    struct FailingCompleter;

    #[async_trait]
    impl Completer for FailingCompleter {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn complete(&self, _messages: &[ChatMessage]) -> Result<String> {
            bail!("rate limit exceeded")
        }
    }

    #[tokio::test]
    async fn exchange_records_prompt_and_reply() {
        let mut history = ChatHistory::with_system_prompt("You are a medical AI assistant.");
        let reply = history.exchange(&EchoCompleter, "hello").await.to_string();

        assert_eq!(reply, "Echo: hello");
        let visible: Vec<_> = history.visible().collect();
        assert_eq!(visible.len(), 2);
        assert_eq!(visible[0].role, Role::User);
        assert_eq!(visible[1].role, Role::Assistant);
        assert!(visible.iter().all(|m| m.timestamp.is_some()));
    }

    #[tokio::test]
    async fn failing_completer_yields_fallback_reply() {
        let mut history = ChatHistory::default();
        let reply = history.exchange(&FailingCompleter, "hello").await.to_string();

        assert_eq!(reply, FALLBACK_REPLY);
        assert_eq!(history.messages().len(), 2);
    }

    #[test]
    fn saved_chats_serialize_by_name() {
        let mut history = ChatHistory::with_system_prompt("system");
        history.push(Role::User, "a");
        let mut saved = SavedChats::new();
        saved.insert("triage".into(), SavedChat::now(history.clone()));

        let json = serde_json::to_value(&saved).expect("serialize");
        assert_eq!(json["triage"]["messages"][1]["content"], "a");
        let back: SavedChats = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back["triage"].messages, history);
    }

    #[test]
    fn clear_keeps_system_prompt() {
        let mut history = ChatHistory::with_system_prompt("system");
        history.push(Role::User, "a");
        history.push(Role::Assistant, "b");

        history.clear();
        assert_eq!(history.messages().len(), 1);
        assert!(history.has_system_prompt());
        assert_eq!(history.visible().count(), 0);
    }
}
