use std::time::Duration;

use anyhow::{Context, Result};
use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestAssistantMessageContent,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessageArgs,
        ChatCompletionRequestUserMessageContent, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use guardian_core::completion::{ChatMessage, Completer, Role};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Configuration for an OpenAI-compatible chat-completion endpoint
/// (OpenAI itself, or Groq/Cerebras-style gateways via `api_base`).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct OpenAiSettings {
    pub api_key: String,
    pub model: String,
    pub api_base: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl OpenAiSettings {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            model: DEFAULT_MODEL.to_string(),
            api_base: None,
            temperature: 0.7,
            max_tokens: 1500,
            timeout_secs: 60,
        }
    }
}

/// Completer using the chat completions API.
pub struct OpenAiCompleter {
    client: Client<OpenAIConfig>,
    settings: OpenAiSettings,
}

impl OpenAiCompleter {
    pub fn new(settings: OpenAiSettings) -> Result<Self> {
        let mut config = OpenAIConfig::new().with_api_key(&settings.api_key);
        if let Some(base) = &settings.api_base {
            config = config.with_api_base(base);
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("building http client")?;
        let client = Client::with_config(config).with_http_client(http);
        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &OpenAiSettings {
        &self.settings
    }
}

#[async_trait]
impl Completer for OpenAiCompleter {
    fn name(&self) -> &'static str {
        "openai"
    }

    #[instrument(skip_all, fields(completer = "openai", model = %self.settings.model))]
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let messages = messages
            .iter()
            .map(to_request_message)
            .collect::<Result<Vec<_>>>()?;

        let req = CreateChatCompletionRequestArgs::default()
            .model(self.settings.model.clone())
            .messages(messages)
            .temperature(self.settings.temperature)
            .max_completion_tokens(self.settings.max_tokens)
            .build()
            .context("building chat completion request")?;

        let resp = self
            .client
            .chat()
            .create(req)
            .await
            .context("chat completion request failed")?;

        let choice = resp
            .choices
            .into_iter()
            .next()
            .context("completion returned no choices")?;
        let content = choice
            .message
            .content
            .unwrap_or_default()
            .trim()
            .to_string();
        debug!(chars = content.len(), "received completion");
        Ok(content)
    }
}

fn to_request_message(message: &ChatMessage) -> Result<ChatCompletionRequestMessage> {
    let content = message.content.clone();
    let request = match message.role {
        Role::System => ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(ChatCompletionRequestSystemMessageContent::Text(content))
                .build()
                .context("building system message")?,
        ),
        Role::User => ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(ChatCompletionRequestUserMessageContent::Text(content))
                .build()
                .context("building user message")?,
        ),
        Role::Assistant => ChatCompletionRequestMessage::Assistant(
            ChatCompletionRequestAssistantMessageArgs::default()
                .content(ChatCompletionRequestAssistantMessageContent::Text(content))
                .build()
                .context("building assistant message")?,
        ),
    };
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults() {
        let settings = OpenAiSettings::new("key".into());
        assert_eq!(settings.model, DEFAULT_MODEL);
        assert_eq!(settings.api_base, None);
        assert_eq!(settings.max_tokens, 1500);
        assert_eq!(settings.timeout_secs, 60);
    }

    #[test]
    fn maps_each_role_to_its_request_variant() {
        let system = to_request_message(&ChatMessage::new(Role::System, "s")).expect("system");
        let user = to_request_message(&ChatMessage::new(Role::User, "u")).expect("user");
        let assistant =
            to_request_message(&ChatMessage::new(Role::Assistant, "a")).expect("assistant");

        assert!(matches!(system, ChatCompletionRequestMessage::System(_)));
        assert!(matches!(user, ChatCompletionRequestMessage::User(_)));
        assert!(matches!(assistant, ChatCompletionRequestMessage::Assistant(_)));
    }

    #[test]
    fn builds_client_with_custom_base() {
        let mut settings = OpenAiSettings::new("key".into());
        settings.api_base = Some("https://api.groq.com/openai/v1".into());
        let completer = OpenAiCompleter::new(settings).expect("client builds offline");
        assert_eq!(completer.name(), "openai");
        assert_eq!(
            completer.settings().api_base.as_deref(),
            Some("https://api.groq.com/openai/v1")
        );
    }
}
