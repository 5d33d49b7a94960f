use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use guardian_agent::openai::{OpenAiCompleter, OpenAiSettings, DEFAULT_MODEL};
use guardian_core::{
    chat::{ChatHistory, SavedChat, SavedChats},
    completion::{Completer, EchoCompleter, Role},
};
use guardian_storage::{encrypted_store::EncryptedFileStore, key_provider::KeyProvider};
use tracing::warn;

use crate::{cli::ChatCommand, config, storage};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are NeuroGuardian, a careful medical and wellness assistant. \
Answer concisely, and recommend professional care for anything urgent.";

/// Send one prompt, print the reply, and persist the updated conversation.
pub async fn ask(prompt: Vec<String>, config: &config::Config) -> Result<()> {
    let store = storage::for_update(storage::chat_store(config)?);
    let completer = build_completer(config);
    let reply = ask_with(
        &store,
        completer.as_ref(),
        prompt.join(" "),
        &system_prompt(config),
    )
    .await?;
    println!("[{}] {reply}", completer.name());
    Ok(())
}

pub async fn handle(cmd: ChatCommand, config: &config::Config) -> Result<()> {
    let store = storage::chat_store(config)?;
    match cmd {
        ChatCommand::Show => {
            let history: ChatHistory = store.load_document().await?;
            let mut shown = 0;
            for message in history.visible() {
                let who = match message.role {
                    Role::User => "you",
                    _ => "assistant",
                };
                match message.timestamp {
                    Some(at) => println!(
                        "[{}] {who}: {}",
                        at.format("%Y-%m-%d %H:%M:%S"),
                        message.content
                    ),
                    None => println!("{who}: {}", message.content),
                }
                shown += 1;
            }
            if shown == 0 {
                println!("No conversation yet. Start one with `guardian ask <question>`.");
            }
        }
        ChatCommand::Clear => {
            clear_history(&storage::for_update(store)).await?;
            println!("Chat history cleared.");
        }
        ChatCommand::Save { name } => {
            let saved = storage::for_update(storage::saved_chats_store(config)?);
            let turns = save_chat(&store, &saved, &name).await?;
            println!("Saved {turns} messages as `{}`.", name.trim());
        }
        ChatCommand::Load { name } => {
            let saved = storage::for_update(storage::saved_chats_store(config)?);
            let turns = load_chat(&store, &saved, &name).await?;
            println!("Loaded `{}` ({turns} messages).", name.trim());
        }
        ChatCommand::List => {
            let chats: SavedChats = storage::saved_chats_store(config)?.load_document().await?;
            if chats.is_empty() {
                println!("No saved chats. Save one with `guardian chat save <name>`.");
            }
            for (name, chat) in &chats {
                println!(
                    "{name}  {} messages, saved {}",
                    chat.messages.visible().count(),
                    chat.saved_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        ChatCommand::Delete { name } => {
            let saved = storage::for_update(storage::saved_chats_store(config)?);
            delete_chat(&saved, &name).await?;
            println!("Deleted `{}`.", name.trim());
        }
    }
    Ok(())
}

async fn ask_with<P: KeyProvider>(
    store: &EncryptedFileStore<P>,
    completer: &dyn Completer,
    prompt: String,
    system_prompt: &str,
) -> Result<String> {
    let mut history: ChatHistory = store.load_document().await?;
    if history.messages().is_empty() {
        history = ChatHistory::with_system_prompt(system_prompt);
    }
    let reply = history.exchange(completer, prompt).await.to_string();
    store.save_document(&history).await?;
    Ok(reply)
}

async fn clear_history<P: KeyProvider>(store: &EncryptedFileStore<P>) -> Result<()> {
    let mut history: ChatHistory = store.load_document().await?;
    history.clear();
    store.save_document(&history).await?;
    Ok(())
}

async fn save_chat<P: KeyProvider>(
    current: &EncryptedFileStore<P>,
    saved: &EncryptedFileStore<P>,
    name: &str,
) -> Result<usize> {
    let name = chat_name(name)?;
    let history: ChatHistory = current.load_document().await?;
    let turns = history.visible().count();
    if turns == 0 {
        return Err(eyre!("the current conversation is empty, nothing to save"));
    }

    let mut chats: SavedChats = saved.load_document().await?;
    chats.insert(name.to_string(), SavedChat::now(history));
    saved.save_document(&chats).await?;
    Ok(turns)
}

/// Replaces the current conversation; save it first to keep it.
async fn load_chat<P: KeyProvider>(
    current: &EncryptedFileStore<P>,
    saved: &EncryptedFileStore<P>,
    name: &str,
) -> Result<usize> {
    let name = chat_name(name)?;
    let chats: SavedChats = saved.load_document().await?;
    let chat = chats
        .get(name)
        .ok_or_else(|| eyre!("no saved chat named `{name}`"))?;
    current.save_document(&chat.messages).await?;
    Ok(chat.messages.visible().count())
}

async fn delete_chat<P: KeyProvider>(saved: &EncryptedFileStore<P>, name: &str) -> Result<()> {
    let name = chat_name(name)?;
    let mut chats: SavedChats = saved.load_document().await?;
    if chats.remove(name).is_none() {
        return Err(eyre!("no saved chat named `{name}`"));
    }
    saved.save_document(&chats).await?;
    Ok(())
}

fn chat_name(raw: &str) -> Result<&str> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(eyre!("chat name must not be empty"));
    }
    Ok(name)
}

fn system_prompt(config: &config::Config) -> String {
    config
        .completion
        .as_ref()
        .and_then(|c| c.system_prompt.clone())
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())
}

/// OpenAI-compatible completer when an API key is available, echo otherwise.
pub fn build_completer(config: &config::Config) -> Arc<dyn Completer> {
    if let Some(settings) = resolve_settings(config) {
        match OpenAiCompleter::new(settings) {
            Ok(completer) => return Arc::new(completer),
            Err(err) => warn!("failed to init completion client, falling back to echo: {err:#}"),
        }
    }
    Arc::new(EchoCompleter)
}

fn resolve_settings(config: &config::Config) -> Option<OpenAiSettings> {
    let completion = config.completion.clone().unwrap_or_default();
    let key = completion
        .api_key
        .or_else(|| std::env::var("GUARDIAN_API_KEY").ok())
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .or_else(|| std::env::var("GROQ_API_KEY").ok())?;

    let mut settings = OpenAiSettings::new(key);
    settings.model = completion.model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
    settings.api_base = completion.endpoint;
    if let Some(temperature) = completion.temperature {
        settings.temperature = temperature;
    }
    if let Some(max_tokens) = completion.max_tokens {
        settings.max_tokens = max_tokens;
    }
    if let Some(timeout_secs) = completion.timeout_secs {
        settings.timeout_secs = timeout_secs;
    }
    Some(settings)
}
