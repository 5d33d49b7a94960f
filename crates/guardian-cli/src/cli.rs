use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "guardian",
    about = "Encrypted patient records and a chat assistant for clinicians",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Optional subcommand; defaults to listing records when absent.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Manage the encrypted record store.
    #[command(subcommand)]
    Records(RecordsCommand),
    /// Ask the assistant a question; the conversation is kept encrypted on disk.
    Ask {
        #[arg(required = true, trailing_var_arg = true)]
        prompt: Vec<String>,
    },
    /// Inspect, reset or file away the current conversation.
    #[command(subcommand)]
    Chat(ChatCommand),
    /// Manage encryption keys.
    #[command(subcommand)]
    Key(KeyCommand),
    /// Write a synthetic patient CSV in the import format.
    SampleData {
        /// Number of patient rows.
        #[arg(long, default_value_t = 200)]
        rows: usize,
        /// Output file; stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Run a health check against core subsystems (storage, config).
    Health,
    /// Print version and exit.
    Version,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum RecordsCommand {
    /// List stored records.
    List,
    /// Print every field of one record.
    Show { id: String },
    /// Create a record with a fresh id.
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        age: u32,
        /// Extra field as key=value; may be repeated.
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },
    /// Delete a record.
    Remove { id: String },
    /// Import records from a CSV file.
    Import { path: PathBuf },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// Print the saved conversation.
    Show,
    /// Forget the conversation, keeping the system prompt.
    Clear,
    /// Keep a copy of the conversation under a name, replacing one of the same name.
    Save { name: String },
    /// Make a saved conversation the current one.
    Load { name: String },
    /// List saved conversations.
    List,
    /// Delete a saved conversation.
    Delete { name: String },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum KeyCommand {
    /// Replace the keys and re-encrypt the data files under the new ones.
    Rotate {
        /// Only rotate keys older than `key_rotation_days`.
        #[arg(long)]
        if_due: bool,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}

fn parse_field(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err("field name must not be empty".to_string());
    }
    Ok((key.to_string(), value.trim().to_string()))
}
