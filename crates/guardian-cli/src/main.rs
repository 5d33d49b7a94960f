mod chat;
mod cli;
mod config;
mod records;
mod storage;

use std::{fs::File, io, path::PathBuf};

use clap::Parser;
use color_eyre::Result;
use guardian_core::{
    records::{fields, Record, RecordId, RecordSet},
    storage::RecordStore,
};
use guardian_import::sample::write_sample_csv;
use guardian_storage::{
    encrypted_store::EncryptedFileStore,
    key_provider::{InMemoryKeyProvider, KeyProvider},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{Command, ConfigCommand, KeyCommand, RecordsCommand};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?;
    match cli.command.unwrap_or(Command::Records(RecordsCommand::List)) {
        Command::Records(cmd) => records::handle(cmd, &config).await?,
        Command::Ask { prompt } => chat::ask(prompt, &config).await?,
        Command::Chat(cmd) => chat::handle(cmd, &config).await?,
        Command::Key(KeyCommand::Rotate { if_due }) => rotate_keys(if_due, &config).await?,
        Command::SampleData { rows, out } => write_sample_data(rows, out)?,
        Command::Health => run_health_check(&config).await?,
        Command::Version => print_version(),
        Command::Config(ConfigCommand::Init) => init_config(&config)?,
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info. Logs go to stderr so
    // command output stays pipeable.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("guardian {}", env!("CARGO_PKG_VERSION"));
}

/// Round-trips a probe record through a throwaway encrypted file, then checks
/// that the real record store decrypts.
async fn run_health_check(config: &config::Config) -> Result<()> {
    let root = storage::resolve_data_dir(config)?;
    let probe = EncryptedFileStore::new(root.join("health.bin"), InMemoryKeyProvider::default());
    let result = run_store_health(&probe).await;
    if let Err(err) = std::fs::remove_file(probe.path()) {
        tracing::debug!("health probe cleanup: {err}");
    }
    result?;
    println!("Storage: ok ({})", root.display());

    let store = storage::record_store(config)?;
    let records = storage::for_update(store).load().await?;
    println!("Records: {} readable", records.len());

    for store in [
        storage::record_store(config)?,
        storage::chat_store(config)?,
        storage::saved_chats_store(config)?,
    ] {
        for kept in store.kept_backups()? {
            println!(
                "Kept backup from an interrupted save: {}",
                kept.display()
            );
        }
    }
    Ok(())
}

async fn run_store_health<S: RecordStore>(store: &S) -> Result<()> {
    let id = RecordId::from("health");
    let mut probe = RecordSet::new();
    probe.insert(id.clone(), Record::new(&id).with(fields::NAME, "probe"));

    store.save(&probe).await?;
    let round_trip = store.load().await?;
    if round_trip != probe {
        color_eyre::eyre::bail!("storage round-trip failed");
    }
    Ok(())
}

async fn rotate_keys(if_due: bool, config: &config::Config) -> Result<()> {
    for (label, store) in [
        ("records", storage::record_store(config)?),
        ("chat", storage::chat_store(config)?),
        ("saved chats", storage::saved_chats_store(config)?),
    ] {
        let outcome = rotate_one(&store, if_due).await?;
        println!("{label}: {outcome}");
    }
    Ok(())
}

async fn rotate_one<P: KeyProvider>(
    store: &EncryptedFileStore<P>,
    if_due: bool,
) -> Result<&'static str> {
    let outcome = if if_due {
        if store.rotate_key_if_due().await? {
            "key rotated"
        } else {
            "key not due"
        }
    } else if store.rotate_key().await? {
        "key rotated, data re-encrypted"
    } else {
        "key rotated, no data yet"
    };
    Ok(outcome)
}

fn write_sample_data(rows: usize, out: Option<PathBuf>) -> Result<()> {
    let mut rng = rand::thread_rng();
    match out {
        Some(path) => {
            write_sample_csv(File::create(&path)?, rows, &mut rng)?;
            eprintln!("Wrote {rows} sample patients to {}", path.display());
        }
        None => write_sample_csv(io::stdout().lock(), rows, &mut rng)?,
    }
    Ok(())
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}
