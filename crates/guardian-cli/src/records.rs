use std::{fs::File, path::Path};

use color_eyre::{eyre::eyre, Result};
use guardian_core::{
    records::{fields, fresh_id, Record, RecordId, RecordSet},
    storage::RecordStore,
};
use guardian_import::import_csv;
use guardian_storage::{encrypted_store::EncryptedFileStore, key_provider::KeyProvider};
use tracing::{info, warn};

use crate::{cli::RecordsCommand, config, storage};

/// Execute a records subcommand against the encrypted store.
///
/// `list` and `show` follow the configured decrypt policy; commands that
/// write the record set back always require the current file to decrypt.
pub async fn handle(cmd: RecordsCommand, config: &config::Config) -> Result<()> {
    let store = storage::record_store(config)?;
    rotate_if_due(&store).await;

    match cmd {
        RecordsCommand::List => {
            let records = store.load().await?;
            if records.is_empty() {
                println!(
                    "No records yet. Add one with `guardian records add` or `guardian records import <csv>`."
                );
                return Ok(());
            }
            for (id, record) in &records {
                println!("{}", summary_line(id, record));
            }
        }
        RecordsCommand::Show { id } => {
            let records = store.load().await?;
            let record = records
                .get(&RecordId::from(id.as_str()))
                .ok_or_else(|| eyre!("no record with id {id}"))?;
            for (field, value) in record.fields() {
                println!("{field}: {value}");
            }
        }
        RecordsCommand::Add { name, age, fields } => {
            let store = storage::for_update(store);
            let id = add_record(&store, name, age, fields).await?;
            println!("Created record {id}");
        }
        RecordsCommand::Remove { id } => {
            let store = storage::for_update(store);
            let removed = remove_record(&store, &RecordId::from(id.as_str())).await?;
            println!("Removed {}", removed.name().unwrap_or("record"));
        }
        RecordsCommand::Import { path } => {
            let store = storage::for_update(store);
            let count = import_file(&store, &path).await?;
            println!("Imported {count} records from {}", path.display());
        }
    }

    Ok(())
}

/// A failed rotation is only logged: the commands that follow apply their own
/// decrypt policy to whatever key and file are in place.
async fn rotate_if_due<P: KeyProvider>(store: &EncryptedFileStore<P>) {
    match store.rotate_key_if_due().await {
        Ok(true) => info!("record key was due and has been rotated"),
        Ok(false) => {}
        Err(err) => warn!("record key is due for rotation but could not be rotated: {err}"),
    }
}

async fn add_record<S: RecordStore>(
    store: &S,
    name: String,
    age: u32,
    extra: Vec<(String, String)>,
) -> Result<RecordId> {
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(eyre!("name must not be empty"));
    }
    if age == 0 {
        return Err(eyre!("age must be a positive integer"));
    }
    if let Some((field, _)) = extra
        .iter()
        .find(|(field, _)| [fields::ID, fields::NAME, fields::AGE].contains(&field.as_str()))
    {
        return Err(eyre!("`{field}` cannot be set with --field"));
    }

    let mut records = store.load().await?;
    let id = fresh_id(&records);
    let mut record = Record::new(&id)
        .with(fields::NAME, name)
        .with(fields::AGE, age);
    for (field, value) in extra {
        record.insert(field, value);
    }
    records.insert(id.clone(), record);
    store.save(&records).await?;
    Ok(id)
}

async fn remove_record<S: RecordStore>(store: &S, id: &RecordId) -> Result<Record> {
    let mut records = store.load().await?;
    let removed = records
        .remove(id)
        .ok_or_else(|| eyre!("no record with id {id}"))?;
    store.save(&records).await?;
    Ok(removed)
}

async fn import_file<S: RecordStore>(store: &S, path: &Path) -> Result<usize> {
    let file = File::open(path).map_err(|e| eyre!("{}: {e}", path.display()))?;
    let mut records = store.load().await?;
    let imported = import_csv(file, &records)?;
    let count = imported.len();
    records.extend(imported);
    store.save(&records).await?;
    Ok(count)
}

fn summary_line(id: &RecordId, record: &Record) -> String {
    let name = record.name().unwrap_or("(unnamed)");
    match record.age() {
        Some(age) => format!("{id}  {name} ({age})"),
        None => format!("{id}  {name}"),
    }
}
