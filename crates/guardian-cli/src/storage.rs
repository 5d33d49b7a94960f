use std::{path::PathBuf, time::Duration};

use crate::config::Config;
use color_eyre::{eyre::eyre, Result};
use dirs::data_dir;
use guardian_storage::{
    encrypted_store::{DecryptFailurePolicy, EncryptedFileStore},
    key_provider::{FileKeyProvider, KeyProvider, RotationPolicy},
};
use tracing::debug;

pub const RECORDS_FILE: &str = "records.bin";
pub const RECORDS_KEY_FILE: &str = "records.key";
pub const CHAT_FILE: &str = "chat.bin";
pub const CHAT_KEY_FILE: &str = "chat.key";
pub const SAVED_CHATS_FILE: &str = "saved_chats.bin";
pub const SAVED_CHATS_KEY_FILE: &str = "saved_chats.key";

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Resolve the default data directory for NeuroGuardian.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| eyre!("no data dir available"))?;
    Ok(base.join("neuroguardian"))
}

/// Data directory from config, falling back to the platform default.
pub fn resolve_data_dir(config: &Config) -> Result<PathBuf> {
    match &config.data_dir {
        Some(dir) => Ok(dir.clone()),
        None => default_data_dir(),
    }
}

/// Encrypted store holding the patient/doctor records.
pub fn record_store(config: &Config) -> Result<EncryptedFileStore<FileKeyProvider>> {
    open_store(config, RECORDS_FILE, RECORDS_KEY_FILE)
}

/// Encrypted store holding the chat transcript, keyed separately from the records.
pub fn chat_store(config: &Config) -> Result<EncryptedFileStore<FileKeyProvider>> {
    open_store(config, CHAT_FILE, CHAT_KEY_FILE)
}

/// Encrypted store holding conversations saved under a name.
pub fn saved_chats_store(config: &Config) -> Result<EncryptedFileStore<FileKeyProvider>> {
    open_store(config, SAVED_CHATS_FILE, SAVED_CHATS_KEY_FILE)
}

/// For commands that load, modify and save: an unreadable file is an error,
/// never an empty starting point that the save would then replace.
pub fn for_update<P: KeyProvider>(store: EncryptedFileStore<P>) -> EncryptedFileStore<P> {
    store.with_decrypt_failure_policy(DecryptFailurePolicy::Fail)
}

fn open_store(
    config: &Config,
    data_file: &str,
    key_file: &str,
) -> Result<EncryptedFileStore<FileKeyProvider>> {
    let root = resolve_data_dir(config)?;
    debug!(?root, data_file, "initializing encrypted store");

    let rotation = match config.key_rotation_days {
        Some(days) => {
            let secs = days
                .checked_mul(SECS_PER_DAY)
                .ok_or_else(|| eyre!("key_rotation_days is too large: {days}"))?;
            RotationPolicy::MaxAge(Duration::from_secs(secs))
        }
        None => RotationPolicy::Never,
    };
    let policy = if config.strict_decrypt {
        DecryptFailurePolicy::Fail
    } else {
        DecryptFailurePolicy::TreatAsEmpty
    };

    Ok(EncryptedFileStore::new(
        root.join(data_file),
        FileKeyProvider::new(root.join(key_file)).with_rotation(rotation),
    )
    .with_decrypt_failure_policy(policy))
}

/// Helper for tests to construct a store in a temp dir with an in-memory key.
#[cfg(test)]
pub fn test_store(
    root: &std::path::Path,
) -> EncryptedFileStore<guardian_storage::key_provider::InMemoryKeyProvider> {
    EncryptedFileStore::new(
        root.join(RECORDS_FILE),
        guardian_storage::key_provider::InMemoryKeyProvider::default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_live_under_configured_data_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config {
            data_dir: Some(dir.path().to_path_buf()),
            ..Config::default()
        };

        let records = record_store(&config).expect("record store");
        let chat = chat_store(&config).expect("chat store");

        assert_eq!(records.path(), dir.path().join(RECORDS_FILE));
        assert_eq!(records.key_provider().path(), dir.path().join(RECORDS_KEY_FILE));
        assert_eq!(chat.path(), dir.path().join(CHAT_FILE));
        assert_eq!(chat.key_provider().path(), dir.path().join(CHAT_KEY_FILE));

        let saved = saved_chats_store(&config).expect("saved chats store");
        assert_eq!(saved.path(), dir.path().join(SAVED_CHATS_FILE));
        assert_eq!(
            saved.key_provider().path(),
            dir.path().join(SAVED_CHATS_KEY_FILE)
        );
    }

    #[test]
    fn oversized_rotation_interval_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config {
            data_dir: Some(dir.path().to_path_buf()),
            key_rotation_days: Some(u64::MAX),
            ..Config::default()
        };

        let Err(err) = record_store(&config) else {
            panic!("overflowing interval should be rejected");
        };
        assert!(err.to_string().contains("key_rotation_days"));

        let config = Config {
            key_rotation_days: Some(365),
            ..config
        };
        assert!(record_store(&config).is_ok());
    }
}
