use std::{
    ffi::OsString,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use guardian_core::{
    records::RecordSet,
    storage::{RecordStore, StoreError},
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    codec::{CodecError, RecordCodec},
    key_provider::{KeyError, KeyMaterial, KeyProvider},
};

/// What `load` does when the data file exists but cannot be decrypted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecryptFailurePolicy {
    /// Log a warning and behave as if nothing had been stored.
    #[default]
    TreatAsEmpty,
    /// Surface [`StoreError::Decryption`].
    Fail,
}

/// AES-GCM encrypted single-file store implementing the shared `RecordStore` contract.
///
/// `save` moves the current file to `<path>.bak`, writes the new file, then
/// deletes the backup. If the write fails the backup is moved back. A crash in
/// between leaves the old data in the backup or the new data in the primary;
/// `load` only ever reads the primary and never restores from the backup.
/// A backup found at the start of a save belongs to an interrupted save and is
/// renamed to `<path>.bak.<unix seconds>` rather than overwritten; see
/// [`EncryptedFileStore::kept_backups`].
///
/// Key rotation retains the key that sealed the data with the key provider
/// until the data file has been re-sealed, and `load` falls back to that key,
/// so an interrupted rotation loses nothing.
///
/// There is no lock around that sequence: two concurrent writers on the same
/// path can lose the backup or corrupt the primary.
pub struct EncryptedFileStore<P: KeyProvider> {
    path: PathBuf,
    key_provider: P,
    on_decrypt_failure: DecryptFailurePolicy,
}

impl<P: KeyProvider> EncryptedFileStore<P> {
    pub fn new(path: impl Into<PathBuf>, key_provider: P) -> Self {
        Self {
            path: path.into(),
            key_provider,
            on_decrypt_failure: DecryptFailurePolicy::default(),
        }
    }

    pub fn with_decrypt_failure_policy(mut self, policy: DecryptFailurePolicy) -> Self {
        self.on_decrypt_failure = policy;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".bak");
        PathBuf::from(name)
    }

    pub fn key_provider(&self) -> &P {
        &self.key_provider
    }

    /// Backups set aside by saves that found an earlier backup in place, sorted by name.
    pub fn kept_backups(&self) -> Result<Vec<PathBuf>, StoreError> {
        let backup = self.backup_path();
        let Some(name) = backup.file_name() else {
            return Ok(Vec::new());
        };
        let prefix = format!("{}.", name.to_string_lossy());

        let dir = parent_dir(&self.path).unwrap_or(Path::new("."));
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_err(dir, err)),
        };
        let mut kept = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_err(dir, e))?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                kept.push(entry.path());
            }
        }
        kept.sort();
        Ok(kept)
    }

    async fn codec(&self) -> Result<RecordCodec, StoreError> {
        let material = self.key_provider.get_or_create().await.map_err(key_err)?;
        RecordCodec::new(&material).map_err(codec_err)
    }

    /// Decrypt the stored document, or `T::default()` when there is no file yet.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub async fn load_document<T: DeserializeOwned + Default>(&self) -> Result<T, StoreError> {
        let Some(blob) = read_if_exists(&self.path)? else {
            debug!("no data file yet");
            return Ok(T::default());
        };

        let codec = self.codec().await?;
        let err = match codec.open(&blob) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        match self.open_with_retained_key(&blob, RecordCodec::open::<T>).await? {
            Some((_, value)) => Ok(value),
            None => match self.on_decrypt_failure {
                DecryptFailurePolicy::TreatAsEmpty => {
                    warn!("data file could not be decrypted, treating store as empty: {err}");
                    Ok(T::default())
                }
                DecryptFailurePolicy::Fail => Err(codec_err(err)),
            },
        }
    }

    /// Open `blob` with the key retained by an unfinished rotation, if there is one and it fits.
    async fn open_with_retained_key<T, F>(
        &self,
        blob: &[u8],
        open: F,
    ) -> Result<Option<(KeyMaterial, T)>, StoreError>
    where
        F: Fn(&RecordCodec, &[u8]) -> Result<T, CodecError>,
    {
        let Some(previous) = self.key_provider.previous().await.map_err(key_err)? else {
            return Ok(None);
        };
        match RecordCodec::new(&previous).and_then(|codec| open(&codec, blob)) {
            Ok(value) => {
                warn!("data file is still sealed under the key of an unfinished rotation");
                Ok(Some((previous, value)))
            }
            Err(err) => {
                debug!("retained key does not open the data file either: {err}");
                Ok(None)
            }
        }
    }

    /// Encrypt `value` and replace the stored document using the backup protocol.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub async fn save_document<T: Serialize + Sync + ?Sized>(
        &self,
        value: &T,
    ) -> Result<(), StoreError> {
        let codec = self.codec().await?;
        let blob = codec.seal(value).map_err(codec_err)?;
        self.replace_with(&blob, write_new_file)
    }

    /// Re-encrypt the data file under a freshly generated key.
    ///
    /// The current file must decrypt cleanly, with the current key or one
    /// retained by an earlier interrupted rotation, otherwise nothing changes.
    /// Returns whether a data file was re-encrypted.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub async fn rotate_key(&self) -> Result<bool, StoreError> {
        let current = self.key_provider.get_or_create().await.map_err(key_err)?;
        let fresh = KeyMaterial::generate(current.id.clone());

        let Some(blob) = read_if_exists(&self.path)? else {
            self.key_provider.replace(&fresh).await.map_err(key_err)?;
            info!("rotated key, no data file to re-encrypt");
            return Ok(false);
        };

        let (sealing, plaintext) = match RecordCodec::new(&current)
            .and_then(|codec| codec.open_bytes(&blob))
        {
            Ok(plaintext) => (current, plaintext),
            Err(err) => self
                .open_with_retained_key(&blob, RecordCodec::open_bytes)
                .await?
                .ok_or_else(|| codec_err(err))?,
        };

        // Until the data file is re-sealed, the key that opens it must stay on disk.
        self.key_provider
            .retain_previous(&sealing)
            .await
            .map_err(key_err)?;
        self.key_provider.replace(&fresh).await.map_err(key_err)?;

        let blob = RecordCodec::new(&fresh)
            .and_then(|codec| codec.seal_bytes(&plaintext))
            .map_err(codec_err);
        if let Err(err) = blob.and_then(|blob| self.replace_with(&blob, write_new_file)) {
            match self.key_provider.replace(&sealing).await {
                Ok(()) => self.discard_retained_key().await,
                Err(restore) => error!(
                    "previous key could not be restored after failed re-encryption, \
                     it is still retained by the key provider: {restore}"
                ),
            }
            return Err(err);
        }

        self.discard_retained_key().await;
        info!("rotated key and re-encrypted data file");
        Ok(true)
    }

    async fn discard_retained_key(&self) {
        if let Err(err) = self.key_provider.discard_previous().await {
            warn!("retained previous key could not be removed: {err}");
        }
    }

    /// [`EncryptedFileStore::rotate_key`] when the provider's rotation policy says so.
    pub async fn rotate_key_if_due(&self) -> Result<bool, StoreError> {
        if !self.key_provider.rotation_due().await.map_err(key_err)? {
            return Ok(false);
        }
        self.rotate_key().await?;
        Ok(true)
    }

    fn replace_with<W>(&self, blob: &[u8], write: W) -> Result<(), StoreError>
    where
        W: FnOnce(&Path, &[u8]) -> io::Result<()>,
    {
        if let Some(parent) = parent_dir(&self.path) {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }

        let backup = self.backup_path();
        if backup.exists() {
            let kept = set_aside(&backup)?;
            warn!(
                backup = %kept.display(),
                "backup from an interrupted save was kept under a new name"
            );
        }

        let rotated = match fs::rename(&self.path, &backup) {
            Ok(()) => true,
            Err(err) if err.kind() == io::ErrorKind::NotFound => false,
            Err(err) => return Err(io_err(&self.path, err)),
        };

        if let Err(err) = write(&self.path, blob) {
            self.restore_after_failed_write(rotated, &backup);
            return Err(StoreError::Persistence {
                reason: format!("{}: {err}", self.path.display()),
            });
        }

        if rotated {
            if let Err(err) = fs::remove_file(&backup) {
                warn!(backup = %backup.display(), "backup could not be removed after save: {err}");
            }
        }
        debug!(bytes = blob.len(), "saved encrypted data file");
        Ok(())
    }

    fn restore_after_failed_write(&self, rotated: bool, backup: &Path) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("removed partial data file"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!("partial data file could not be removed: {err}"),
        }
        if !rotated {
            return;
        }
        match fs::rename(backup, &self.path) {
            Ok(()) => info!("restored previous data file after failed write"),
            Err(err) => error!(
                backup = %backup.display(),
                "previous data file could not be restored, it remains at the backup path: {err}"
            ),
        }
    }
}

#[async_trait]
impl<P: KeyProvider> RecordStore for EncryptedFileStore<P> {
    async fn load(&self) -> Result<RecordSet, StoreError> {
        self.load_document().await
    }

    async fn save(&self, records: &RecordSet) -> Result<(), StoreError> {
        self.save_document(records).await
    }
}

fn write_new_file(path: &Path, blob: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(blob)?;
    file.sync_all()
}

/// Rename `backup` to `<backup>.<unix seconds>`, adding a counter on collision.
fn set_aside(backup: &Path) -> Result<PathBuf, StoreError> {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let named = |suffix: String| {
        let mut name = backup.as_os_str().to_os_string();
        name.push(".");
        name.push(suffix);
        PathBuf::from(name)
    };

    let mut target = named(stamp.to_string());
    let mut attempt = 1;
    while target.exists() {
        target = named(format!("{stamp}-{attempt}"));
        attempt += 1;
    }
    fs::rename(backup, &target).map_err(|e| io_err(backup, e))?;
    Ok(target)
}

fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(path, err)),
    }
}

fn parent_dir(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| !p.as_os_str().is_empty())
}

fn io_err(path: &Path, err: io::Error) -> StoreError {
    StoreError::Io {
        reason: format!("{}: {err}", path.display()),
    }
}

fn key_err(err: KeyError) -> StoreError {
    StoreError::Io {
        reason: format!("key provider: {err}"),
    }
}

fn codec_err(err: CodecError) -> StoreError {
    match err {
        CodecError::Decrypt(reason) => StoreError::Decryption { reason },
        other => StoreError::Persistence {
            reason: other.to_string(),
        },
    }
}
