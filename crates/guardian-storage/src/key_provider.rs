use std::{
    fmt, fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use rand::{rngs::OsRng, RngCore};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// AES-256 key size in bytes.
pub const KEY_LEN: usize = 32;

/// Age after which a key is considered stale when rotation is enabled.
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Key material used for encryption at rest.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    /// Identifier for logging (never log key bytes).
    pub id: String,
    /// 256-bit symmetric key.
    pub bytes: [u8; KEY_LEN],
}

impl KeyMaterial {
    /// Fresh random key from the OS RNG.
    pub fn generate(id: impl Into<String>) -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self {
            id: id.into(),
            bytes,
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("id", &self.id)
            .field("bytes", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key file error: {0}")]
    Io(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("generation error: {0}")]
    Generation(String),
}

/// When a persisted key should be replaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RotationPolicy {
    #[default]
    Never,
    /// Key is due once its file is at least this old.
    MaxAge(Duration),
}

/// Provides access to the encryption key (key file in production; memory in tests).
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Existing key, or a newly generated and persisted one.
    async fn get_or_create(&self) -> Result<KeyMaterial, KeyError>;

    /// Persist `material` in place of the current key.
    async fn replace(&self, material: &KeyMaterial) -> Result<(), KeyError>;

    /// Keep `material` alongside the current key until [`KeyProvider::discard_previous`].
    ///
    /// Rotation retains the key that sealed the data before replacing it, so a
    /// crash before the data is re-sealed leaves both keys available.
    async fn retain_previous(&self, material: &KeyMaterial) -> Result<(), KeyError>;

    /// Key retained by a rotation that has not finished, if any.
    async fn previous(&self) -> Result<Option<KeyMaterial>, KeyError>;

    async fn discard_previous(&self) -> Result<(), KeyError>;

    /// Whether the rotation policy considers the current key stale.
    async fn rotation_due(&self) -> Result<bool, KeyError> {
        Ok(false)
    }
}

/// Key stored as exactly [`KEY_LEN`] raw bytes in a file, created on first use.
///
/// A retained previous key lives next to it in `<path>.prev`.
#[derive(Debug, Clone)]
pub struct FileKeyProvider {
    path: PathBuf,
    rotation: RotationPolicy,
}

impl FileKeyProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            rotation: RotationPolicy::Never,
        }
    }

    pub fn with_rotation(mut self, rotation: RotationPolicy) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn previous_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".prev");
        PathBuf::from(name)
    }

    fn key_id(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "key".to_string())
    }

    fn decode(&self, path: &Path, bytes: &[u8]) -> Result<KeyMaterial, KeyError> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            KeyError::Decode(format!(
                "{}: expected {KEY_LEN} bytes, got {}",
                path.display(),
                bytes.len()
            ))
        })?;
        Ok(KeyMaterial {
            id: self.key_id(),
            bytes,
        })
    }
}

#[async_trait]
impl KeyProvider for FileKeyProvider {
    #[instrument(skip_all, fields(path = %self.path.display()))]
    async fn get_or_create(&self) -> Result<KeyMaterial, KeyError> {
        match fs::read(&self.path) {
            Ok(bytes) => {
                debug!("loaded encryption key");
                self.decode(&self.path, &bytes)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let material = KeyMaterial::generate(self.key_id());
                write_key(&self.path, &material, false).map_err(|e| io_err(&self.path, e))?;
                info!("created new encryption key");
                Ok(material)
            }
            Err(err) => Err(io_err(&self.path, err)),
        }
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    async fn replace(&self, material: &KeyMaterial) -> Result<(), KeyError> {
        write_key(&self.path, material, true).map_err(|e| io_err(&self.path, e))?;
        info!("replaced encryption key");
        Ok(())
    }

    async fn retain_previous(&self, material: &KeyMaterial) -> Result<(), KeyError> {
        let path = self.previous_path();
        write_key(&path, material, true).map_err(|e| io_err(&path, e))?;
        debug!(path = %path.display(), "retained previous encryption key");
        Ok(())
    }

    async fn previous(&self) -> Result<Option<KeyMaterial>, KeyError> {
        let path = self.previous_path();
        match fs::read(&path) {
            Ok(bytes) => self.decode(&path, &bytes).map(Some),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_err(&path, err)),
        }
    }

    async fn discard_previous(&self) -> Result<(), KeyError> {
        let path = self.previous_path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(&path, err)),
        }
    }

    async fn rotation_due(&self) -> Result<bool, KeyError> {
        let RotationPolicy::MaxAge(max_age) = self.rotation else {
            return Ok(false);
        };
        let modified = match fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(io_err(&self.path, err)),
        };
        // A timestamp in the future counts as brand new.
        let age = modified.elapsed().unwrap_or_default();
        let due = age >= max_age;
        if due {
            warn!(
                path = %self.path.display(),
                age_days = age.as_secs() / 86_400,
                "encryption key is past its rotation interval"
            );
        }
        Ok(due)
    }
}

/// In-memory key provider for tests and ephemeral sessions.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyProvider {
    inner: Arc<Mutex<Option<KeyMaterial>>>,
    previous: Arc<Mutex<Option<KeyMaterial>>>,
}

fn lock(
    slot: &Mutex<Option<KeyMaterial>>,
) -> Result<MutexGuard<'_, Option<KeyMaterial>>, KeyError> {
    slot.lock()
        .map_err(|err| KeyError::Generation(format!("lock poisoned: {err}")))
}

#[async_trait]
impl KeyProvider for InMemoryKeyProvider {
    async fn get_or_create(&self) -> Result<KeyMaterial, KeyError> {
        let mut guard = lock(&self.inner)?;

        if let Some(existing) = guard.clone() {
            return Ok(existing);
        }

        let material = KeyMaterial::generate("memory");
        *guard = Some(material.clone());
        Ok(material)
    }

    async fn replace(&self, material: &KeyMaterial) -> Result<(), KeyError> {
        *lock(&self.inner)? = Some(material.clone());
        Ok(())
    }

    async fn retain_previous(&self, material: &KeyMaterial) -> Result<(), KeyError> {
        *lock(&self.previous)? = Some(material.clone());
        Ok(())
    }

    async fn previous(&self) -> Result<Option<KeyMaterial>, KeyError> {
        Ok(lock(&self.previous)?.clone())
    }

    async fn discard_previous(&self) -> Result<(), KeyError> {
        *lock(&self.previous)? = None;
        Ok(())
    }
}

/// Write the key through a temp file in the same directory, then move it into place.
/// Without `overwrite` an existing file is left alone and the call fails.
fn write_key(path: &Path, material: &KeyMaterial, overwrite: bool) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    // Temp files are created owner-only (0600 on Unix).
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(&material.bytes)?;
    tmp.as_file().sync_all()?;
    if overwrite {
        tmp.persist(path).map_err(|e| e.error)?;
    } else {
        tmp.persist_noclobber(path).map_err(|e| e.error)?;
    }
    Ok(())
}

fn io_err(path: &Path, err: io::Error) -> KeyError {
    KeyError::Io(format!("{}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_provider_returns_same_key() {
        let provider = InMemoryKeyProvider::default();
        let first = provider.get_or_create().await.unwrap();
        let second = provider.get_or_create().await.unwrap();

        assert_eq!(first.bytes, second.bytes);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn file_provider_creates_key_once_and_reloads_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keys").join("records.key");
        let provider = FileKeyProvider::new(&path);

        let created = provider.get_or_create().await.expect("create key");
        let on_disk = fs::read(&path).expect("key file written");
        assert_eq!(on_disk.len(), KEY_LEN);
        assert_eq!(on_disk, created.bytes);

        let reopened = FileKeyProvider::new(&path)
            .get_or_create()
            .await
            .expect("reload key");
        assert_eq!(reopened, created);
        assert_eq!(reopened.id, "records.key");
    }

    #[tokio::test]
    async fn file_provider_rejects_wrong_length() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("short.key");
        fs::write(&path, [7u8; 16]).expect("write short key");

        let err = FileKeyProvider::new(&path)
            .get_or_create()
            .await
            .expect_err("should reject wrong length");
        assert!(matches!(err, KeyError::Decode(_)));
    }

    #[tokio::test]
    async fn unreadable_key_path_is_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        // A directory where the key file should be.
        let err = FileKeyProvider::new(dir.path())
            .get_or_create()
            .await
            .expect_err("directory is not a key file");
        assert!(matches!(err, KeyError::Io(_)));
    }

    #[tokio::test]
    async fn replace_overwrites_persisted_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("records.key");
        let provider = FileKeyProvider::new(&path);
        let original = provider.get_or_create().await.expect("create key");

        let fresh = KeyMaterial::generate("records.key");
        provider.replace(&fresh).await.expect("replace key");

        let loaded = provider.get_or_create().await.expect("reload key");
        assert_eq!(loaded.bytes, fresh.bytes);
        assert_ne!(loaded.bytes, original.bytes);
    }

    #[tokio::test]
    async fn previous_key_is_kept_beside_the_key_file_until_discarded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = FileKeyProvider::new(dir.path().join("records.key"));
        assert_eq!(provider.previous().await.expect("none yet"), None);

        let old = provider.get_or_create().await.expect("create key");
        provider.retain_previous(&old).await.expect("retain");
        provider
            .replace(&KeyMaterial::generate("records.key"))
            .await
            .expect("replace");

        assert_eq!(
            fs::read(dir.path().join("records.key.prev")).expect("sidecar written"),
            old.bytes
        );
        let reopened = FileKeyProvider::new(dir.path().join("records.key"));
        assert_eq!(reopened.previous().await.expect("read sidecar"), Some(old));

        reopened.discard_previous().await.expect("discard");
        reopened.discard_previous().await.expect("discard twice");
        assert!(!reopened.previous_path().exists());
        assert_eq!(reopened.previous().await.expect("gone"), None);
    }

    #[tokio::test]
    async fn rotation_due_follows_policy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("records.key");

        let missing =
            FileKeyProvider::new(&path).with_rotation(RotationPolicy::MaxAge(Duration::ZERO));
        assert!(!missing.rotation_due().await.expect("missing key is never due"));

        FileKeyProvider::new(&path)
            .get_or_create()
            .await
            .expect("create key");

        let never = FileKeyProvider::new(&path);
        assert!(!never.rotation_due().await.expect("never policy"));

        let fresh = FileKeyProvider::new(&path)
            .with_rotation(RotationPolicy::MaxAge(DEFAULT_ROTATION_INTERVAL));
        assert!(!fresh.rotation_due().await.expect("fresh key"));

        let stale =
            FileKeyProvider::new(&path).with_rotation(RotationPolicy::MaxAge(Duration::ZERO));
        assert!(stale.rotation_due().await.expect("zero max age"));
    }

    #[test]
    fn debug_output_redacts_key_bytes() {
        let material = KeyMaterial {
            id: "k".into(),
            bytes: [0xAB; KEY_LEN],
        };
        let rendered = format!("{material:?}");
        assert!(rendered.contains("redacted"));
        assert!(!rendered.contains("171"));
    }
}
