use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use crate::records::RecordSet;

/// Errors produced by record store implementations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Key or data file could not be accessed. Fatal to the operation.
    #[error("i/o failure: {reason}")]
    Io { reason: String },
    /// Stored ciphertext is corrupt, truncated, or sealed under another key.
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },
    /// Writing the new data failed after the previous file was set aside.
    #[error("persistence failed: {reason}")]
    Persistence { reason: String },
}

/// Durable persistence of the whole record mapping.
///
/// `save` replaces everything that was stored before; there is no
/// per-record update. Callers load, modify in memory, and save.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Current mapping, or an empty one when nothing has been saved yet.
    async fn load(&self) -> Result<RecordSet, StoreError>;

    /// Replace the stored mapping with `records`.
    async fn save(&self, records: &RecordSet) -> Result<(), StoreError>;
}

/// In-memory record store for tests and smoke runs.
#[derive(Debug, Default, Clone)]
pub struct InMemoryRecordStore {
    inner: Arc<Mutex<RecordSet>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn load(&self) -> Result<RecordSet, StoreError> {
        let records = self.inner.lock().map_err(|err| StoreError::Io {
            reason: format!("lock poisoned: {err}"),
        })?;
        Ok(records.clone())
    }

    async fn save(&self, records: &RecordSet) -> Result<(), StoreError> {
        let mut stored = self.inner.lock().map_err(|err| StoreError::Io {
            reason: format!("lock poisoned: {err}"),
        })?;
        *stored = records.clone();
        Ok(())
    }
}
