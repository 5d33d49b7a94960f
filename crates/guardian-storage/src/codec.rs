//! Reversible transform between structured data and an opaque encrypted blob.
//!
//! Blob layout: `[nonce (12 bytes)] || [ciphertext + 16-byte GCM tag]`, where the
//! plaintext is the JSON serialization of the value.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use guardian_core::records::RecordSet;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::key_provider::KeyMaterial;

/// GCM nonce size in bytes (96-bit).
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag size in bytes.
pub const TAG_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("serialize failed: {0}")]
    Serialize(String),
    #[error("encrypt failed: {0}")]
    Encrypt(String),
    /// Corrupt, truncated, or sealed under a different key.
    #[error("decrypt failed: {0}")]
    Decrypt(String),
}

/// AES-256-GCM codec bound to one key.
pub struct RecordCodec {
    cipher: Aes256Gcm,
}

impl RecordCodec {
    pub fn new(material: &KeyMaterial) -> Result<Self, CodecError> {
        let cipher = Aes256Gcm::new_from_slice(&material.bytes)
            .map_err(|e| CodecError::Encrypt(format!("cipher init failed: {e}")))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, records: &RecordSet) -> Result<Vec<u8>, CodecError> {
        self.seal(records)
    }

    pub fn decrypt(&self, blob: &[u8]) -> Result<RecordSet, CodecError> {
        self.open(blob)
    }

    pub fn seal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let plaintext =
            serde_json::to_vec(value).map_err(|e| CodecError::Serialize(e.to_string()))?;
        self.seal_bytes(&plaintext)
    }

    pub fn open<T: DeserializeOwned>(&self, blob: &[u8]) -> Result<T, CodecError> {
        let plaintext = self.open_bytes(blob)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| CodecError::Decrypt(format!("malformed plaintext: {e}")))
    }

    pub fn seal_bytes(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| CodecError::Encrypt(e.to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(nonce.as_slice());
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn open_bytes(&self, blob: &[u8]) -> Result<Vec<u8>, CodecError> {
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(CodecError::Decrypt(format!(
                "blob too short: {} bytes",
                blob.len()
            )));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| CodecError::Decrypt(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use guardian_core::records::{fields, Record, RecordId};

    use super::*;

    fn sample_records() -> RecordSet {
        let ann = RecordId::from("a1b2c3d4");
        let doc = RecordId::from("d0c70r11");
        let mut records = RecordSet::new();
        records.insert(
            ann.clone(),
            Record::new(&ann)
                .with(fields::NAME, "Ann")
                .with(fields::AGE, 40_i64)
                .with(fields::MEDICAL_HISTORY, "Asthma, Allergy")
                .with("bmi", 22.4),
        );
        records.insert(
            doc.clone(),
            Record::new(&doc).with(fields::NAME, "Dr. Ruiz").with(
                "patients",
                vec![Record::new(&ann).with(fields::NAME, "Ann")],
            ),
        );
        records
    }

    fn codec() -> RecordCodec {
        RecordCodec::new(&KeyMaterial::generate("test")).expect("codec")
    }

    #[test]
    fn round_trip_restores_records() {
        let codec = codec();
        let records = sample_records();

        let blob = codec.encrypt(&records).expect("encrypt");
        assert_eq!(codec.decrypt(&blob).expect("decrypt"), records);

        let empty = codec.encrypt(&RecordSet::new()).expect("encrypt empty");
        assert!(codec.decrypt(&empty).expect("decrypt empty").is_empty());
    }

    #[test]
    fn ciphertext_is_not_stable_and_hides_plaintext() {
        let codec = codec();
        let records = sample_records();

        let first = codec.encrypt(&records).expect("encrypt");
        let second = codec.encrypt(&records).expect("encrypt");
        assert_ne!(first, second, "fresh nonce per call");

        let needle = b"Asthma";
        assert!(!first.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn wrong_key_is_decrypt_error() {
        let blob = codec().encrypt(&sample_records()).expect("encrypt");
        let err = codec().decrypt(&blob).expect_err("other key must fail");
        assert!(matches!(err, CodecError::Decrypt(_)));
    }

    #[test]
    fn truncated_or_tampered_blob_is_decrypt_error() {
        let codec = codec();
        let mut blob = codec.encrypt(&sample_records()).expect("encrypt");

        let err = codec.decrypt(&blob[..NONCE_LEN + 4]).expect_err("truncated");
        assert!(matches!(err, CodecError::Decrypt(_)));

        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        let err = codec.decrypt(&blob).expect_err("tampered");
        assert!(matches!(err, CodecError::Decrypt(_)));
    }

    #[test]
    fn wrong_shape_plaintext_is_decrypt_error() {
        let codec = codec();
        let blob = codec.seal(&vec![1, 2, 3]).expect("seal");
        let err = codec.decrypt(&blob).expect_err("not a record mapping");
        assert!(matches!(err, CodecError::Decrypt(_)));
    }
}
