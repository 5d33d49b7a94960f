//! Concrete record storage with encryption at rest.
//! AES-256-GCM with keys kept in a raw key file (or test doubles), and a
//! rename/write/delete save protocol that always leaves one readable copy.

pub mod codec;
pub mod encrypted_store;
pub mod key_provider;
