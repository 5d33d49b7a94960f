//! Core abstractions for NeuroGuardian: the record model, the record store
//! contract, and the completion contract used by the chat assistant.
//! This crate is intentionally small to keep dependency surface minimal.

pub mod chat;
pub mod completion;
pub mod records;
pub mod storage;
