//! Completion providers backed by hosted chat-completion APIs.

pub mod openai;
