//! Wire models for the Chat Completions API.

pub mod chat;
