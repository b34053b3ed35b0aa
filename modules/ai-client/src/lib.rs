//! Minimal chat-completion client for OpenAI-compatible APIs.
//!
//! Exposes a single `ChatModel` trait so every call site can be stubbed
//! in tests, plus the production `OpenAiClient`.

pub mod client;
pub mod types;
pub mod util;

pub use client::OpenAiClient;
pub use types::{ChatMessage, ChatModel, ChatRequest};
pub use util::extract_json;
