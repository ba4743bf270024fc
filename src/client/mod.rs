//! LLM backend clients.
//!
//! Provides a pluggable client abstraction backed by OpenAI-compatible
//! APIs, plus the declarative schema validator that turns raw model
//! output into typed values.
//!
//! # Architecture
//!
//! ```text
//! Router selection → ChatRequest (model, messages, json_mode)
//!   └── LlmClient (trait)
//!        └── OpenAiClient (async-openai, any compatible base URL)
//!   └── SchemaValidator (trait)
//!        └── LenientValidator (strip fences, parse, coerce)
//! ```

pub mod message;
pub mod provider;
pub mod providers;
pub mod registry;
pub mod schema;

pub use message::{ChatMessage, ChatRequest, ChatResponse, Role, TokenUsage};
pub use provider::{LlmClient, TextStream};
pub use registry::create_client;
pub use schema::{FieldSpec, LenientValidator, Schema, SchemaNode, SchemaValidator};
