//! Embedding provider adapters (spec §6A's concrete Embedding Service).

pub mod openai;

pub use openai::{OpenAiEmbeddingConfig, OpenAiEmbeddingProvider};
