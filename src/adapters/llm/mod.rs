//! LLM service adapters (spec §6A's concrete LLM Service).

pub mod gemini;

pub use gemini::{GeminiConfig, GeminiLlmService};
