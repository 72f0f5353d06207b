//! Concrete adapters for the ambient external surface (spec §6A): Data
//! Store, Work Queue, Object Store, LLM Service, Embedding Service, and
//! Provider HTTP clients.

pub mod embeddings;
pub mod llm;
pub mod object_store;
pub mod provider;
pub mod sqlite;
