//! Domain ports: the interfaces services depend on, implemented by adapters.

pub mod embedding;
pub mod llm_service;
pub mod memory_repository;
pub mod null_embedding;
pub mod null_llm;
pub mod object_store;
pub mod provider_client;
pub mod repairer;
pub mod task_repository;
pub mod template_repository;
pub mod work_queue;

pub use embedding::{EmbeddingInput, EmbeddingOutput, EmbeddingProvider};
pub use llm_service::{CompletionRequest, CompletionResponse, LlmService};
pub use memory_repository::MemoryRepository;
pub use null_embedding::NullEmbeddingProvider;
pub use null_llm::NullLlmService;
pub use object_store::ObjectStore;
pub use provider_client::ProviderClient;
pub use repairer::Repairer;
pub use task_repository::{TaskFilter, TaskRepository};
pub use template_repository::TemplateRepositoryPort;
pub use work_queue::{WorkItem, WorkQueue};
