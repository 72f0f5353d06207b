//! Object store adapters (spec §6A's concrete Object Store).

pub mod filesystem;
pub mod http;

pub use filesystem::FilesystemObjectStore;
pub use http::{HttpObjectStore, HttpObjectStoreConfig};
