//! Provider HTTP client adapters (spec §6 "Provider HTTP clients (per RLQ)").

pub mod http_client;

pub use http_client::{HttpProviderClient, HttpProviderClientConfig};
