//! Ambient configuration surface for the task-executor platform.
//!
//! One section per component named in the architecture (§2A, §6A): the
//! Rate-Limited Queue, the Sandbox Runtime, the Repair Tracker, and the
//! DS/WQ/OS/LS/ES adapters, plus logging. Loaded and validated by
//! [`crate::infrastructure::config::loader::ConfigLoader`].

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Config {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub rate_limit: RateLimitConfig,
    pub sandbox: SandboxConfig,
    pub repair_tracker: RepairTrackerConfig,
    pub work_queue: WorkQueueConfig,
    pub object_store: ObjectStoreConfig,
    pub llm_service: LlmServiceConfig,
    pub embedding_service: EmbeddingServiceConfig,
    pub provider: ProviderConfig,
}

/// Document Store connection settings (sqlite-backed per §6A).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

fn default_database_path() -> String {
    ".autoforge/autoforge.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: 10,
            connect_timeout_secs: 30,
        }
    }
}

/// Logging settings, translated into an
/// [`crate::infrastructure::logging::config::LogConfig`] at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub log_dir: Option<String>,
    pub enable_stdout: bool,
    pub rotation: String,
    pub retention_days: i64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
            log_dir: None,
            enable_stdout: true,
            rotation: "daily".to_string(),
            retention_days: 30,
        }
    }
}

/// Default RLQ knobs (spec §4.1: ~2 req/s, ~10,000 per 10 minutes, base 1s/cap 30s backoff).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub window_limit: usize,
    pub window_secs: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 2.0,
            window_limit: 10_000,
            window_secs: 600,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
        }
    }
}

/// Sandbox Runtime policy limits (spec §4.4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SandboxConfig {
    pub max_source_bytes: usize,
    pub compile_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_source_bytes: 50 * 1024,
            compile_timeout_secs: 5,
        }
    }
}

/// Repair Tracker limits (spec §4.7 defaults).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RepairTrackerConfig {
    pub max_repairs_per_task: u32,
    pub max_token_cost_per_template_per_day: u64,
    pub cooldown_secs: u64,
    pub gc_window_secs: u64,
}

impl Default for RepairTrackerConfig {
    fn default() -> Self {
        Self {
            max_repairs_per_task: 3,
            max_token_cost_per_template_per_day: 1_000_000,
            cooldown_secs: 360,
            gc_window_secs: 86_400,
        }
    }
}

/// Work Queue delivery settings (spec §6 WQ contract: at-least-once,
/// a visibility timeout at least as long as the worst-case task runtime).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct WorkQueueConfig {
    pub visibility_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 300,
            poll_interval_ms: 500,
        }
    }
}

/// Object Store backend selection (spec §6A: filesystem in dev/test, HTTP upload in production).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ObjectStoreConfig {
    pub backend: String,
    pub base_dir: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            backend: "filesystem".to_string(),
            base_dir: ".autoforge/objects".to_string(),
            base_url: None,
            api_key: None,
        }
    }
}

/// LLM Service connection settings (spec §6 LS contract).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct LlmServiceConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub default_model: String,
}

impl Default for LlmServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            api_key: None,
            default_model: "gemini-2.0-flash".to_string(),
        }
    }
}

/// Embedding Service connection settings (spec §6 ES contract).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct EmbeddingServiceConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub dimensions: usize,
}

impl Default for EmbeddingServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
        }
    }
}

/// The external provider RLQ requests are rate-limited against (spec §6
/// "Provider HTTP clients (per RLQ)"). `base_url` is unset by default since
/// no specific SaaS target is named by the spec; unset means templates'
/// `callAPI` always fails with a clear `InternalError` rather than silently
/// hitting some default host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ProviderConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

impl Config {
    pub fn sample_yaml() -> String {
        serde_yaml::to_string(&Config::default()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = Config::default();
        assert_eq!(config.database.path, ".autoforge/autoforge.db");
        assert_eq!(config.repair_tracker.max_repairs_per_task, 3);
        assert_eq!(
            config.repair_tracker.max_token_cost_per_template_per_day,
            1_000_000
        );
        assert_eq!(config.sandbox.max_source_bytes, 50 * 1024);
        assert!((config.rate_limit.requests_per_second - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn round_trips_through_yaml() {
        let yaml = Config::sample_yaml();
        let parsed: Config = serde_yaml::from_str(&yaml).expect("sample yaml should parse");
        assert_eq!(parsed, Config::default());
    }
}
