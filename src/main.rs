//! autoforge CLI entry point.
//!
//! Operational convenience over the Task Orchestrator / Template Repository
//! / Repair Tracker service API (spec §6A) — `task {submit,cancel,show,retry}`,
//! `template {create,update,list,delete}`, `repair stats`. No HTTP/webhook
//! front-end is started; the in-process Work Queue poller this binary spawns
//! is the only "worker" that ever exists.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use serde_json::Value;

use autoforge::adapters::embeddings::OpenAiEmbeddingProvider;
use autoforge::adapters::llm::GeminiLlmService;
use autoforge::adapters::object_store::{FilesystemObjectStore, HttpObjectStore, HttpObjectStoreConfig};
use autoforge::adapters::provider::{HttpProviderClient, HttpProviderClientConfig};
use autoforge::adapters::sqlite::{
    self, SqliteMemoryRepository, SqliteTaskRepository, SqliteTemplateRepository, SqliteWorkQueue,
};
use autoforge::domain::errors::{DomainResult, TaskError};
use autoforge::domain::models::config::Config;
use autoforge::domain::models::Template;
use autoforge::domain::ports::{
    EmbeddingProvider, LlmService, NullEmbeddingProvider, NullLlmService, ObjectStore, ProviderClient, Repairer, WorkQueue,
};
use autoforge::infrastructure::config::ConfigLoader;
use autoforge::infrastructure::logging::{LogConfig, LogFormat, LoggerImpl, RotationPolicy};
use autoforge::services::rate_limited_queue::{ApiCaller, RateLimitedQueue};
use autoforge::services::repair_engine::{RepairEngine, RepairEngineConfig};
use autoforge::services::repair_tracker::RepairTracker;
use autoforge::services::sandbox::SandboxPolicy;
use autoforge::services::task_orchestrator::ExecutionDeps;
use autoforge::services::template_repository::TemplateRepository;
use autoforge::services::{GeminiModelConfig, TaskOrchestrator, TemplateMatcher};

#[derive(Parser)]
#[command(name = "autoforge", version, about = "Auto-healing dynamic task executor")]
struct Cli {
    /// Load configuration from this file instead of the default search path.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit, cancel, inspect, or retry tasks.
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
    /// Manage automation templates.
    Template {
        #[command(subcommand)]
        command: TemplateCommand,
    },
    /// Repair-budget operational commands.
    Repair {
        #[command(subcommand)]
        command: RepairCommand,
    },
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Enqueue a task and run it to completion against the in-process worker.
    Submit {
        template_id: String,
        /// Created-by user id.
        #[arg(long)]
        user: String,
        /// JSON object of template parameters.
        #[arg(long, default_value = "{}")]
        parameters: String,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        #[arg(long)]
        testing: bool,
    },
    Cancel {
        task_id: String,
    },
    Show {
        task_id: String,
    },
    /// Retry a task against its (presumably manually repaired) template.
    Retry {
        task_id: String,
        #[arg(long)]
        user: String,
    },
}

#[derive(Subcommand)]
enum TemplateCommand {
    Create {
        id: String,
        name: String,
        /// Path to the sandboxed execution script.
        script: PathBuf,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },
    Update {
        id: String,
        /// Path to the replacement execution script.
        script: PathBuf,
        /// Mark the script as already auto-escape-recovered.
        #[arg(long)]
        escaped: bool,
    },
    List,
    Delete {
        id: String,
    },
}

#[derive(Subcommand)]
enum RepairCommand {
    /// Print the configured repair-budget limits (spec §4.7). The tracker
    /// itself is in-process only (DESIGN.md decision), so per-task/per-
    /// template spend never survives a CLI invocation boundary.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path).context("loading configuration")?,
        None => ConfigLoader::load().context("loading configuration")?,
    };

    let _logger = LoggerImpl::init(&to_log_config(&config.logging)).context("initializing logging")?;

    let database_url = format!("sqlite:{}", config.database.path);
    let pool = sqlite::initialize_database(&database_url).await.context("initializing database")?;

    let tasks = Arc::new(SqliteTaskRepository::new(pool.clone()));
    let work_queue = Arc::new(SqliteWorkQueue::new(pool.clone()));
    let memory_repo = Arc::new(SqliteMemoryRepository::new(pool.clone()));
    let template_repo = Arc::new(SqliteTemplateRepository::new(pool.clone()));

    let embeddings = Arc::new(build_embedding_provider(&config));
    let llm = build_llm_service(&config);
    let object_store = build_object_store(&config);
    let api: Arc<dyn ApiCaller> = build_api_caller(&config);

    let sandbox_policy = SandboxPolicy {
        max_source_bytes: config.sandbox.max_source_bytes,
        ..SandboxPolicy::default()
    };
    let templates = Arc::new(TemplateRepository::new(template_repo, embeddings.clone(), sandbox_policy.clone()));
    let memory = Arc::new(autoforge::services::MemoryStore::new(memory_repo, embeddings.clone()));
    let tracker = Arc::new(RepairTracker::new());
    let repair_engine_config = RepairEngineConfig {
        memory_top_k: 5,
        memory_min_success_rate: 0.5,
        repair_max_tokens: 4096,
    };
    let repairer: Arc<dyn Repairer> =
        Arc::new(RepairEngine::new(templates.clone(), memory.clone(), llm.clone(), tracker.clone(), sandbox_policy, repair_engine_config));

    let gemini = GeminiModelConfig {
        valid_models: vec![config.llm_service.default_model.clone()],
        default_model: config.llm_service.default_model.clone(),
    };
    let deps = ExecutionDeps { api, llm: llm.clone(), object_store, memory, repairer, gemini };
    let orchestrator = Arc::new(TaskOrchestrator::new(tasks.clone(), templates.clone(), work_queue.clone(), deps));
    let matcher = TemplateMatcher::new(llm);

    let exit_code = match cli.command {
        Command::Task { command } => run_task_command(command, &orchestrator, &work_queue, &config).await,
        Command::Template { command } => run_template_command(command, &templates).await,
        Command::Repair { command } => run_repair_command(command, &config),
    };
    let _ = matcher; // constructed for parity with the assembled service graph; dispatched via TaskOrchestrator

    match exit_code {
        Ok(()) => Ok(()),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

fn to_log_config(config: &autoforge::domain::models::config::LoggingConfig) -> LogConfig {
    LogConfig {
        level: config.level.clone(),
        format: if config.format == "pretty" { LogFormat::Pretty } else { LogFormat::Json },
        log_dir: config.log_dir.clone().map(PathBuf::from),
        enable_stdout: config.enable_stdout,
        rotation: match config.rotation.as_str() {
            "hourly" => RotationPolicy::Hourly,
            "never" => RotationPolicy::Never,
            _ => RotationPolicy::Daily,
        },
        retention_days: config.retention_days,
    }
}

fn build_embedding_provider(config: &Config) -> Arc<dyn EmbeddingProvider> {
    if config.embedding_service.api_key.is_some() || std::env::var_os("OPENAI_API_KEY").is_some() {
        Arc::new(OpenAiEmbeddingProvider::new(autoforge::adapters::embeddings::OpenAiEmbeddingConfig {
            api_key: config.embedding_service.api_key.clone(),
            base_url: config.embedding_service.base_url.clone(),
            model: config.embedding_service.model.clone(),
            dimension: config.embedding_service.dimensions,
            timeout_secs: 30,
            max_batch_size: 2048,
        }))
    } else {
        Arc::new(NullEmbeddingProvider::new())
    }
}

fn build_llm_service(config: &Config) -> Arc<dyn LlmService> {
    if config.llm_service.api_key.is_some() || std::env::var_os("GEMINI_API_KEY").is_some() {
        Arc::new(GeminiLlmService::new(autoforge::adapters::llm::GeminiConfig {
            api_key: config.llm_service.api_key.clone(),
            base_url: config.llm_service.base_url.clone(),
            model: config.llm_service.default_model.clone(),
            timeout_secs: 60,
        }))
    } else {
        Arc::new(NullLlmService::new())
    }
}

fn build_object_store(config: &Config) -> Arc<dyn ObjectStore> {
    if config.object_store.backend == "http" {
        let base_url = config.object_store.base_url.clone().unwrap_or_default();
        Arc::new(HttpObjectStore::new(HttpObjectStoreConfig {
            base_url,
            api_key: config.object_store.api_key.clone(),
            timeout_secs: 30,
        }))
    } else {
        Arc::new(FilesystemObjectStore::new(config.object_store.base_dir.clone()))
    }
}

/// No provider target is named by the spec (templates call into whichever
/// external API their own `callAPI` steps name); `provider.base_url` unset
/// means `callAPI` surfaces a clear `InternalError` instead of silently
/// dispatching somewhere.
struct NoProviderConfigured;

#[async_trait]
impl ProviderClient for NoProviderConfigured {
    fn name(&self) -> &'static str {
        "unconfigured"
    }

    async fn call(&self, _method: &str, _params: Value) -> DomainResult<Value> {
        Err(TaskError::InternalError("no provider configured (set `provider.base_url`)".to_string()))
    }
}

fn build_api_caller(config: &Config) -> Arc<dyn ApiCaller> {
    match &config.provider.base_url {
        Some(base_url) => {
            let client = Arc::new(HttpProviderClient::new(HttpProviderClientConfig {
                name: "provider",
                base_url: base_url.clone(),
                api_key: config.provider.api_key.clone(),
                timeout_secs: 30,
            }));
            Arc::new(
                RateLimitedQueue::new(
                    client,
                    config.rate_limit.requests_per_second,
                    config.rate_limit.window_limit,
                    config.rate_limit.window_secs,
                )
                .with_backoff(autoforge::services::rate_limited_queue::BackoffPolicy {
                    initial_backoff_ms: config.rate_limit.initial_backoff_ms,
                    max_backoff_ms: config.rate_limit.max_backoff_ms,
                }),
            )
        }
        None => {
            let client = Arc::new(NoProviderConfigured);
            Arc::new(RateLimitedQueue::new(
                client,
                config.rate_limit.requests_per_second,
                config.rate_limit.window_limit,
                config.rate_limit.window_secs,
            ))
        }
    }
}

async fn run_task_command(
    command: TaskCommand,
    orchestrator: &Arc<TaskOrchestrator>,
    work_queue: &Arc<SqliteWorkQueue>,
    config: &Config,
) -> Result<()> {
    match command {
        TaskCommand::Submit { template_id, user, parameters, priority, testing } => {
            let parsed: HashMap<String, Value> =
                serde_json::from_str(&parameters).context("parsing --parameters as a JSON object")?;
            let task_id = orchestrator
                .enqueue(&template_id, parsed, &user, priority, None, testing)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            println!("submitted task {task_id}");
            drain_worker_queue(orchestrator, work_queue, config, &task_id).await?;
            print_task(orchestrator, &task_id).await
        }
        TaskCommand::Cancel { task_id } => {
            orchestrator.cancel(&task_id).await.map_err(|e| anyhow::anyhow!(e))?;
            println!("cancelled {task_id}");
            Ok(())
        }
        TaskCommand::Show { task_id } => print_task(orchestrator, &task_id).await,
        TaskCommand::Retry { task_id, user } => {
            let retry_id = orchestrator.retry_with_repaired_template(&task_id, &user).await.map_err(|e| anyhow::anyhow!(e))?;
            println!("retrying as task {retry_id}");
            drain_worker_queue(orchestrator, work_queue, config, &retry_id).await?;
            print_task(orchestrator, &retry_id).await
        }
    }
}

/// Runs the in-process Work Queue poller (spec §6A) until `watch_task_id`
/// reaches a terminal status, bounded by `poll_interval_ms * 200` as a
/// worst-case wait so a stuck task can't hang the CLI forever.
async fn drain_worker_queue(
    orchestrator: &Arc<TaskOrchestrator>,
    work_queue: &Arc<SqliteWorkQueue>,
    config: &Config,
    watch_task_id: &str,
) -> Result<()> {
    let poll_interval = Duration::from_millis(config.work_queue.poll_interval_ms);
    for _ in 0..200 {
        let items = work_queue.dequeue(10, config.work_queue.visibility_timeout_secs).await.map_err(|e| anyhow::anyhow!(e))?;
        for item in &items {
            orchestrator.dispatch(&item.task_id).await.map_err(|e| anyhow::anyhow!(e))?;
            work_queue.ack(&item.receipt).await.map_err(|e| anyhow::anyhow!(e))?;
        }
        if let Some(task) = orchestrator.get_task(watch_task_id).await.map_err(|e| anyhow::anyhow!(e))? {
            if task.status.is_terminal() {
                return Ok(());
            }
        }
        if items.is_empty() {
            tokio::time::sleep(poll_interval).await;
        }
    }
    Ok(())
}

async fn print_task(orchestrator: &Arc<TaskOrchestrator>, task_id: &str) -> Result<()> {
    let Some(task) = orchestrator.get_task(task_id).await.map_err(|e| anyhow::anyhow!(e))? else {
        println!("task {task_id} not found");
        return Ok(());
    };
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["field", "value"]);
    table.add_row(vec!["id", &task.id]);
    table.add_row(vec!["template_id", &task.template_id]);
    table.add_row(vec!["status", task.status.as_str()]);
    table.add_row(vec!["priority", &task.priority.to_string()]);
    if let Some(result) = &task.result {
        table.add_row(vec!["summary", &result.summary]);
    }
    if let Some(retry_id) = &task.retry_task_id {
        table.add_row(vec!["retry_task_id", retry_id]);
    }
    for error in &task.errors {
        table.add_row(vec!["error", &format!("{}: {}", error.kind, error.message)]);
    }
    println!("{table}");
    Ok(())
}

async fn run_template_command(
    command: TemplateCommand,
    templates: &Arc<TemplateRepository<SqliteTemplateRepository, Arc<dyn EmbeddingProvider>>>,
) -> Result<()> {
    match command {
        TemplateCommand::Create { id, name, script, description, priority } => {
            let source = std::fs::read_to_string(&script).with_context(|| format!("reading {}", script.display()))?;
            let mut template = Template::new(id, name, source).with_priority(priority);
            if let Some(description) = description {
                template = template.with_description(description);
            }
            let created = templates.create(template).await.map_err(|e| anyhow::anyhow!(e))?;
            println!("created template {}", created.id);
            Ok(())
        }
        TemplateCommand::Update { id, script, escaped } => {
            let source = std::fs::read_to_string(&script).with_context(|| format!("reading {}", script.display()))?;
            let updated = templates.update_script(&id, source, escaped).await.map_err(|e| anyhow::anyhow!(e))?;
            println!("updated template {} (version {})", updated.id, updated.version);
            Ok(())
        }
        TemplateCommand::List => {
            let list = templates.list_enabled().await.map_err(|e| anyhow::anyhow!(e))?;
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["id", "name", "version", "priority"]);
            for template in &list {
                table.add_row(vec![
                    template.id.clone(),
                    template.name.clone(),
                    template.version.to_string(),
                    template.priority.to_string(),
                ]);
            }
            println!("{table}");
            Ok(())
        }
        TemplateCommand::Delete { id } => {
            let deleted = templates.delete(&id).await.map_err(|e| anyhow::anyhow!(e))?;
            if deleted {
                println!("deleted template {id}");
            } else {
                println!("no such template {id}");
            }
            Ok(())
        }
    }
}

fn run_repair_command(command: RepairCommand, config: &Config) -> Result<()> {
    match command {
        RepairCommand::Stats => {
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["limit", "value"]);
            table.add_row(vec!["max_repairs_per_task", &config.repair_tracker.max_repairs_per_task.to_string()]);
            table.add_row(vec![
                "max_token_cost_per_template_per_day",
                &config.repair_tracker.max_token_cost_per_template_per_day.to_string(),
            ]);
            table.add_row(vec!["cooldown_secs", &config.repair_tracker.cooldown_secs.to_string()]);
            table.add_row(vec!["gc_window_secs", &config.repair_tracker.gc_window_secs.to_string()]);
            println!("{table}");
            println!("(repair tracker state is in-process only; nothing has accumulated yet in this invocation)");
            Ok(())
        }
    }
}
