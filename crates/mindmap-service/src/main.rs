//! Composition root: wires `mindmap-llm` and `mindmap-cache` together behind
//! a small CLI for manual smoke-testing (spec.md §1 excludes HTTP/WebSocket
//! handlers from the core, so this binary is the only driver in this repo).

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use mindmap_cache::{DiagramCache, DurableStore, NewDiagram};
use mindmap_core::config::env_vars;
use mindmap_core::{ChatRequest, Message, Tracking};
use mindmap_llm::{CircuitBreaker, ClientPool, LlmCore, LoadBalancer};
use mindmap_llm::rate_limiter::RateLimiterRegistry;
use mindmap_llm::token_tracker::TokenTracker;

#[derive(Parser, Debug)]
#[command(name = "mindmapd")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a single prompt against a logical model and print the response.
    Chat {
        /// The prompt to send.
        prompt: String,
        /// Logical model to address (qwen, kimi, doubao, deepseek).
        #[arg(short, long, default_value = "qwen")]
        model: String,
    },
    /// Check every logical model's health.
    Health,
    /// Diagram cache operations.
    Diagram {
        #[command(subcommand)]
        diagram_cmd: DiagramCommand,
    },
}

#[derive(Subcommand, Debug)]
enum DiagramCommand {
    /// Save a new diagram from a JSON spec file.
    Save {
        user_id: String,
        title: String,
        diagram_type: String,
        /// Path to a JSON file containing the diagram spec.
        spec_file: std::path::PathBuf,
        #[arg(short, long, default_value = "en")]
        language: String,
    },
    /// Fetch a diagram by id.
    Get { user_id: String, id: Uuid },
    /// List a user's diagrams.
    List {
        user_id: String,
        #[arg(short, long, default_value_t = 1)]
        page: usize,
        #[arg(short = 's', long, default_value_t = 20)]
        page_size: usize,
    },
}

#[tokio::main(flavor = "multi_thread", worker_threads = 16)]
async fn main() -> Result<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("\n=== PANIC ===");
        if let Some(location) = panic_info.location() {
            eprintln!("Location: {}:{}:{}", location.file(), location.line(), location.column());
        }
        eprintln!("Message: {}", panic_info);
        eprintln!("==============\n");
    }));

    mindmap_core::tracing_init::init();

    let args = Args::parse();

    match args.command {
        Command::Chat { prompt, model } => run_chat(&prompt, &model).await,
        Command::Health => run_health().await,
        Command::Diagram { diagram_cmd } => run_diagram_cmd(diagram_cmd).await,
    }
}

/// Everything the CLI needs to drive the LLM core (§4.1-4.7).
struct LlmDeps {
    core: LlmCore,
    token_tracker: Option<Arc<TokenTracker>>,
}

/// Build the LLM stack: pool, load balancer, circuit breaker, rate
/// limiters, and an optional Redis-backed token tracker.
async fn init_llm() -> Result<LlmDeps> {
    let redis = connect_redis().await;

    let pool = Arc::new(ClientPool::new().context("failed to build client pool")?);
    let circuit_breaker = CircuitBreaker::new();
    let rate_limiters = Arc::new(RateLimiterRegistry::new(redis));
    let load_balancer = Arc::new(LoadBalancer::new(circuit_breaker.clone(), rate_limiters.clone()));

    let token_tracker = if mindmap_core::config::token_tracker::enabled() {
        match std::env::var(env_vars::DATABASE_URL) {
            Ok(url) => {
                let store = Arc::new(DurableStore::connect(&url).await?);
                Some(TokenTracker::spawn(store))
            }
            Err(_) => {
                tracing::warn!("TOKEN_TRACKER_ENABLED but DATABASE_URL is unset, tracking disabled");
                None
            }
        }
    } else {
        None
    };

    let core = LlmCore::new(pool, load_balancer, circuit_breaker, rate_limiters, token_tracker.clone());
    Ok(LlmDeps { core, token_tracker })
}

async fn connect_redis() -> Option<redis::aio::ConnectionManager> {
    let url = std::env::var(env_vars::REDIS_URL).ok()?;
    match redis::Client::open(url) {
        Ok(client) => match client.get_connection_manager().await {
            Ok(conn) => Some(conn),
            Err(e) => {
                tracing::warn!(error = %e, "failed to connect to redis, continuing without it");
                None
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "invalid REDIS_URL, continuing without redis");
            None
        }
    }
}

async fn init_diagram_cache() -> Result<Arc<DiagramCache>> {
    let database_url = std::env::var(env_vars::DATABASE_URL)
        .context("DATABASE_URL must be set to use diagram commands")?;
    let store = Arc::new(DurableStore::connect(&database_url).await?);
    let redis = connect_redis().await;
    Ok(DiagramCache::new(redis, store))
}

async fn run_chat(prompt: &str, model: &str) -> Result<()> {
    println!("Chat mode — model: {model}\n");

    let deps = init_llm().await?;

    let req = ChatRequest {
        messages: vec![Message::user(prompt)],
        logical_model: model.to_string(),
        max_tokens: None,
        temperature: None,
        timeout: None,
        tracking: Tracking::default(),
        skip_load_balancing: false,
        enable_thinking: false,
        yield_structured: false,
    };

    match deps.core.chat(req).await {
        Ok(content) => println!("{content}"),
        Err(e) => eprintln!("Error: {e}"),
    }

    if let Some(tracker) = deps.token_tracker {
        tracker.shutdown().await;
    }

    Ok(())
}

async fn run_health() -> Result<()> {
    println!("Model Health");
    println!("============\n");

    let deps = init_llm().await?;
    let models = mindmap_llm::providers::all_logical_models();
    let report = deps.core.health_check(&models).await;

    for model in &models {
        match report.get(model) {
            Some(health) => {
                let status = if health.healthy { "healthy" } else { "unhealthy" };
                let latency = health
                    .latency_ms
                    .map(|ms| format!("{ms}ms"))
                    .unwrap_or_else(|| "-".to_string());
                let category = health
                    .category
                    .map(|c| format!("{c:?}"))
                    .unwrap_or_else(|| "-".to_string());
                println!("  {model:<10} {status:<10} latency={latency:<8} category={category}");
            }
            None => println!("  {model:<10} unknown"),
        }
    }

    if let Some(tracker) = deps.token_tracker {
        tracker.shutdown().await;
    }

    Ok(())
}

async fn run_diagram_cmd(cmd: DiagramCommand) -> Result<()> {
    let cache = init_diagram_cache().await?;

    match cmd {
        DiagramCommand::Save { user_id, title, diagram_type, spec_file, language } => {
            let raw = std::fs::read_to_string(&spec_file)
                .with_context(|| format!("failed to read {}", spec_file.display()))?;
            let spec: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not valid JSON", spec_file.display()))?;

            let diagram = cache
                .save_create(
                    &user_id,
                    NewDiagram { title, diagram_type, spec, language, thumbnail: None },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&diagram)?);
        }
        DiagramCommand::Get { user_id, id } => match cache.get(&user_id, id).await? {
            Some(diagram) => println!("{}", serde_json::to_string_pretty(&diagram)?),
            None => println!("not found"),
        },
        DiagramCommand::List { user_id, page, page_size } => {
            let result = cache.list(&user_id, page, page_size).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    cache.shutdown().await;
    Ok(())
}
