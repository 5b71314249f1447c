use clap::{Parser, Subcommand};
use issuepilot::config::Config;
use issuepilot::engine::queue::TaskQueue;
use issuepilot::engine::runner::{workspace, AgentRunner};
use issuepilot::engine::Processor;
use issuepilot::providers::{github::GithubProvider, linear::LinearProvider, ProviderRegistry};
use issuepilot::server::{self, AppState};
use issuepilot::state::StateStore;
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "issuepilot", version, about = "Issuepilot — labels in, pull requests out")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the service
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!("issuepilot={log_level}"))
            }),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve => serve().await,
    }
}

/// Boot order is fixed: config → providers → queue → state restore →
/// orphan cleanup → processor start → HTTP bind.
async fn serve() -> anyhow::Result<()> {
    tracing::info!("issuepilot starting");
    let config = Arc::new(Config::from_env()?);

    let mut registry = ProviderRegistry::new();
    if let Some(linear) = &config.linear {
        registry.register(Arc::new(LinearProvider::new(
            linear.clone(),
            config.include_comments,
        )));
    }
    if let Some(github) = &config.github {
        registry.register(Arc::new(GithubProvider::new(
            github.clone(),
            config.include_comments,
        )));
    }
    let providers = Arc::new(registry);
    tracing::info!(providers = ?providers.names(), "providers configured");

    // Credential probes are advisory; the service may come up before the
    // network does.
    for provider in providers.iter() {
        if let Err(e) = provider.health_check().await {
            tracing::warn!(provider = %provider.kind(), ?e, "provider credential check failed");
        }
    }

    let queue = Arc::new(TaskQueue::new(config.max_concurrent_agents));

    let state_store = Arc::new(StateStore::new(config.state_file.clone()));
    let restored = state_store.load();
    if !restored.is_empty() {
        // Restored entries are observability only; mid-run child processes
        // are never resumed, their workspaces are reclaimed below.
        tracing::warn!(
            count = restored.len(),
            "restoring running tasks from a previous run (workers are not resumed)"
        );
        queue.restore_running(restored);
    }

    // No worker owns anything at startup, so every directory under the
    // worktrees root is unowned.
    workspace::cleanup_orphans(&config.worktrees, &[], config.auto_clean_orphans).await;

    let runner = Arc::new(AgentRunner::new(config.clone(), providers.clone()));
    let processor = Processor::new(queue.clone(), state_store, runner);
    processor.start();

    let state = Arc::new(AppState {
        config: config.clone(),
        queue,
        providers,
        processor,
        started_at: Instant::now(),
    });
    server::serve(state, config.port).await
}
