//! stagecraft: pipeline runner and agent resolver
//!
//! Usage:
//!   stagecraft run <command-file> [options]   - Run a command pipeline
//!   stagecraft resolve <description> [opts]   - Pick an agent for a task
//!   stagecraft health                         - Check resolver configuration
//!   stagecraft --help                         - Show help

mod cli;

use anyhow::Context;
use cli::{Command, ResolveArgs, RunArgs};
use serde::Serialize;
use stagecraft_core::agents::{
    AgentCapabilityRegistry, AgentLoader, BuiltinAgentLoader, DirectoryAgentLoader,
    DynamicAgentResolver, TaskContext,
};
use stagecraft_core::pipeline::{
    CommandIsolationExecutor, CommandLoader, DirectoryPromptLoader, InlinePromptLoader,
    PipelineExecutor, PromptLoader, StageExecutor,
};
use stagecraft_core::{Config, Error, HttpCompletionProvider, RunStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match cli::parse_args(&args) {
        Ok(command) => command,
        Err(e) => {
            cli::print_help();
            return Err(e);
        }
    };

    match command {
        Command::Help => {
            cli::print_help();
            return Ok(());
        }
        Command::Version => {
            println!("stagecraft {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    // Load .env file
    dotenvy::dotenv().ok();

    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load().map_err(|e| anyhow::anyhow!("Config error: {}", e))?;

    match command {
        Command::Run(args) => run(config, args).await,
        Command::Resolve(args) => resolve(config, args).await,
        Command::Health => health(config).await,
        Command::Help | Command::Version => Ok(()),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn load_registry(config: &Config) -> stagecraft_core::Result<AgentCapabilityRegistry> {
    let loader: Box<dyn AgentLoader> = match &config.agents.dir {
        Some(dir) => Box::new(DirectoryAgentLoader::new(dir)),
        None => Box::new(BuiltinAgentLoader),
    };
    AgentCapabilityRegistry::initialize(loader.as_ref()).await
}

async fn build_resolver(config: &Config) -> anyhow::Result<DynamicAgentResolver> {
    let registry = load_registry(config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load agent capabilities: {}", e))?;
    tracing::info!(agents = registry.len(), "Loaded agent capabilities");
    Ok(DynamicAgentResolver::new(
        Arc::new(registry),
        config.resolver.clone(),
    ))
}

/// Run a command file, printing the result as JSON
async fn run(config: Config, args: RunArgs) -> anyhow::Result<()> {
    let command = CommandLoader::new()
        .load_file(&args.command_file)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load command: {}", e))?;

    let provider = HttpCompletionProvider::new(&config.llm)
        .map_err(|e| anyhow::anyhow!("Failed to create completion provider: {}", e))?;

    let prompts: Arc<dyn PromptLoader> = match &config.prompts.dir {
        Some(dir) => Arc::new(DirectoryPromptLoader::new(dir)),
        None => Arc::new(InlinePromptLoader),
    };

    // Agent selection degrades to none rather than failing the run
    let resolver = if config.pipeline.dynamic_agents && command.agent.is_none() {
        match build_resolver(&config).await {
            Ok(resolver) => Some(Arc::new(resolver)),
            Err(e) => {
                tracing::warn!("Dynamic agent selection disabled: {}", e);
                None
            }
        }
    } else {
        None
    };

    let stages = StageExecutor::new(Arc::new(provider), prompts)
        .with_resolver(resolver)
        .with_default_timeout_ms(config.pipeline.default_timeout_ms);

    let base_dir = args
        .command_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| ".".into());

    let mut executor = PipelineExecutor::new(stages)
        .with_config(config.pipeline.clone())
        .with_cache_config(config.cache.clone())
        .with_base_dir(base_dir);

    if config.session.enabled {
        match RunStore::new(&config.session.db_path) {
            Ok(store) => executor = executor.with_sink(Arc::new(store)),
            Err(e) => tracing::warn!("Run history disabled: {}", e),
        }
    }

    let logger = executor.events().spawn_logger();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received; cancelling run");
            on_signal.cancel();
        }
    });

    tracing::info!(command = %command.name, "Running command");

    let isolation = args.is_isolated().then(|| args.isolation_options());

    // The executor is dropped with this block, closing the event bus
    let result = {
        let executor = Arc::new(executor);
        if let Some(options) = isolation {
            CommandIsolationExecutor::new(executor)
                .run_command_isolated(&command, args.inputs, &options, cancel)
                .await
        } else {
            executor.run_command(&command, args.inputs, cancel).await
        }
    };
    let result = result.with_context(|| format!("Command '{}' failed", command.name))?;

    // The logger exits once it has drained the closed bus
    let _ = logger.await;

    print_json(&result)?;

    if let Some(aborted) = &result.aborted {
        return Err(Error::StageAbort {
            stage: aborted.stage.clone(),
            attempts: aborted.attempts,
        }
        .into());
    }
    if result.cancelled {
        return Err(Error::Cancelled.into());
    }
    Ok(())
}

/// Print the agent selection for a task description
async fn resolve(config: Config, args: ResolveArgs) -> anyhow::Result<()> {
    let resolver = build_resolver(&config).await?;
    let task = TaskContext::new(args.description)
        .with_files(&args.files)
        .with_dependencies(&args.dependencies);

    if args.detailed {
        print_json(&resolver.get_detailed_analysis(&task))
    } else {
        print_json(&resolver.resolve_agent(&task))
    }
}

/// Print the resolver health report
async fn health(config: Config) -> anyhow::Result<()> {
    let resolver = build_resolver(&config).await?;
    let report = resolver.validate_services();
    print_json(&report)?;

    if !report.healthy {
        anyhow::bail!("Resolver is unhealthy: {}", report.issues.join("; "));
    }
    Ok(())
}
