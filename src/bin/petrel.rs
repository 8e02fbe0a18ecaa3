use anyhow::{Context as AnyhowContext, Result};
use clap::{Parser, Subcommand};
use petrel::compiler::core::Compiler;
use petrel::compiler::loader::{load_net_from_yaml, load_nets_from_dir};
use petrel::runtime::engine::{Engine, EngineConfig};
use petrel::runtime::redis_storage::RedisStateStore;
use petrel::runtime::storage::{TaskState, WorkflowSnapshot, WorkflowState};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct EngineArgs {
    /// Directory of additional net definitions (subnets)
    #[arg(long)]
    nets: Option<PathBuf>,

    /// Redis connection URL; in-memory state when absent
    #[arg(long)]
    redis: Option<String>,

    /// Redis key prefix
    #[arg(long, default_value = "petrel")]
    redis_prefix: String,

    /// Basis markings an OR-join analysis may explore
    #[arg(long, default_value_t = 10_000)]
    or_join_limit: usize,

    /// Requests a single call may drain
    #[arg(long, default_value_t = 100_000)]
    drain_limit: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a net definition and print a summary
    Validate {
        /// Path to the net YAML/JSON file
        file: PathBuf,
    },

    /// Start an instance and fire/complete enabled tasks until it finishes
    Run {
        /// Path to the net YAML/JSON file
        file: PathBuf,

        /// Initial variables (key=value)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        vars: Vec<(String, Value)>,

        /// Write the final snapshot here
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// Stop after this many task firings
        #[arg(long, default_value_t = 1_000)]
        max_steps: usize,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Restore an instance from a snapshot and print its enabled tasks
    Resume {
        /// Snapshot JSON written by `run --snapshot`
        snapshot: PathBuf,

        /// Net definition of the root instance
        #[arg(long, short)]
        file: PathBuf,

        #[command(flatten)]
        engine: EngineArgs,
    },
}

fn parse_key_val(s: &str) -> Result<(String, Value), String> {
    let pos = s.find('=').ok_or_else(|| format!("invalid KEY=value: no `=` found in `{}`", s))?;
    let key = s[..pos].to_string();
    let val_str = &s[pos + 1..];
    // JSON if it parses, plain string otherwise
    let val = serde_json::from_str(val_str).unwrap_or_else(|_| Value::String(val_str.to_string()));
    Ok((key, val))
}

fn build_engine(args: &EngineArgs) -> Result<Engine> {
    let config = EngineConfig::default()
        .with_or_join_search_limit(args.or_join_limit)
        .with_drain_limit(args.drain_limit);

    let engine = match &args.redis {
        Some(url) => {
            info!("Using Redis state store: {}", url);
            let client = redis::Client::open(url.as_str()).with_context(|| format!("Invalid Redis URL {}", url))?;
            Engine::new_with_storage(Arc::new(RedisStateStore::with_prefix(client, &args.redis_prefix)))
        }
        None => Engine::new(),
    };
    let engine = engine.with_config(config);

    if let Some(dir) = &args.nets {
        info!("Loading nets from: {:?}", dir);
        for definition in load_nets_from_dir(dir)? {
            let id = definition.id.clone();
            match engine.register_definition(definition) {
                Ok(()) => info!("Loaded net: {}", id),
                Err(e) => error!("Failed to compile {}: {}", id, e),
            }
        }
    }
    Ok(engine)
}

fn register_file(engine: &Engine, file: &Path) -> Result<String> {
    let definition = load_net_from_yaml(&file.to_string_lossy())?;
    let id = definition.id.clone();
    engine
        .register_definition(definition)
        .with_context(|| format!("Failed to compile {}", file.display()))?;
    Ok(id)
}

/// Fires the first enabled task (nested instances included) and completes it, until
/// nothing is enabled or the root instance has finished.
async fn drive(engine: &Engine, root: &str, max_steps: usize) -> Result<()> {
    for _ in 0..max_steps {
        if engine.workflow_state(root).await? != WorkflowState::Running {
            return Ok(());
        }
        let enabled = engine.enabled_tasks_deep(root).await?;
        let Some((workflow_id, task)) = enabled.into_iter().next() else {
            warn!("No enabled task left; instance {} is stuck", root);
            return Ok(());
        };

        let id = engine.fire_task(&workflow_id, &task).await?;
        info!("Fired {}/{} -> {}", workflow_id, task, id);

        let is_composite = engine.net_of(&workflow_id).await?.task(&task)?.is_composite();
        if !is_composite && engine.task_state(&workflow_id, &task).await? == TaskState::Active {
            engine.complete_task(&workflow_id, &task).await?;
        }
    }
    warn!("Stopped after {} steps", max_steps);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file } => {
            let definition = load_net_from_yaml(&file.to_string_lossy())?;
            let net = Compiler::new()
                .compile(definition)
                .with_context(|| format!("Failed to compile {}", file.display()))?;
            println!("net {}", net.id);
            println!("  tasks:      {}", net.tasks.len());
            println!("  conditions: {}", net.conditions.len());
            println!("  or-joins:   {}", net.or_join_tasks().count());
            for subnet in net.subnets() {
                println!("  subnet:     {}", subnet);
            }
        }

        Commands::Run { file, vars, snapshot, max_steps, engine } => {
            let engine = build_engine(&engine)?;
            let net_id = register_file(&engine, &file)?;

            let initial: Map<String, Value> = vars.into_iter().collect();
            let workflow_id = engine.start_workflow(&net_id, initial).await?;
            info!("Workflow started: {}", workflow_id);

            drive(&engine, &workflow_id, max_steps).await?;

            let state = engine.workflow_state(&workflow_id).await?;
            info!("Workflow {} finished as {:?}", workflow_id, state);
            println!("{}", serde_json::to_string_pretty(&engine.get_vars(&workflow_id).await?)?);

            if let Some(path) = snapshot {
                let snap = engine.snapshot(&workflow_id).await?;
                fs::write(&path, serde_json::to_string_pretty(&snap)?)
                    .with_context(|| format!("Failed to write snapshot to {}", path.display()))?;
                info!("Snapshot written to {}", path.display());
            }
        }

        Commands::Resume { snapshot, file, engine } => {
            let engine = build_engine(&engine)?;
            register_file(&engine, &file)?;

            let raw = fs::read_to_string(&snapshot)
                .with_context(|| format!("Failed to read snapshot from {}", snapshot.display()))?;
            let snap: WorkflowSnapshot = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to deserialize snapshot {}", snapshot.display()))?;

            let workflow_id = engine.resume(snap).await?;
            println!("workflow {} ({:?})", workflow_id, engine.workflow_state(&workflow_id).await?);
            for (instance, task) in engine.enabled_tasks_deep(&workflow_id).await? {
                println!("  enabled: {}/{}", instance, task);
            }
        }
    }

    Ok(())
}
