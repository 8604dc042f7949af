//! procq CLI: run the scheduler, or operate on processes and agent commands.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use procq::config::Config;
use procq::config::secrets::redacted_url;
use procq::db::Db;
use procq::engine::{Engine, KillOutcome};
use procq::model::{
    AgentCapabilities, NewProcess, ProcessKey, ProcessKind, ProcessQueueEntry,
};
use procq::telemetry::{TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "procq", about = "Process queue and wait-condition scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the wait watchdog and command redelivery until interrupted
    Serve,
    /// Process queue operations
    Process {
        #[command(subcommand)]
        action: ProcessAction,
    },
    /// Agent-side operations
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },
}

#[derive(Subcommand)]
enum ProcessAction {
    /// Record a new process in PREPARING status
    Submit {
        /// Process kind
        #[arg(long, default_value = "default")]
        kind: ProcessKind,
        /// Parent instance ID
        #[arg(long)]
        parent: Option<Uuid>,
        /// Organization ID (requires --project)
        #[arg(long, requires = "project")]
        org: Option<Uuid>,
        /// Project ID (requires --org)
        #[arg(long, requires = "org")]
        project: Option<Uuid>,
        /// Agent requirements as JSON
        #[arg(long)]
        requirements: Option<String>,
        /// Exclusive group the process belongs to
        #[arg(long)]
        exclusive_group: Option<String>,
        /// Initial arguments as JSON
        #[arg(long)]
        meta: Option<String>,
        /// Enqueue immediately
        #[arg(long)]
        enqueue: bool,
    },
    /// Move a prepared process to ENQUEUED
    Enqueue {
        /// Instance ID
        id: Uuid,
    },
    /// Show a process
    Show {
        /// Instance ID
        id: Uuid,
    },
    /// Cancel processes
    Kill {
        /// Instance IDs
        #[arg(required = true)]
        ids: Vec<Uuid>,
    },
}

#[derive(Subcommand)]
enum AgentAction {
    /// Claim the next process this agent can run
    Poll {
        /// Agent ID
        agent_id: String,
        /// Agent capabilities as JSON
        #[arg(long)]
        capabilities: Option<String>,
    },
    /// Fetch pending commands for an agent
    Commands {
        /// Agent ID
        agent_id: String,
        /// Maximum commands to fetch
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Acknowledge a delivered command
    Ack {
        /// Command ID
        command_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve => cmd_serve(config).await,
        Command::Process { action } => {
            let engine = connect(&config).await?;
            match action {
                ProcessAction::Submit {
                    kind,
                    parent,
                    org,
                    project,
                    requirements,
                    exclusive_group,
                    meta,
                    enqueue,
                } => {
                    let mut new = NewProcess::new(ProcessKey::generate()).kind(kind);
                    if let Some(parent) = parent {
                        new = new.parent(parent);
                    }
                    if let (Some(org), Some(project)) = (org, project) {
                        new = new.project(org, project);
                    }
                    if let Some(json) = requirements {
                        new = new.requirements(serde_json::from_str(&json)?);
                    }
                    if let Some(group) = exclusive_group {
                        new = new.exclusive_group(group);
                    }
                    if let Some(json) = meta {
                        new = new.meta(serde_json::from_str(&json)?);
                    }

                    let key = engine.queue.submit(new).await?;
                    if enqueue {
                        engine.queue.enqueue(&key).await?;
                    }
                    println!("Created: {key} (created at {})", key.created_at);
                    Ok(())
                }
                ProcessAction::Enqueue { id } => {
                    let key = resolve(&engine, id).await?;
                    engine.queue.enqueue(&key).await?;
                    println!("Enqueued: {key}");
                    Ok(())
                }
                ProcessAction::Show { id } => {
                    let key = resolve(&engine, id).await?;
                    let entry = engine
                        .queue
                        .get(&key)
                        .await?
                        .ok_or_else(|| anyhow::anyhow!("process {id} not found"))?;
                    print_entry(&entry)
                }
                ProcessAction::Kill { ids } => cmd_kill(&engine, ids).await,
            }
        }
        Command::Agent { action } => {
            let engine = connect(&config).await?;
            match action {
                AgentAction::Poll {
                    agent_id,
                    capabilities,
                } => {
                    let capabilities = match capabilities {
                        Some(json) => AgentCapabilities::new(serde_json::from_str(&json)?),
                        None => AgentCapabilities::none(),
                    };
                    match engine.queue.poll(&agent_id, &capabilities).await? {
                        Some(entry) => print_entry(&entry),
                        None => {
                            println!("Nothing to run.");
                            Ok(())
                        }
                    }
                }
                AgentAction::Commands { agent_id, limit } => {
                    let commands = engine.agents.poll_commands(&agent_id, limit).await?;
                    if commands.is_empty() {
                        println!("No pending commands.");
                    }
                    for command in &commands {
                        println!(
                            "{}  {}",
                            command.id,
                            serde_json::to_string(&command.payload)?
                        );
                    }
                    Ok(())
                }
                AgentAction::Ack { command_id } => {
                    engine.agents.acknowledge(command_id).await?;
                    println!("Acknowledged: {command_id}");
                    Ok(())
                }
            }
        }
    }
}

async fn connect(config: &Config) -> anyhow::Result<Engine> {
    let db = Db::connect(
        config.database_url.expose_secret(),
        config.db_max_connections,
    )
    .await?;
    db.migrate().await?;
    let db = Arc::new(db);
    Ok(Engine::new(db.clone(), db, &config.scheduler))
}

async fn resolve(engine: &Engine, id: Uuid) -> anyhow::Result<ProcessKey> {
    engine
        .queue
        .find_key(id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("process {id} not found"))
}

async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "procq"))?;

    info!(database = %redacted_url(&config.database_url), "starting procq");
    let engine = connect(&config).await?;

    let scheduler = engine.scheduler();
    let handle = scheduler.handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown requested");
        handle.shutdown();
    });

    scheduler.run().await?;
    Ok(())
}

async fn cmd_kill(engine: &Engine, ids: Vec<Uuid>) -> anyhow::Result<()> {
    let mut keys = Vec::with_capacity(ids.len());
    for id in ids {
        keys.push(resolve(engine, id).await?);
    }

    if let [key] = keys.as_slice() {
        match engine.agents.kill_process(key).await? {
            KillOutcome::Cancelled => println!("Cancelled: {key}"),
            KillOutcome::CommandIssued(command) => {
                println!("Cancel sent to agent {}: {key}", command.agent_id)
            }
            KillOutcome::AlreadyTerminal(status) => println!("Already {status}: {key}"),
        }
        return Ok(());
    }

    let summary = engine.agents.kill_processes(&keys).await?;
    for key in &summary.cancelled {
        println!("Cancelled: {key}");
    }
    for command in &summary.commands {
        println!("Cancel sent to agent {}: {}", command.agent_id, command.id);
    }
    for key in &summary.already_terminal {
        println!("Already finished: {key}");
    }
    Ok(())
}

fn print_entry(entry: &ProcessQueueEntry) -> anyhow::Result<()> {
    println!("ID:          {}", entry.key.instance_id);
    println!("Created:     {}", entry.key.created_at);
    println!("Kind:        {}", entry.kind);
    println!("Status:      {}", entry.status);
    println!(
        "Agent:       {}",
        entry.last_agent_id.as_deref().unwrap_or("-")
    );
    if let Some(parent) = entry.parent_instance_id {
        println!("Parent:      {parent}");
    }
    if let Some(project) = entry.project_id {
        println!("Project:     {project}");
    }
    if let Some(group) = &entry.exclusive_group {
        println!("Exclusive:   {group}");
    }
    if let Some(requirements) = &entry.requirements {
        println!("Requires:    {}", serde_json::to_string(requirements)?);
    }
    if let Some(waits) = &entry.wait_conditions {
        println!("Waiting on:  {}", serde_json::to_string_pretty(waits)?);
    }
    println!("Meta:        {}", serde_json::to_string_pretty(&entry.meta)?);
    println!("Updated:     {}", entry.last_updated_at);
    Ok(())
}
