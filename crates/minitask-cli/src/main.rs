//! minitask - coordination daemon for the task scheduler.
//!
//! # Usage
//!
//! ```text
//! minitask run --config minitask.toml --worker worker-1
//! minitask status --config minitask.toml
//! minitask demo
//! ```
//!
//! Without a `[mysql]` section the in-memory stores are used, which is only
//! meaningful for a single process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use minitask_core::app::{Coordinator, CoordinatorBuilder, Identity, LeaderElector};
use minitask_core::config::CoordinatorConfig;
use minitask_core::domain::{Task, TaskRun, TaskStatus};
use minitask_core::impls::{InMemoryLeaseStore, InMemoryTaskStore};
use minitask_core::ports::{Clock, LeaseStore, SystemClock, TaskStore};
use minitask_mysql::{MysqlLeaseStore, MysqlTaskStore};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "minitask", about = "Task scheduler coordination daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Contend for leadership and poll runnable tasks until Ctrl+C.
    Run {
        /// TOML config file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Worker id to poll for. Empty polls every worker's due tasks.
        #[arg(long, default_value = "")]
        worker: String,
    },

    /// Print the current leader and run counts as JSON.
    Status {
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// In-memory walkthrough: two contenders, one task lifecycle.
    Demo,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,minitask=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, worker } => run(load_config(config)?, worker).await,
        Command::Status { config } => status(load_config(config)?).await,
        Command::Demo => demo().await,
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<CoordinatorConfig> {
    match path {
        Some(path) => CoordinatorConfig::load(&path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(CoordinatorConfig::default()),
    }
}

async fn coordinator(config: CoordinatorConfig) -> anyhow::Result<Coordinator> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (tasks, leases): (Arc<dyn TaskStore>, Arc<dyn LeaseStore>) = match &config.mysql {
        Some(mysql) => {
            let pool = minitask_mysql::connect(mysql).await?;
            minitask_mysql::migrate(&pool).await?;
            (
                Arc::new(MysqlTaskStore::new(pool.clone(), clock.clone())),
                Arc::new(MysqlLeaseStore::new(pool)),
            )
        }
        None => {
            warn!("no [mysql] section, using in-memory stores");
            (
                Arc::new(InMemoryTaskStore::new(clock.clone())),
                Arc::new(InMemoryLeaseStore::new()),
            )
        }
    };

    Ok(CoordinatorBuilder::new()
        .task_store(tasks)
        .lease_store(leases)
        .clock(clock)
        .config(config)
        .build()?)
}

async fn run(config: CoordinatorConfig, worker: String) -> anyhow::Result<()> {
    let capacity = config.poll.channel_capacity;
    let coordinator = coordinator(config).await?;
    info!(id = coordinator.id(), worker = %worker, "minitask starting");

    let election = coordinator.start_election();
    let (tx, mut rx) = mpsc::channel(capacity);
    let poller = coordinator.poller(worker).spawn(tx);

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("installing Ctrl+C handler")?;
                info!("shutdown signal received");
                break;
            }
            batch = rx.recv() => {
                let Some(batch) = batch else { break };
                for task in &batch {
                    info!(
                        task_key = %task.task_key,
                        task_type = %task.task_type,
                        status = %task.status,
                        "runnable"
                    );
                }
            }
        }
    }

    poller.shutdown_and_join().await;
    election.shutdown_and_join().await;
    info!("minitask stopped");
    Ok(())
}

async fn status(config: CoordinatorConfig) -> anyhow::Result<()> {
    let coordinator = coordinator(config).await?;
    let status = coordinator.status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn demo() -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let tasks: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new(clock.clone()));
    let leases: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new());

    // (A) two contenders share one lease row
    let interval = Duration::from_millis(200);
    let contender = |id: &str| {
        Arc::new(
            LeaderElector::new(Identity::new(id, "127.0.0.1"), leases.clone(), clock.clone())
                .with_interval(interval)
                .with_stale_after(interval * 5),
        )
    };
    let a = contender("node-a");
    let b = contender("node-b");
    let a_handle = a.clone().spawn();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let b_handle = b.clone().spawn();
    tokio::time::sleep(interval * 2).await;
    info!(leader = %a.leader().await?.master_id, "elected");

    // (B) node-a shuts down and releases; node-b takes the free seat
    a_handle.shutdown_and_join().await;
    tokio::time::sleep(interval * 2).await;
    info!(leader = %b.leader().await?.master_id, "after release");

    // (C) one task through its lifecycle
    let task = Task::new("demo-1", "hello", r#"{"name":"minitask"}"#).with_worker("node-b");
    tasks
        .create_task(&task, &TaskRun::for_task(&task, Some(chrono::Utc::now())))
        .await?;
    let runnable = tasks.list_runnable_tasks("node-b").await?;
    info!(count = runnable.len(), "runnable for node-b");

    let running = task.clone().with_status(TaskStatus::Running);
    tasks.update_task(&running, None).await?;
    tasks
        .finish_task("demo-1", TaskStatus::Success, "ok", Some(&serde_json::json!({"greeted": 1})))
        .await?;
    let done = tasks.get_task("demo-1").await?;
    info!(status = %done.status, runs = tasks.list_task_runs().await?.len(), "finished");

    b_handle.shutdown_and_join().await;
    println!("{}", serde_json::to_string_pretty(&done)?);
    Ok(())
}
