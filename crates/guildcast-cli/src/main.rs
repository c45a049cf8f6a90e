//! guildcast: run fan-out workers and inspect the queue.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use guildcast_core::app::{
    AlertDispatchTask, AlertFanOutHandler, AlertPublisher, AppBuilder, Runtime, WorkerGroup,
};
use guildcast_core::config::GuildcastConfig;
use guildcast_core::domain::{GuildId, TaskId, TaskKind};
use guildcast_core::impls::{InMemoryLedger, StaticRecipientResolver, TracingDeliveryChannel};
use guildcast_core::ports::{ConsumptionLedger, DispatchLedger};
use guildcast_core::queue::{InMemoryTaskQueue, TaskQueue};
use guildcast_sqlite::{SqliteLedger, SqliteTaskQueue};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "guildcast", version, about = "Exactly-once-per-guild alert fan-out")]
struct Cli {
    /// TOML config file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Consume the queue until Ctrl-C, then drain in-flight tasks.
    Run {
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Create a dispatch, enqueue its fan-out and process until the queue is idle.
    Publish {
        #[arg(long)]
        message: String,
        /// Deliver only to this guild instead of broadcasting.
        #[arg(long)]
        origin: Option<String>,
        /// Broadcast recipients; overrides `recipients.guilds`.
        #[arg(long, value_delimiter = ',')]
        recipients: Vec<String>,
        /// Give up waiting for the queue to go idle after this many seconds.
        #[arg(long, default_value_t = 30)]
        wait_secs: u64,
    },
    /// Print dead-lettered tasks with their failure context as JSON.
    DeadLetters,
    /// Re-enqueue a dead-lettered task as a new task.
    Replay { task_id: String },
}

struct Stores {
    dispatches: Arc<dyn DispatchLedger>,
    consumptions: Arc<dyn ConsumptionLedger>,
    queue: Arc<dyn TaskQueue>,
    durable: bool,
}

async fn open_stores(config: &GuildcastConfig) -> anyhow::Result<Stores> {
    let settings = config.queue.settings();
    match &config.storage.database_url {
        Some(url) => {
            let pool = guildcast_sqlite::connect(url)
                .await
                .with_context(|| format!("opening {url}"))?;
            let ledger = Arc::new(SqliteLedger::new(pool.clone()));
            Ok(Stores {
                dispatches: ledger.clone(),
                consumptions: ledger,
                queue: Arc::new(SqliteTaskQueue::new(pool, settings)),
                durable: true,
            })
        }
        None => {
            let ledger = Arc::new(InMemoryLedger::new());
            Ok(Stores {
                dispatches: ledger.clone(),
                consumptions: ledger,
                queue: Arc::new(InMemoryTaskQueue::new(settings)),
                durable: false,
            })
        }
    }
}

fn build_runtime(
    config: &GuildcastConfig,
    stores: &Stores,
    guilds: Vec<String>,
) -> anyhow::Result<Arc<Runtime>> {
    let fan_out = AlertFanOutHandler::new(
        stores.dispatches.clone(),
        stores.consumptions.clone(),
        Arc::new(StaticRecipientResolver::new(guilds)),
        Arc::new(TracingDeliveryChannel),
    )
    .with_settings(config.fan_out.settings());

    let app = AppBuilder::new()
        .register::<AlertDispatchTask, _>(fan_out)?
        .expect_kinds(&[TaskKind::DispatchAlertMessage])
        .build()?;
    Ok(Arc::new(app.into_runtime()))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<GuildcastConfig> {
    let config = match path {
        Some(path) => GuildcastConfig::load(path)?,
        None => GuildcastConfig::from_env()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = load_config(cli.config.as_ref())?;
    let stores = open_stores(&config).await?;

    match cli.command {
        Command::Run { workers } => {
            let runtime = build_runtime(&config, &stores, config.recipients.guilds.clone())?;
            let count = workers.unwrap_or(config.workers.count);
            if count == 0 {
                return Err(anyhow!("--workers must be at least 1"));
            }
            if !stores.durable {
                warn!("no storage.database_url configured, queue is in-memory and starts empty");
            }

            let group = WorkerGroup::spawn(
                count,
                stores.queue.clone(),
                runtime,
                config.workers.settings(),
            );
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            info!("shutdown requested, draining in-flight tasks");
            group.shutdown_and_join().await;
        }
        Command::Publish {
            message,
            origin,
            recipients,
            wait_secs,
        } => {
            let guilds = if recipients.is_empty() {
                config.recipients.guilds.clone()
            } else {
                recipients
            };
            let runtime = build_runtime(&config, &stores, guilds)?;
            let publisher = AlertPublisher::new(stores.dispatches.clone(), stores.queue.clone());
            let published = publisher.publish(origin.map(GuildId::new), message).await?;

            let group = WorkerGroup::spawn(
                config.workers.count,
                stores.queue.clone(),
                runtime,
                config.workers.settings(),
            );
            let idle = tokio::time::timeout(
                Duration::from_secs(wait_secs),
                group.wait_until_idle(Duration::from_millis(50)),
            )
            .await;
            group.shutdown_and_join().await;
            match idle {
                Ok(result) => result?,
                Err(_) => warn!(wait_secs, "queue still busy, pending retries stay queued"),
            }

            let consumed = stores.consumptions.consumptions(published.dispatch_id).await?;
            let report = serde_json::json!({
                "dispatch_id": published.dispatch_id,
                "task_id": published.task_id,
                "consumed": consumed
                    .iter()
                    .map(|c| c.guild_id.as_str())
                    .collect::<Vec<_>>(),
                "dead_letters": stores.queue.counts().await?.dead_lettered,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::DeadLetters => {
            let dead = stores.queue.dead_letters().await?;
            println!("{}", serde_json::to_string_pretty(&dead)?);
        }
        Command::Replay { task_id } => {
            let parsed: TaskId = task_id
                .parse()
                .map_err(|e| anyhow!("invalid task id {task_id}: {e}"))?;
            let new_id = stores.queue.replay_dead_letter(parsed).await?;
            println!("{new_id}");
        }
    }

    Ok(())
}
