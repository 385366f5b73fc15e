//! # Tradeflow: task orchestration host
//!
//! Runs an orchestrator with the desk's polling tasks and inspects its
//! persisted state.
//!
//! Usage:
//!   tradeflow run                        # Run until Ctrl-C, then stop and clear state
//!   tradeflow run --duration-secs 60     # Run for a minute
//!   tradeflow run --keep-state           # Pause instead of stop on exit
//!   tradeflow state                      # Print the saved snapshot
//!   tradeflow clear                      # Delete the saved snapshot
//!   tradeflow cron "*/15 * * * *" -n 3   # Preview cron fire times

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use tradeflow_core::{LoggingConfig, TradeflowConfig};
use tradeflow_scheduler::{CronSchedule, Orchestrator, OrchestratorEvent, TaskContext, TaskDefinition, open_store};

#[derive(Parser)]
#[command(
    name = "tradeflow",
    version,
    about = "⏱️ Tradeflow: task orchestration for trading automation"
)]
struct Cli {
    /// Config file (default: ~/.tradeflow/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator with the desk tasks
    Run {
        /// Stop after this many seconds
        #[arg(long)]
        duration_secs: Option<u64>,

        /// Pause and keep the snapshot on exit instead of stopping
        #[arg(long)]
        keep_state: bool,
    },
    /// Print the persisted snapshot
    State,
    /// Delete the persisted snapshot
    Clear,
    /// Show the next fire times of a cron expression
    Cron {
        expression: String,

        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },
}

/// Shared state of the desk tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DeskState {
    warmed_up: bool,
    market_open: bool,
    heartbeats: u64,
    orders_seen: u64,
    last_digest: Option<DateTime<Utc>>,
}

fn init_logging(config: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { config.level.as_str() };
    let directives = format!("tradeflow={level},tradeflow_scheduler={level},tradeflow_core={level}");
    let filter = if verbose {
        EnvFilter::new(directives)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives))
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => TradeflowConfig::load_from(path)?,
        None => TradeflowConfig::load()?,
    };
    init_logging(&config.logging, cli.verbose);

    match cli.command {
        Command::Run {
            duration_secs,
            keep_state,
        } => run(&config, duration_secs, keep_state).await,
        Command::State => {
            let store = open_store(&config.state, &config.name)?;
            match store.load_state().await? {
                Some(snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
                None => println!("📭 No saved state for '{}'", config.name),
            }
            Ok(())
        }
        Command::Clear => {
            let store = open_store(&config.state, &config.name)?;
            store.clear_state().await?;
            println!("🗑️ Cleared saved state for '{}'", config.name);
            Ok(())
        }
        Command::Cron { expression, count } => {
            let cron = CronSchedule::parse(&expression)?;
            println!("⏰ Next {count} fire times for '{cron}' (UTC):");
            for at in cron.upcoming(Utc::now(), count) {
                println!("   {}", at.to_rfc3339());
            }
            Ok(())
        }
    }
}

async fn run(config: &TradeflowConfig, duration_secs: Option<u64>, keep_state: bool) -> Result<()> {
    let orch = Orchestrator::from_config(config, DeskState::default())?;
    register_desk_tasks(&orch).await?;

    let mut rx = orch.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("⚠️ Event log lagged by {} events", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    orch.initialize().await?;
    orch.start().await?;
    tracing::info!(
        "🚀 '{}' running {} tasks (Ctrl-C to exit)",
        orch.name(),
        orch.get_tasks().await.len()
    );

    let deadline = async {
        match duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("🛑 Ctrl-C received");
        }
        _ = deadline => tracing::info!("⏱️ Run duration elapsed"),
    }

    let queue = orch.scheduler().queue_stats().await;
    tracing::info!(
        "📊 Queue: {} waiting of {}, {} dequeued this run",
        queue.queued,
        queue.capacity,
        queue.total_dequeued
    );

    if keep_state {
        orch.pause().await?;
        tracing::info!("💾 State kept for next run");
    } else {
        orch.stop().await?;
    }
    Ok(())
}

async fn register_desk_tasks(orch: &Orchestrator<DeskState>) -> Result<()> {
    orch.add_one_time("warm-up", |ctx: TaskContext<DeskState>| async move {
        ctx.context
            .update(|desk| {
                desk.warmed_up = true;
                desk.market_open = true;
            })
            .await;
        Ok(json!({"warmed_up": true}))
    })
    .await?;

    orch.add_task(
        TaskDefinition::interval(
            "heartbeat",
            Duration::from_secs(5),
            |ctx: TaskContext<DeskState>| async move {
                let beats = ctx
                    .context
                    .update(|desk| {
                        desk.heartbeats += 1;
                        // Simulated session: the market closes every sixth beat.
                        desk.market_open = desk.heartbeats % 6 != 0;
                        desk.heartbeats
                    })
                    .await;
                Ok(json!({"heartbeats": beats}))
            },
        )?
        .with_priority(10)
        .with_max_retries(0),
    )
    .await?;

    orch.add_conditional(
        "poll-orders",
        Duration::from_secs(2),
        |desk: &DeskState| desk.warmed_up && desk.market_open,
        |ctx: TaskContext<DeskState>| async move {
            let seen = ctx
                .context
                .update(|desk| {
                    desk.orders_seen += ctx.execution_count % 3;
                    desk.orders_seen
                })
                .await;
            Ok(json!({"orders_seen": seen, "run": ctx.execution_count}))
        },
    )
    .await?;

    orch.add_cron("digest", "0 * * * * *", |ctx: TaskContext<DeskState>| async move {
        let desk = ctx
            .context
            .update(|desk| {
                desk.last_digest = Some(Utc::now());
                desk.clone()
            })
            .await;
        tracing::info!(
            "📊 Digest: {} heartbeats, {} orders seen, market {}",
            desk.heartbeats,
            desk.orders_seen,
            if desk.market_open { "open" } else { "closed" }
        );
        Ok(serde_json::to_value(&desk)?)
    })
    .await?;

    Ok(())
}

fn log_event(event: &OrchestratorEvent) {
    match event {
        OrchestratorEvent::TaskCompleted {
            task_id,
            result,
            duration_ms,
            ..
        } => tracing::debug!("📬 {} → {} ({}ms)", task_id, result, duration_ms),
        OrchestratorEvent::TaskFailed {
            task_id,
            error,
            will_retry,
            ..
        } => tracing::warn!("📬 {} failed: {} (retry: {})", task_id, error, will_retry),
        OrchestratorEvent::StateRestored { restored, dropped } => {
            tracing::info!("📬 Restored {} task records ({} dropped)", restored, dropped)
        }
        OrchestratorEvent::Error { message } => tracing::warn!("📬 Orchestrator error: {}", message),
        other => tracing::debug!("📬 {:?}", other),
    }
}
