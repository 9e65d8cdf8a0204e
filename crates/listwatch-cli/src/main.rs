use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use listwatch_storage::PgStore;
use listwatch_sync::{build_service, load_task_registry, SyncConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "listwatch")]
#[command(about = "Marketplace listing watcher")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every eligible task once and exit.
    Tick,
    /// Run the cron-driven scheduler until interrupted.
    Daemon,
    /// Serve the HTTP API.
    Serve,
    /// Apply database migrations.
    Migrate,
    /// Register tasks from a YAML file, skipping ones that already exist.
    Seed {
        #[arg(long, default_value = "tasks.yaml")]
        file: PathBuf,
    },
    /// List tasks, optionally for one user.
    Tasks {
        #[arg(long)]
        user_id: Option<String>,
    },
    /// Run a single task now, ignoring its cooldown.
    Run {
        task_id: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show a task's status.
    Status { task_id: String },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,listwatch=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Tick) {
        Commands::Tick => {
            let service = build_service(&config).await?;
            let tick = service.scheduler().run_eligible().await?;
            println!(
                "tick complete: eligible={} completed={} failures={}",
                tick.eligible,
                tick.completed(),
                tick.failures.len()
            );
        }
        Commands::Daemon => {
            let service = build_service(&config).await?;
            let mut sched = service.scheduler().build_cron_scheduler(&config.tick_cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.tick_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down");
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            listwatch_web::serve_from_env().await?;
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Seed { file } => {
            let service = build_service(&config).await?;
            let registry = load_task_registry(&file).await?;
            let report = service.seed_from_registry(registry).await?;
            println!(
                "seed complete: created={} skipped={}",
                report.created.len(),
                report.skipped.len()
            );
        }
        Commands::Tasks { user_id } => {
            let service = build_service(&config).await?;
            print_json(&service.list_tasks(user_id.as_deref()).await?)?;
        }
        Commands::Run { task_id, limit } => {
            let service = build_service(&config).await?;
            print_json(&service.scheduler().run_task(&task_id, limit).await?)?;
        }
        Commands::Status { task_id } => {
            let service = build_service(&config).await?;
            print_json(&service.task_status(&task_id).await?)?;
        }
    }

    Ok(())
}
