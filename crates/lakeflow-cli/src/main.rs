// Lakeflow CLI.
// Exit codes: 0 success, 1 surfaced failure, 2 configuration error.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lakeflow_core::TriggerType;
use lakeflow_engine::{Engine, EngineOptions};
use lakeflow_storage::Database;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "lakeflow", version, about = "Multi-source data integration and orchestration platform")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine until interrupted
    Run {
        /// Task queue worker pool size
        #[arg(long, default_value_t = 4)]
        workers: usize,
    },
    /// Print the version and exit
    Version,
    /// Apply catalog migrations and exit
    Migrate,
    /// Execute one workflow to completion
    WorkflowRun {
        /// Workflow name
        name: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    if let Command::Version = cli.command {
        println!("lakeflow {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let database_url = match std::env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("DATABASE_URL is not set");
            return ExitCode::from(2);
        }
    };
    let db = match Database::from_url(&database_url).await {
        Ok(db) => db,
        Err(e) => {
            eprintln!("failed to connect to catalog: {e:#}");
            return ExitCode::from(2);
        }
    };

    match run(cli.command, db).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Full messages live in the catalog; the console gets the head
            let message = format!("{e:#}");
            error!("{}", truncate(&message, 200));
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, db: Database) -> Result<()> {
    match command {
        Command::Version => unreachable!("handled before connecting"),
        Command::Migrate => {
            db.migrate().await?;
            info!("Catalog migrations applied");
            Ok(())
        }
        Command::Run { workers } => {
            db.migrate().await?;
            let engine = std::sync::Arc::new(Engine::new(
                db,
                EngineOptions {
                    worker_pool_size: workers,
                    ..EngineOptions::default()
                },
            ));

            let watcher = {
                let engine = engine.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("Interrupt received, shutting down");
                        engine.shutdown();
                    }
                })
            };
            let result = engine.run().await;
            watcher.abort();
            result
        }
        Command::WorkflowRun { name } => {
            db.migrate().await?;
            let engine = Engine::new(db, EngineOptions::default());
            let execution = engine
                .executor()
                .execute_workflow(&name, TriggerType::Manual)
                .await
                .with_context(|| format!("workflow {name} failed to execute"))?;
            info!(
                execution = %execution.execution_id,
                status = %execution.status,
                completed = execution.completed_tasks,
                failed = execution.failed_tasks,
                skipped = execution.skipped_tasks,
                "Workflow finished"
            );
            if execution.status == "SUCCESS" {
                Ok(())
            } else {
                anyhow::bail!(
                    "execution {} finished {}: {}",
                    execution.execution_id,
                    execution.status,
                    execution.error_message.as_deref().unwrap_or("no error recorded")
                )
            }
        }
    }
}

fn truncate(message: &str, limit: usize) -> &str {
    match message.char_indices().nth(limit) {
        Some((at, _)) => &message[..at],
        None => message,
    }
}
