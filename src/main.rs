use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use conveyor::api;
use conveyor::broker::Broker;
use conveyor::config::Settings;
use conveyor::db::Db;
use conveyor::storage::ObjectStore;
use conveyor::worker::{self, Fleet, WorkerContext};

#[derive(Parser)]
#[command(
    name = "conveyor",
    version,
    about = "Asynchronous file-processing pipeline platform"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the REST API server (submitter + read surface).
    Serve,
    /// Run one worker process for a fleet. Scale a fleet horizontally by
    /// starting more processes with the same fleet name.
    Worker {
        #[arg(value_enum)]
        fleet: Fleet,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;

    match cli.command {
        Command::Serve => api::serve(settings).await,
        Command::Worker { fleet } => {
            let db = Db::connect(&settings.database_url).await?;
            let storage = ObjectStore::new(&settings);
            let broker = Broker::connect(&settings.amqp_uri()).await?;
            let ctx = WorkerContext {
                db,
                storage,
                settings: Arc::new(settings),
            };
            worker::run(fleet, ctx, broker).await
        }
    }
}
