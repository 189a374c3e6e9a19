//! modelctl
//!
//! Command-line interface for modeld workers.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// modelctl - drive stateful models hosted by modeld workers
#[derive(Parser, Debug)]
#[command(name = "modelctl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Worker API address; repeat to route entities across several workers
    #[arg(long, default_value = "http://localhost:9090", global = true)]
    api: Vec<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one input through an entity's model
    Run {
        /// Entity name
        name: String,

        /// Input value as JSON (e.g. 42 or '{"value": 42}')
        input: String,

        /// Model kind for a new entity (counter, ewma)
        #[arg(long)]
        model: Option<String>,
    },

    /// Download an entity's snapshot
    GetModel {
        /// Entity name
        name: String,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Upload a snapshot for an entity
    PutModel {
        /// Entity name
        name: String,

        /// Snapshot file
        file: PathBuf,
    },

    /// Snapshot one entity now
    SaveModel {
        /// Entity name
        name: String,
    },

    /// Snapshot every dirty entity on every worker
    SaveModels {
        /// Only write back evicted entities
        #[arg(long)]
        evicted: bool,
    },

    /// Discard an entity's state
    ResetModel {
        /// Entity name
        name: String,

        /// Replacement parameters as JSON
        #[arg(long)]
        params: Option<String>,
    },

    /// Change an entity's auto-save delay
    SetSaveDelay {
        /// Entity name
        name: String,

        /// Seconds between automatic saves, 0 disables them
        seconds: u64,
    },

    /// Show worker status
    Status,

    /// Show which worker serves an entity
    Route {
        /// Entity name
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let client = commands::ApiClient::new(&cli.api)?;

    match cli.command {
        Commands::Run { name, input, model } => {
            commands::run(&client, &name, &input, model).await?;
        }
        Commands::GetModel { name, output } => {
            commands::get_model(&client, &name, output).await?;
        }
        Commands::PutModel { name, file } => {
            commands::put_model(&client, &name, &file).await?;
        }
        Commands::SaveModel { name } => {
            commands::save_model(&client, &name).await?;
        }
        Commands::SaveModels { evicted } => {
            commands::save_models(&client, evicted).await?;
        }
        Commands::ResetModel { name, params } => {
            commands::reset_model(&client, &name, params).await?;
        }
        Commands::SetSaveDelay { name, seconds } => {
            commands::set_save_delay(&client, &name, seconds).await?;
        }
        Commands::Status => {
            commands::status(&client).await?;
        }
        Commands::Route { name } => {
            commands::route(&client, &name)?;
        }
    }

    Ok(())
}
