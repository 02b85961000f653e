mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "archload",
    version,
    about = "Config-driven ingestion of archived datasets into one table"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one ingestion cycle over every dataset
    Run {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Run only this dataset (its dependency must already have succeeded)
        #[arg(long)]
        dataset: Option<String>,
    },
    /// Validate configuration, archive contents, and backend connectivity
    Check {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
    /// List configured datasets in execution order
    Datasets {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Print definitions as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show recent dataset runs from the run ledger
    Status {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Number of runs to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run { pipeline, dataset } => {
            commands::run::execute(&pipeline, dataset.as_deref()).await
        }
        Commands::Check { pipeline } => commands::check::execute(&pipeline).await,
        Commands::Datasets { pipeline, json } => commands::datasets::execute(&pipeline, json),
        Commands::Status { pipeline, limit } => commands::status::execute(&pipeline, limit).await,
    }
}
