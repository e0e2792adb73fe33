mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sffire_storage::ConnectionParams;
use sffire_sync::SyncOverrides;

#[derive(Debug, Parser)]
#[command(name = "sffire-cli", version)]
#[command(about = "Incremental sync of SF fire incidents into PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract recent incidents and upsert them into the destination table
    Sync {
        /// Days before now the extraction window starts
        #[arg(long)]
        lookback_days: Option<i64>,
        /// Destination table inside DB_SCHEMA
        #[arg(long)]
        table: Option<String>,
        /// Run the full pipeline against an in-memory destination
        #[arg(long)]
        dry_run: bool,
    },
    /// Verify the destination database is reachable
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    let command = cli.command.unwrap_or(Commands::Sync {
        lookback_days: None,
        table: None,
        dry_run: false,
    });

    match command {
        Commands::Sync {
            lookback_days,
            table,
            dry_run,
        } => {
            let overrides = SyncOverrides {
                lookback_days,
                table,
                dry_run,
            };
            let summary = sffire_sync::run_sync_once_from_env(&overrides).await?;
            println!(
                "sync complete: run_id={} watermark={} extracted={} written={} batches={}",
                summary.run_id,
                summary.watermark,
                summary.extracted_records,
                summary.load.written_rows,
                summary.load.batches
            );
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("rendering run summary")?
            );
        }
        Commands::Check => {
            let params = ConnectionParams::from_env();
            sffire_storage::check_connection(&params).await?;
            println!("connection ok: {}:{}/{}", params.host, params.port, params.database);
        }
    }

    Ok(())
}
