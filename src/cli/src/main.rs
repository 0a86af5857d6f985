//! Panqueue CLI - Command-line interface for operating Panqueue job queues.
//!
//! Provides commands for enqueuing and inspecting jobs and for queue
//! maintenance (delayed promotion, stall recovery).

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{job, queue};
use output::OutputFormat;

/// Panqueue - Redis-backed job queue CLI
#[derive(Parser)]
#[command(
    name = "panq",
    version,
    about = "Panqueue - Redis-backed job queue",
    long_about = "CLI tool for enqueuing, inspecting and maintaining Panqueue job queues.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Redis server URL
    #[arg(
        long,
        global = true,
        env = "PANQUEUE_REDIS_URL",
        default_value = "redis://127.0.0.1:6379"
    )]
    redis_url: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Job operations
    #[command(subcommand)]
    Job(job::JobCommands),

    /// Queue operations
    #[command(subcommand)]
    Queue(queue::QueueCommands),
}

async fn run(cli: Cli) -> Result<()> {
    let client = client::QueueClient::connect(&cli.redis_url).await?;
    let format = cli.output;

    let result = match cli.command {
        Commands::Job(cmd) => job::execute(cmd, &client, format).await,
        Commands::Queue(cmd) => queue::execute(cmd, &client, format).await,
    };

    client.close().await?;
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
