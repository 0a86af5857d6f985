//! Queue commands.
//!
//! Provides stats, promote and recover operations for a whole queue.

use anyhow::Result;
use clap::Subcommand;
use panqueue_core::jobs::queue::{DEFAULT_PROMOTE_BATCH, DEFAULT_RECOVERY_BATCH};
use panqueue_core::jobs::{JobStatus, QueueCounts};
use serde::Serialize;
use tabled::Tabled;

use crate::client::QueueClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Show state collection sizes
    Stats {
        /// Queue id
        queue: String,
    },

    /// Move due delayed jobs to waiting
    Promote {
        /// Queue id
        queue: String,

        /// Maximum jobs moved
        #[arg(short, long, default_value_t = DEFAULT_PROMOTE_BATCH)]
        limit: usize,
    },

    /// Fail active jobs claimed longer ago than the stall threshold
    Recover {
        /// Queue id
        queue: String,

        /// Stall threshold (milliseconds)
        #[arg(long)]
        stall_ms: u64,

        /// Maximum jobs handled
        #[arg(short, long, default_value_t = DEFAULT_RECOVERY_BATCH)]
        limit: usize,
    },
}

#[derive(Debug, Serialize, Tabled)]
struct StateRow {
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Jobs")]
    count: usize,
}

#[derive(Debug, Serialize)]
struct QueueStats {
    queue: String,
    #[serde(flatten)]
    counts: QueueCounts,
    consistent: bool,
}

fn state_rows(counts: &QueueCounts) -> Vec<StateRow> {
    [
        (JobStatus::Waiting, counts.waiting),
        (JobStatus::Delayed, counts.delayed),
        (JobStatus::Active, counts.active),
        (JobStatus::Completed, counts.completed),
        (JobStatus::Failed, counts.failed),
    ]
    .into_iter()
    .map(|(status, count)| StateRow {
        state: output::status_label(status),
        count,
    })
    .collect()
}

// ── Execution ───────────────────────────────────────────────────────────────

pub async fn execute(cmd: QueueCommands, client: &QueueClient, format: OutputFormat) -> Result<()> {
    match cmd {
        QueueCommands::Stats { queue } => {
            let counts = client.queue(&queue)?.counts().await?;
            let consistent = counts.total_members() == counts.jobs;

            match format {
                OutputFormat::Table => {
                    output::print_header(&format!("Queue: {}", queue));
                    output::print_list(&state_rows(&counts), format)?;
                    output::print_detail("Records", &counts.jobs.to_string());
                    if !consistent {
                        output::print_error(&format!(
                            "{} job records but {} state memberships",
                            counts.jobs,
                            counts.total_members()
                        ));
                    }
                }
                _ => output::print_item(
                    &QueueStats {
                        queue,
                        counts,
                        consistent,
                    },
                    format,
                )?,
            }
        }

        QueueCommands::Promote { queue, limit } => {
            let promotion = client.queue(&queue)?.promote_delayed(limit).await?;

            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Promoted {} job(s)", promotion.promoted));
                    if !promotion.orphaned.is_empty() {
                        output::print_error(&format!(
                            "Dropped {} delayed id(s) without job records",
                            promotion.orphaned.len()
                        ));
                        for id in &promotion.orphaned {
                            output::print_detail("Orphaned", id.as_str());
                        }
                    }
                    if !promotion.corrupt.is_empty() {
                        output::print_error(&format!(
                            "Moved {} undecodable delayed job(s) to failed",
                            promotion.corrupt.len()
                        ));
                        for id in &promotion.corrupt {
                            output::print_detail("Corrupt", id.as_str());
                        }
                    }
                }
                _ => output::print_item(&promotion, format)?,
            }
        }

        QueueCommands::Recover {
            queue,
            stall_ms,
            limit,
        } => {
            let recovery = client
                .queue(&queue)?
                .recover_stalled(stall_ms, limit)
                .await?;

            match format {
                OutputFormat::Table => {
                    if recovery.total() == 0 {
                        output::print_info("No stalled jobs");
                    } else {
                        output::print_success(&format!(
                            "Recovered {} stalled job(s)",
                            recovery.total()
                        ));
                    }
                    output::print_detail("Retrying", &recovery.retried.len().to_string());
                    output::print_detail("Failed", &recovery.failed.len().to_string());
                    if !recovery.orphaned.is_empty() {
                        output::print_error(&format!(
                            "Cleared {} active id(s) without job records",
                            recovery.orphaned.len()
                        ));
                    }
                    if !recovery.corrupt.is_empty() {
                        output::print_error(&format!(
                            "Moved {} undecodable active job(s) to failed",
                            recovery.corrupt.len()
                        ));
                    }
                }
                _ => output::print_item(&recovery, format)?,
            }
        }
    }

    Ok(())
}
