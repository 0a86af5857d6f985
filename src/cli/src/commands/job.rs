//! Job commands.
//!
//! Provides add and show operations for individual jobs.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Subcommand, ValueEnum};
use panqueue_core::jobs::{Backoff, EnqueueOutcome, JobId, JobOptions, JobRecord, Payload};
use panqueue_core::QueueError;
use serde::Serialize;

use crate::client::QueueClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum JobCommands {
    /// Enqueue a job
    Add {
        /// Queue id
        queue: String,

        /// Job payload as JSON
        data: String,

        /// Job id (idempotency key); generated when omitted
        #[arg(long)]
        id: Option<String>,

        /// Delay before the job becomes claimable (milliseconds)
        #[arg(long, default_value = "0")]
        delay_ms: u64,

        /// Retries after the first attempt
        #[arg(long, default_value = "0")]
        retries: u32,

        /// Backoff policy between retries
        #[arg(long, value_enum)]
        backoff: Option<BackoffArg>,

        /// Base backoff delay (milliseconds)
        #[arg(long, default_value = "1000")]
        backoff_delay_ms: u64,
    },

    /// Show a job record
    Show {
        /// Queue id
        queue: String,

        /// Job id
        id: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum BackoffArg {
    Fixed,
    Exponential,
}

impl BackoffArg {
    fn with_delay(self, delay_ms: u64) -> Backoff {
        match self {
            Self::Fixed => Backoff::fixed(delay_ms),
            Self::Exponential => Backoff::exponential(delay_ms),
        }
    }
}

#[derive(Debug, Serialize)]
struct AddResult<'a> {
    created: bool,
    job: &'a JobRecord,
}

// ── Execution ───────────────────────────────────────────────────────────────

pub async fn execute(cmd: JobCommands, client: &QueueClient, format: OutputFormat) -> Result<()> {
    match cmd {
        JobCommands::Add {
            queue,
            data,
            id,
            delay_ms,
            retries,
            backoff,
            backoff_delay_ms,
        } => {
            let payload = Payload::from_json(data).context("Payload must be valid JSON")?;
            let mut options = JobOptions::new()
                .with_delay_ms(delay_ms)
                .with_retries(retries);
            if let Some(id) = id {
                options = options.with_job_id(id);
            }
            if let Some(kind) = backoff {
                options = options.with_backoff(kind.with_delay(backoff_delay_ms));
            }

            let outcome = client.queue(&queue)?.enqueue_payload(payload, options).await?;
            let created = outcome.is_created();
            let record = match &outcome {
                EnqueueOutcome::Created(record) | EnqueueOutcome::Existing(record) => record,
            };

            match format {
                OutputFormat::Table => {
                    if created {
                        output::print_success("Job enqueued");
                    } else {
                        output::print_info("Job id already exists; existing job left unchanged");
                    }
                    print_record(record);
                }
                _ => output::print_item(&AddResult { created, job: record }, format)?,
            }
        }

        JobCommands::Show { queue, id } => {
            let job_id = JobId::parse(id.clone())?;
            let record = client
                .queue(&queue)?
                .get_job(&job_id)
                .await?
                .ok_or_else(|| QueueError::job_not_found(&queue, id))?;

            match format {
                OutputFormat::Table => {
                    output::print_header(&format!("Job: {}", record.id));
                    print_record(&record);
                }
                _ => output::print_item(&record, format)?,
            }
        }
    }

    Ok(())
}

fn print_record(record: &JobRecord) {
    let timestamp = |ms: Option<i64>| {
        ms.and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
    };

    output::print_detail("ID", record.id.as_str());
    output::print_detail("Queue", &record.queue_id);
    output::print_detail("Status", &output::status_label(record.status));
    output::print_detail(
        "Attempts",
        &format!("{} (max retries {})", record.attempts, record.max_retries),
    );
    if let Some(backoff) = &record.backoff {
        output::print_detail(
            "Backoff",
            &format!("{:?} {} ms", backoff.kind, backoff.delay_ms).to_lowercase(),
        );
    }
    output::print_detail("Created", &timestamp(Some(record.created_at)));
    output::print_detail("Processed", &timestamp(record.processed_at));
    output::print_detail("Finished", &timestamp(record.finished_at));
    if let Some(worker) = &record.claimed_by {
        output::print_detail("Claimed By", worker);
    }
    if let Some(reason) = &record.failed_reason {
        output::print_detail("Failed Reason", reason);
    }
    output::print_detail("Data", record.data.as_str());
}
