//! Subcommand implementations.

pub mod job;
pub mod queue;
