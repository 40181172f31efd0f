//! ClimaStation ingestion
//!
//! Bulk ingestion of the DWD open data climate archive:
//!
//! - **Crawl**: walk the repository listings into a sorted JSONL manifest
//!   ([`crawler`])
//! - **Track**: one job per file in a SQLite store with atomic claims,
//!   bounded retries and stale-claim recovery ([`jobs`])
//! - **Process**: fan a dataset out to worker processes that claim files
//!   from the store ([`orchestrator`])
//! - **Sequence**: run datasets one at a time, stopping at the first that
//!   does not finish clean ([`controller`])

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod commands;
pub mod config;
pub mod controller;
pub mod crawler;
pub mod error;
pub mod jobs;
pub mod orchestrator;
pub mod processor;

pub use config::IngestConfig;
pub use error::{IngestError, Result};

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// ClimaStation ingestion tool
#[derive(Parser, Debug)]
#[command(name = "clima-ingest")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "CLIMA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run workers as tasks in this process instead of child processes
    #[arg(long, global = true)]
    pub in_process: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Crawl dataset listings and write their manifests
    Crawl {
        /// Datasets to crawl; all enabled datasets when omitted
        datasets: Vec<String>,

        /// Manifest path, only with a single dataset
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Stop after this many files
        #[arg(long)]
        limit: Option<usize>,

        /// Validate each manifest after writing it
        #[arg(long)]
        validate: bool,
    },

    /// Check a manifest's records and ordering
    ValidateManifest {
        path: PathBuf,

        /// Write the report as JSON here
        #[arg(short, long)]
        report: Option<PathBuf>,
    },

    /// Process one dataset
    Process {
        dataset: String,

        /// Skip completed files and retry failed ones
        #[arg(long)]
        incremental: bool,
    },

    /// Process datasets one after another, stopping at the first failure
    Ingest {
        /// Datasets in run order; all enabled datasets when omitted
        datasets: Vec<String>,

        #[arg(long)]
        incremental: bool,
    },

    /// Show job counts and per-worker outcomes for a dataset
    Stats {
        dataset: String,

        #[arg(long)]
        json: bool,
    },

    /// Move every job of a dataset back to pending
    ResetDataset { dataset: String },

    /// Move failed jobs back to pending with a fresh retry budget
    ResetFailed {
        dataset: String,

        /// SQL LIKE pattern on the error message
        #[arg(long)]
        pattern: Option<String>,
    },

    /// Move jobs stuck in processing back to pending
    ResetStuck {
        dataset: String,

        #[arg(long, default_value_t = 2)]
        timeout_hours: u64,
    },

    /// Delete finished jobs older than a number of days
    Cleanup {
        #[arg(long, default_value_t = 30)]
        days: u32,
    },

    /// Reclaim stale claims and prune old worker sessions
    Sweep,

    /// Job and session counts across every dataset
    DbStats {
        #[arg(long)]
        json: bool,
    },

    /// List files processing for longer than a timeout
    Stuck {
        dataset: String,

        #[arg(long, default_value_t = 2)]
        timeout_hours: u64,
    },

    /// List failed files with their errors
    Failed {
        dataset: String,

        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Run one worker assignment read from stdin
    #[command(hide = true)]
    Worker,
}

impl Commands {
    pub fn is_worker(&self) -> bool {
        matches!(self, Commands::Worker)
    }

    /// Subcommand name as typed on the command line
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Crawl { .. } => "crawl",
            Commands::ValidateManifest { .. } => "validate-manifest",
            Commands::Process { .. } => "process",
            Commands::Ingest { .. } => "ingest",
            Commands::Stats { .. } => "stats",
            Commands::ResetDataset { .. } => "reset-dataset",
            Commands::ResetFailed { .. } => "reset-failed",
            Commands::ResetStuck { .. } => "reset-stuck",
            Commands::Cleanup { .. } => "cleanup",
            Commands::Sweep => "sweep",
            Commands::DbStats { .. } => "db-stats",
            Commands::Stuck { .. } => "stuck",
            Commands::Failed { .. } => "failed",
            Commands::Worker => "worker",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_ingest_order() {
        let cli = Cli::parse_from(["clima-ingest", "ingest", "b", "a", "--incremental", "--in-process"]);
        match cli.command {
            Commands::Ingest {
                datasets,
                incremental,
            } => {
                assert_eq!(datasets, vec!["b", "a"]);
                assert!(incremental);
            },
            other => panic!("unexpected command {:?}", other),
        }
        assert!(cli.in_process);
    }

    #[test]
    fn test_command_names_match_cli() {
        let cli = Cli::parse_from(["clima-ingest", "db-stats", "--json"]);
        assert_eq!(cli.command.name(), "db-stats");
        let cli = Cli::parse_from(["clima-ingest", "stuck", "x", "--timeout-hours", "6"]);
        assert_eq!(cli.command.name(), "stuck");
        let cli = Cli::parse_from(["clima-ingest", "validate-manifest", "m.jsonl"]);
        assert_eq!(cli.command.name(), "validate-manifest");
    }
}
