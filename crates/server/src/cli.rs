use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub fn default_workers() -> u16 {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(64) as u16
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "stevedore",
    version,
    about = "Cluster workload orchestrator scheduling core"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the scheduling engine against a synthetic node fleet until
    /// interrupted.
    Agent {
        /// JSON file with the node fleet (array of node records).
        #[arg(long, env = "STEVEDORE_NODES")]
        nodes: PathBuf,

        /// Job files to register at startup.
        #[arg(long = "job", value_name = "FILE")]
        jobs: Vec<PathBuf>,

        /// Number of scheduling workers.
        #[arg(
            short = 'w',
            long,
            env = "STEVEDORE_WORKERS",
            default_value_t = default_workers(),
            value_parser = clap::value_parser!(u16).range(1..=64)
        )]
        workers: u16,
    },

    /// Schedule the given jobs once, simulating healthy clients, and print
    /// the placement report.
    Simulate {
        /// JSON file with the node fleet (array of node records).
        #[arg(long, env = "STEVEDORE_NODES")]
        nodes: PathBuf,

        /// Job files to schedule.
        #[arg(required = true, value_name = "JOB_FILE")]
        jobs: Vec<PathBuf>,

        /// Number of scheduling workers.
        #[arg(
            short = 'w',
            long,
            default_value_t = default_workers(),
            value_parser = clap::value_parser!(u16).range(1..=64)
        )]
        workers: u16,

        /// Give up if the cluster has not settled after this many seconds.
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Parse and check a job file offline.
    Validate {
        /// Job file to check.
        job: PathBuf,
    },
}
