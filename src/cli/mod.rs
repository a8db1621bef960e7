//! `cnp` command line
//!
//! - `cnp simulate` - run an in-process allocation round with simulated workers
//! - `cnp config`   - print the effective configuration and its validation result

pub mod config;
pub mod simulate;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::award::ResolutionStrategy;

/// Contract net task allocation engine
#[derive(Parser, Debug)]
#[command(name = "cnp")]
#[command(author, version, about = "Contract net task allocation engine")]
pub struct Cli {
    /// Directory holding default.toml and per-environment overrides
    #[arg(long, global = true, env = "CNP_CONFIG_DIR", default_value = "config")]
    pub config_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a composite task through simulated workers and print the allocation
    Simulate(SimulateArgs),

    /// Show the effective configuration
    Config {
        /// Read configuration from this directory instead of --config-dir
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Number of simulated workers
    #[arg(short, long, default_value = "5")]
    pub workers: usize,

    /// Number of sub-tasks the composite task is split into
    #[arg(short, long, default_value = "3")]
    pub subtasks: usize,

    /// Bidding window per sub-task in milliseconds
    #[arg(long, default_value = "500")]
    pub deadline_ms: u64,

    /// Tie resolution strategy (overrides award.strategy)
    #[arg(long)]
    pub strategy: Option<ResolutionStrategy>,

    /// Seed for reproducible worker behaviour
    #[arg(long)]
    pub seed: Option<u64>,

    /// Print the summary as JSON instead of a table
    #[arg(long)]
    pub json: bool,
}
