//! Command-line interface for grid-broker.
//!
//! Provides the long-running `serve` command plus one-shot operator
//! commands for migrations, sweeps, priorities and queue blocking.

mod commands;
pub mod serve;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
