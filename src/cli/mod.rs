//! Command-line interface for evalforge.
//!
//! Provides commands to execute a run and to inspect or recover stored runs.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
