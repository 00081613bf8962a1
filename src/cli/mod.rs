//! Command-line interface for eventcast.
//!
//! Provides commands for running workers, supervising the worker pool,
//! and exercising the publisher from the shell.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
