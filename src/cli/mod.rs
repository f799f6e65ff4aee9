//! Command-line interface for longsurf.
//!
//! Provides the `run`, `repair`, `status` and `errors` commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
