//! Command-line interface for swe-judge.
//!
//! Provides commands for image resolution, bulk patch evaluation and
//! one-off sandbox commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
