//! Command-line interface for swe-conductor.
//!
//! Provides commands for running the quality pipeline, replaying event logs
//! and inspecting the agent role catalogue.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
