//! Command-line interface for kued.
//!
//! Provides commands for launching workgroups under supervision, running a
//! single workgroup in process, and the child entry point.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
