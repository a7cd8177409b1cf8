//! Command-line interface for queuectl.
//!
//! Provides commands for initializing the store, enqueueing jobs, managing
//! workers, inspecting the dead letter queue and changing configuration.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
