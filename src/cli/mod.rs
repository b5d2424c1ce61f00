//! CLI module for pgfleet
//!
//! Provides command-line interface for:
//! - init: Create the data directory and federation identity
//! - serve: Run the HTTP API and background workers
//! - rotate-check: One scheduled rotation check

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{init, rotate_check, run, run_command, serve};
pub use errors::{CliError, CliResult};
