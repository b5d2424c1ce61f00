//! CLI argument definitions using clap
//!
//! Commands:
//! - pgfleet init --config <path>
//! - pgfleet serve --config <path>
//! - pgfleet rotate-check --config <path> [--force] [--no-propagate]

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// pgfleet - control plane for PostgreSQL fleets
#[derive(Parser, Debug)]
#[command(name = "pgfleet")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the data directory and this instance's federation identity
    Init {
        /// Path to configuration file; written with defaults if missing
        #[arg(long, default_value = "./pgfleet.json")]
        config: PathBuf,
    },

    /// Serve the control-plane API with background workers
    Serve {
        /// Path to configuration file
        #[arg(long, default_value = "./pgfleet.json")]
        config: PathBuf,
    },

    /// Rotate the superuser credential if due, then propagate it
    RotateCheck {
        /// Path to configuration file
        #[arg(long, default_value = "./pgfleet.json")]
        config: PathBuf,

        /// Rotate even when the interval has not elapsed
        #[arg(long)]
        force: bool,

        /// Skip propagation after a rotation
        #[arg(long)]
        no_propagate: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rotate_check_flags() {
        let cli = Cli::try_parse_from(["pgfleet", "rotate-check", "--force"]).unwrap();
        match cli.command {
            Command::RotateCheck {
                config,
                force,
                no_propagate,
            } => {
                assert_eq!(config, PathBuf::from("./pgfleet.json"));
                assert!(force);
                assert!(!no_propagate);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(Cli::try_parse_from(["pgfleet", "query"]).is_err());
    }
}
