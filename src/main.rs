//! pgfleet CLI entry point
//!
//! Parses arguments and dispatches to the CLI module. Errors are printed
//! to stderr and exit non-zero.

use pgfleet::cli;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("{}: {}", e.code(), e);
        std::process::exit(1);
    }
}
