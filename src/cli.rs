//! Command-line interface.

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "sluice", about = "Streaming chat orchestrator", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Emit JSON logs (production format)
    #[arg(long, global = true)]
    pub json_logs: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the orchestrator (default)
    Start,
    /// Print version information
    Version,
}

pub fn handle_version() {
    println!("sluice {}", env!("CARGO_PKG_VERSION"));
}
