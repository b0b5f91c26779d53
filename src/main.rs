use std::sync::Arc;

use clap::Parser;
use tracing::error;

use sluice::bus::InProcessBus;
use sluice::cli::{handle_version, Cli, Command};
use sluice::config::OrchestratorConfig;
use sluice::logging::{init_logging, LogConfig};
use sluice::server;
use sluice::state::OrchestratorState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        // No subcommand or explicit `start` both launch the server.
        None | Some(Command::Start) => {
            let log_config = if cli.json_logs {
                LogConfig::production()
            } else {
                LogConfig::default()
            };
            init_logging(log_config)?;

            let config = OrchestratorConfig::from_env();
            let bus = Arc::new(InProcessBus::new());
            let state = Arc::new(OrchestratorState::new(config, bus).map_err(|e| {
                error!(error = %e, "failed to build orchestrator state");
                e
            })?);
            state.wire_flush();

            server::serve(state).await?;
            Ok(())
        }

        Some(Command::Version) => {
            handle_version();
            Ok(())
        }
    }
}
