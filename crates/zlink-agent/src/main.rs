//! zlink-agent entry point

use std::process::ExitCode;

use clap::Parser;
use zlink_agent::{logging, AgentConfig, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AgentConfig::load_from(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Held until exit so buffered file output is flushed.
    let _guard = match logging::init(&config.logging, cli.log_level.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: failed to initialize logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.execute(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
