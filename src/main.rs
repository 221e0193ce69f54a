//! ChittyOS MCP Protocol Gateway
//!
//! Single external endpoint bridging the MCP JSON-RPC protocol, an OAuth
//! 2.1 authorization flow, and the downstream ChittyOS service fleet.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use chitty_gateway::{
    cli::{Cli, Command},
    config::Config,
    dispatch::ToolDispatcher,
    gateway::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Tools) => {
            let catalog = ToolDispatcher::catalog();
            match serde_json::to_string_pretty(&catalog) {
                Ok(json) => {
                    println!("{json}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Failed to serialize catalog: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        Some(Command::Config) => match serde_yaml::to_string(&config) {
            Ok(yaml) => {
                println!("{yaml}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Failed to serialize configuration: {e}");
                ExitCode::FAILURE
            }
        },
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Load configuration with CLI overrides applied
fn load_config(cli: &Cli) -> chitty_gateway::Result<Config> {
    let mut config = match cli.config.as_deref() {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host.clone_from(host);
    }

    Ok(config)
}

/// Run the gateway server
async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        "Starting ChittyOS gateway"
    );

    let gateway = Gateway::new(config);

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
