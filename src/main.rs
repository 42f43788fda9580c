//! Graph Session - OAuth 2.0 authorization code demo host for Microsoft Graph

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use graph_session::{
    cli::{Cli, Command},
    config::HostConfig,
    server, setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match HostConfig::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::CheckConfig) => check_config(&config),
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Print the effective configuration with the secret masked
fn check_config(config: &HostConfig) -> ExitCode {
    let mut shown = config.clone();
    shown.session = config.session.redacted();

    match serde_yaml::to_string(&shown) {
        Ok(yaml) => {
            println!("✅ Configuration valid\n");
            println!("{yaml}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Failed to render configuration: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config: HostConfig) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        scopes = %config.session.scope_string(),
        "Starting Graph session host"
    );

    if let Err(e) = server::run(config).await {
        error!("Host error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
