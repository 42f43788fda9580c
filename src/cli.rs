//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Graph Session - OAuth 2.0 authorization code demo host for Microsoft Graph
#[derive(Parser, Debug)]
#[command(name = "graph-session")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "GRAPH_SESSION_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "GRAPH_SESSION_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "GRAPH_SESSION_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "GRAPH_SESSION_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "GRAPH_SESSION_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the demo host (default)
    Serve,

    /// Validate configuration and print the effective settings (secret masked)
    CheckConfig,
}
