//! Command-line interface.

use std::path::PathBuf;

use clap::Parser;

/// Verity Gateway - identity & decision gateway
#[derive(Parser, Debug)]
#[command(name = "verity-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "VERITY_GATEWAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "VERITY_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "VERITY_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "VERITY_GATEWAY_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "VERITY_GATEWAY_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Force regulated mode (PII minimisation) regardless of config
    #[arg(long)]
    pub regulated: bool,
}
