//! Command-line interface definitions.

pub mod serve;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// SOLLOL - intelligent router for Ollama-compatible inference fleets
#[derive(Parser, Debug)]
#[command(name = "sollol", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the gateway
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Path to the configuration file
    #[arg(short, long, default_value = "sollol.toml")]
    pub config: PathBuf,

    /// Override the bind port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Override the bind host
    #[arg(long)]
    pub host: Option<String>,

    /// Override the log level
    #[arg(long)]
    pub log_level: Option<String>,

    /// Disable background health probing
    #[arg(long)]
    pub no_health_check: bool,
}
