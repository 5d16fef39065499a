//! Command-line interface definitions using clap derive API.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;

/// Assistant tool server CLI
#[derive(Parser)]
#[command(name = "ada-server")]
#[command(about = "Tool platform for a conversational assistant")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the WebSocket/HTTP server
    Serve {
        /// Bind address, overriding the configured host and port
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
    /// Print the function-calling schema and exit
    Schema,
}
