//! Main entry point for the assistant tool server.

use ada_server::{cli, plugins, registry::Registry, server, settings::Settings, telemetry};
use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let settings = Settings::load()?;

    match args.command {
        cli::Commands::Serve { addr } => {
            telemetry::init(&settings.logging)?;
            server::serve(settings, addr).await
        }
        cli::Commands::Schema => {
            let mut registry = Registry::new();
            registry.register_all(plugins::default_plugins());
            println!("{}", serde_json::to_string_pretty(&registry.build_schema())?);
            Ok(())
        }
    }
}
