//! CLI module for Blockgraph
//!
//! Provides commands:
//! - `serve`: Run the collaboration server (default)
//! - `config`: Print the effective configuration

use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::server::{self, AppConfig};

/// Blockgraph collaboration server CLI
#[derive(Parser, Debug)]
#[command(name = "blockgraph")]
#[command(about = "Real-time collaborative editing server for model canvases")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub overrides: Overrides,
}

/// Flags that take precedence over files and environment
#[derive(Args, Debug, Default)]
pub struct Overrides {
    /// Address to bind
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port to bind
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Evict rooms left empty for this many seconds
    #[arg(long, global = true)]
    pub idle_eviction_secs: Option<u64>,
}

impl Overrides {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(secs) = self.idle_eviction_secs {
            config.hub = config
                .hub
                .clone()
                .with_idle_eviction(Duration::from_secs(secs));
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the server (default)
    Serve,
    /// Print the effective configuration as TOML
    Config,
}

/// Run the CLI command
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = server::load_config()?;
    cli.overrides.apply(&mut config);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => server::run(config).await,
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply() {
        let mut config = AppConfig::default();
        let overrides = Overrides {
            host: Some("127.0.0.1".to_string()),
            port: Some(9000),
            idle_eviction_secs: Some(600),
        };
        overrides.apply(&mut config);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.hub.idle_eviction(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_cli_parses_without_subcommand() {
        let cli = Cli::parse_from(["blockgraph", "--port", "8088"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.overrides.port, Some(8088));
    }
}
