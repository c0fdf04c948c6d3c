//! Command-line interface for the Strata metadata server.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Strata MDS - clustered metadata cache server.
#[derive(Parser)]
#[command(name = "strata-mds")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (JSON)
    #[arg(short, long, env = "STRATA_MDS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "STRATA_MDS_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run every configured node as an in-process cluster
    Serve {
        /// Emit JSON log lines
        #[arg(long)]
        json_logs: bool,
    },

    /// Print the development configuration as JSON
    Config {
        /// Node the configuration is written for
        #[arg(short, long, default_value_t = 0)]
        node_id: u64,
    },

    /// Show version information
    Version,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_serve() {
        let cli = Cli::parse_from(["strata-mds", "-l", "debug", "serve", "--json-logs"]);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Commands::Serve { json_logs: true }));
    }

    #[test]
    fn test_parse_config() {
        let cli = Cli::parse_from(["strata-mds", "config", "--node-id", "2"]);
        assert!(matches!(cli.command, Commands::Config { node_id: 2 }));
    }
}
