//! Strata MDS CLI - Main entry point.

use strata_mds::cli::{Cli, Commands};
use strata_mds::config::MdsConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    match cli.command {
        Commands::Serve { json_logs } => {
            let mut config = match &cli.config {
                Some(path) => MdsConfig::from_file(path)?,
                None => MdsConfig::development(),
            };
            if let Some(level) = cli.log_level {
                config.observability.log_level = level;
            }
            if json_logs {
                config.observability.json_logs = true;
            }

            strata_mds::run(config).await?;
        }

        Commands::Config { node_id } => {
            let config = MdsConfig::development().for_node(node_id);
            config.validate()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Version => {
            println!("strata-mds {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
