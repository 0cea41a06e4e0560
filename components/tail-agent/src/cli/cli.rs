use crate::{helpers::load_config::Config, runtime};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/ves/tail_agent.toml";

#[derive(Debug, Parser)]
#[command(
    name = "ves-tail",
    long_about = "VES tail agent follows the newest log file of each configured project, \
                  forwards new lines and remembers how far it has read across restarts.",
    about = "Position-tracked log file tailing",
    version,
    term_width = 100,
    color = clap::ColorChoice::Always,
    after_help = "\
    EXAMPLES:
        ves-tail run --config /etc/ves/tail_agent.toml
        ves-tail validate --config ./your_config.toml"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the tail agent until SIGINT, SIGTERM or SIGTSTP
    Run {
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Validate the configuration file and print it with defaults filled in
    Validate {
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Display version information
    Version,
}

/// Entry function for CLI
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => runtime::runtime::run_tail_agent(config).await?,
        Commands::Validate { config } => validate_config(config)?,
        Commands::Version => show_version(),
    }

    Ok(())
}

//
// ------------------------ Command Implementations ------------------------------
//

/// Validate configuration file
fn validate_config(config: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config);
    let cfg = Config::load(&config)?;
    println!("Configuration valid:\n{}", cfg.to_toml()?);
    Ok(())
}

/// Show version information
fn show_version() {
    println!("VES Tail Agent {}", env!("CARGO_PKG_VERSION"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_defaults_config_path() {
        let cli = Cli::try_parse_from(["ves-tail", "run"]).expect("parse");
        match cli.command {
            Commands::Run { config } => assert_eq!(config, PathBuf::from(DEFAULT_CONFIG_PATH)),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn validate_accepts_short_flag() {
        let cli = Cli::try_parse_from(["ves-tail", "validate", "-c", "./agent.toml"]).expect("parse");
        assert!(matches!(
            cli.command,
            Commands::Validate { config } if config == PathBuf::from("./agent.toml")
        ));
    }
}
