use anyhow::Result;
use clap::{Parser, Subcommand};
use common::{init_structured_logging, LoggingConfig};

mod commands;

use commands::{ConfigCommand, SimulateCommand};

#[derive(Parser)]
#[command(name = "commsctl")]
#[command(about = "Drive and inspect the resilient service-communication layer")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated service mesh through optimized_call and report stats
    Simulate(SimulateCommand),
    /// Print the effective configuration as TOML
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let logging = LoggingConfig {
        json_output: matches!(&cli.command, Commands::Simulate(cmd) if cmd.json_logs),
        ..LoggingConfig::default()
    };
    init_structured_logging(logging)?;

    match cli.command {
        Commands::Simulate(cmd) => cmd.execute().await,
        Commands::Config(cmd) => cmd.execute(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_simulate_arguments_parse() {
        let cli = Cli::try_parse_from([
            "commsctl",
            "simulate",
            "--calls",
            "50",
            "--concurrency",
            "4",
            "--failure-rate",
            "0.25",
            "--json-logs",
        ])
        .expect("Test operation should succeed");

        match cli.command {
            Commands::Simulate(cmd) => {
                assert_eq!(cmd.calls, 50);
                assert_eq!(cmd.concurrency, 4);
                assert_eq!(cmd.failure_rate, 0.25);
                assert!(cmd.json_logs);
            }
            Commands::Config(_) => panic!("expected simulate"),
        }
    }

    #[test]
    fn test_failure_rate_out_of_range_is_rejected() {
        let parsed = Cli::try_parse_from(["commsctl", "simulate", "--failure-rate", "1.5"]);
        assert!(parsed.is_err());
    }
}
