use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use tracing::info;

use super::load_config;

#[derive(Debug, Args)]
pub struct ConfigCommand {
    /// Configuration file to load before environment overrides
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl ConfigCommand {
    pub fn execute(&self) -> Result<()> {
        let config = load_config(self.config.as_deref())?;
        let rendered =
            toml::to_string_pretty(&config).context("Failed to render configuration as TOML")?;

        info!(source = ?self.config, "Resolved configuration");
        println!("{rendered}");
        Ok(())
    }
}
