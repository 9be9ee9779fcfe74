pub mod config;
pub mod simulate;

pub use config::ConfigCommand;
pub use simulate::SimulateCommand;

use comms::{CommsConfig, ConfigLoader};
use std::path::Path;

/// Load the configuration file (if any) with `COMMS_` environment overrides
pub(crate) fn load_config(path: Option<&Path>) -> anyhow::Result<CommsConfig> {
    let loader = match path {
        Some(path) => ConfigLoader::new().with_path(path),
        None => ConfigLoader::new(),
    };
    loader.load()
}
