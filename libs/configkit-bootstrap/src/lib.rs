//! Process bootstrap for hosts of the config registry: layered configuration
//! loading and logging setup.

pub mod config;
pub mod logging;

pub use config::*;
pub use logging::*;

use configkit::{ConfigRegistry, ConfigRegistryBuilder};
use std::path::Path;

/// Loads the configuration, installs logging and returns a registry builder
/// carrying the configured registry settings.
pub fn bootstrap<P: AsRef<Path>>(
    config_path: Option<P>,
    verbose: u8,
) -> anyhow::Result<(AppConfig, ConfigRegistryBuilder)> {
    let mut config = AppConfig::load_or_default(config_path)?;
    config.apply_verbosity(verbose);
    init_logging(&config.logging_or_default(), &config.log_base_dir()?);
    tracing::info!(
        transaction_prefix = %config.registry.transaction_prefix,
        instantiation_warn_after = ?config.registry.instantiation_warn_after,
        "Configuration loaded"
    );
    let builder = ConfigRegistry::builder().settings(config.registry.clone());
    Ok((config, builder))
}
