use anyhow::{Context, Result};
use configkit::RegistrySettings;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Prefix of environment overrides, e.g. `CONFIGKIT__REGISTRY__TRANSACTION_PREFIX`.
pub const ENV_PREFIX: &str = "CONFIGKIT__";

/// Process configuration of a host embedding the config registry.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Registry tunables.
    #[serde(default)]
    pub registry: RegistrySettings,
    /// Logging configuration (optional, uses defaults if None).
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
    /// Base directory for relative log file paths; the working directory if unset.
    #[serde(default)]
    pub log_dir: Option<String>,
}

/// Maps target prefixes to their logging settings.
/// Key "default" is the catch-all for targets without their own section.
pub type LoggingConfig = HashMap<String, Section>;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Section {
    pub console_level: String, // "info", "debug", "error", "off"
    #[serde(default)]
    pub file: String, // "logs/configkit.log"; empty disables the file sink
    #[serde(default)]
    pub file_level: String,
    #[serde(default)]
    pub max_age_days: Option<u32>,
    #[serde(default)]
    pub max_backups: Option<usize>,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
}

pub fn default_logging_config() -> LoggingConfig {
    HashMap::from([(
        "default".to_string(),
        Section {
            console_level: "info".to_string(),
            file: "logs/configkit.log".to_string(),
            file_level: "debug".to_string(),
            max_age_days: Some(7),
            max_backups: Some(3),
            max_size_mb: Some(100),
        },
    )])
}

impl AppConfig {
    /// Layered load: defaults → YAML file → `CONFIGKIT__*` environment variables.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        let config_path = config_path.as_ref();
        if !config_path.exists() {
            anyhow::bail!("config file '{}' does not exist", config_path.display());
        }

        let figment = Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Yaml::file(config_path))
            // CONFIGKIT__REGISTRY__INSTANTIATION_WARN_AFTER=10s maps to registry.instantiation_warn_after
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment
            .extract()
            .with_context(|| format!("Failed to extract config from '{}'", config_path.display()))
    }

    /// Loads `config_path` when given, defaults with the default logging setup otherwise.
    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load_layered(path),
            None => Ok(Self {
                logging: Some(default_logging_config()),
                ..Self::default()
            }),
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config to YAML")
    }

    /// Logging sections to install; the defaults when none are configured.
    pub fn logging_or_default(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_else(default_logging_config)
    }

    /// Directory relative log paths resolve against.
    pub fn log_base_dir(&self) -> Result<PathBuf> {
        match self.log_dir.as_deref().map(str::trim) {
            Some(dir) if !dir.is_empty() => Ok(PathBuf::from(dir)),
            _ => std::env::current_dir().context("Failed to resolve the working directory"),
        }
    }

    /// Raises the console level of the "default" section: 1 → debug, 2+ → trace.
    pub fn apply_verbosity(&mut self, verbose: u8) {
        let logging = self.logging.get_or_insert_with(default_logging_config);
        if let Some(section) = logging.get_mut("default") {
            section.console_level = match verbose {
                0 => return,
                1 => "debug".to_string(),
                _ => "trace".to_string(),
            };
        }
    }
}
