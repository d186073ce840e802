use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables of the configuration registry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistrySettings {
    /// Prefix of generated transaction names.
    pub transaction_prefix: String,
    /// An instantiation running longer than this is reported as a possible deadlock.
    #[serde(with = "humantime_serde")]
    pub instantiation_warn_after: Duration,
    /// How often the watchdog inspects in-flight instantiations.
    #[serde(with = "humantime_serde")]
    pub watchdog_poll_interval: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            transaction_prefix: "ConfigTransaction".to_string(),
            instantiation_warn_after: Duration::from_secs(5),
            watchdog_poll_interval: Duration::from_millis(500),
        }
    }
}
