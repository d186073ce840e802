//! Identifiers for modules and transactions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique key of a module inside one transaction: the factory that builds it
/// plus the instance name chosen by the user.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModuleIdentifier {
    factory_name: String,
    instance_name: String,
}

impl ModuleIdentifier {
    pub fn new(factory_name: impl Into<String>, instance_name: impl Into<String>) -> Self {
        Self {
            factory_name: factory_name.into(),
            instance_name: instance_name.into(),
        }
    }

    pub fn factory_name(&self) -> &str {
        &self.factory_name
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }
}

impl fmt::Display for ModuleIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.factory_name, self.instance_name)
    }
}

/// Name of a single configuration transaction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionIdentifier(String);

impl TransactionIdentifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// `<prefix>-<parent_version>-<counter>`
    pub fn for_version(prefix: &str, parent_version: u64, counter: u64) -> Self {
        Self(format!("{prefix}-{parent_version}-{counter}"))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Formats a chain of identifiers as `a -> b -> c`.
pub(crate) fn format_chain(chain: &[ModuleIdentifier]) -> String {
    chain
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}
