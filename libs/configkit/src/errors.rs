use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::identifier::{format_chain, ModuleIdentifier};

/// A single validation failure, attributed to the module that declared it.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{}", self.render())]
pub struct ValidationError {
    pub module: ModuleIdentifier,
    /// Configuration attribute the failure refers to, if any.
    pub attribute: Option<String>,
    pub message: String,
}

impl ValidationError {
    pub fn new(module: ModuleIdentifier, message: impl Into<String>) -> Self {
        Self {
            module,
            attribute: None,
            message: message.into(),
        }
    }

    pub fn for_attribute(
        module: ModuleIdentifier,
        attribute: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            module,
            attribute: Some(attribute.into()),
            message: message.into(),
        }
    }

    fn render(&self) -> String {
        match &self.attribute {
            Some(attr) => format!("{} [{}]: {}", self.module, attr, self.message),
            None => format!("{}: {}", self.module, self.message),
        }
    }
}

/// Aggregate of per-module validation failures collected over a whole transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationReport {
    failures: BTreeMap<ModuleIdentifier, ValidationError>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure; the first failure per module wins.
    pub fn add(&mut self, error: ValidationError) {
        self.failures.entry(error.module.clone()).or_insert(error);
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn get(&self, module: &ModuleIdentifier) -> Option<&ValidationError> {
        self.failures.get(module)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ValidationError> {
        self.failures.values()
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleIdentifier> {
        self.failures.keys()
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.failures.values().map(ToString::to_string).collect();
        write!(f, "{}", rendered.join("; "))
    }
}

/// Structured errors of the configuration core.
#[derive(Debug, Error)]
pub enum ConfigError {
    // Per-module validation
    #[error("validation failed: {0}")]
    Validation(ValidationError),
    #[error("validation failed for {} module(s): {report}", report.len())]
    ValidationFailed { report: ValidationReport },

    // Working-set bookkeeping
    #[error("module '{0}' not found")]
    NotFound(ModuleIdentifier),
    #[error("module '{0}' already exists")]
    AlreadyExists(ModuleIdentifier),
    #[error("module factory '{0}' not found")]
    FactoryNotFound(String),
    #[error("module reported identifier '{actual}', expected '{expected}'")]
    IdentifierMismatch {
        expected: ModuleIdentifier,
        actual: ModuleIdentifier,
    },

    // Graph / instantiation
    #[error("cyclic dependency detected: {}", format_chain(path))]
    CycleDetected { path: Vec<ModuleIdentifier> },
    #[error("recursive instantiation detected: {}", format_chain(path))]
    InstantiationCycle { path: Vec<ModuleIdentifier> },
    #[error("deadlock monitor is not running, refusing to instantiate '{0}'")]
    MonitorUnavailable(ModuleIdentifier),
    #[error("instantiation of '{module}' failed in transaction '{transaction}'")]
    Commit {
        module: ModuleIdentifier,
        transaction: String,
        #[source]
        source: anyhow::Error,
    },

    // Service references
    #[error("service reference '{service_interface}'/'{ref_name}' not found")]
    ServiceReferenceNotFound {
        service_interface: String,
        ref_name: String,
    },
    #[error("module '{module}' does not implement service interface '{service_interface}'")]
    ServiceInterfaceNotImplemented {
        module: ModuleIdentifier,
        service_interface: String,
    },

    // Transaction lifecycle
    #[error("illegal transaction state: {0}")]
    IllegalState(String),
    #[error("transaction '{0}' not found")]
    TransactionNotFound(String),
    #[error("optimistic lock failed: expected parent version {expected}, was {actual}")]
    ConflictingVersion { expected: u64, actual: u64 },

    #[error("module factory '{factory}' failed")]
    Factory {
        factory: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ConfigError {
    pub(crate) fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    /// True for failures that are reported per module and leave the transaction usable.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ConfigError::Validation(_) | ConfigError::ValidationFailed { .. }
        )
    }
}

impl From<ValidationError> for ConfigError {
    fn from(e: ValidationError) -> Self {
        ConfigError::Validation(e)
    }
}
