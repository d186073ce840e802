//! # ConfigKit - Transactional Module Configuration
//!
//! Creates, reconfigures and destroys modules as one atomic unit.
//!
//! ## Features
//!
//! - **Transactional**: changes are validated as a whole and committed or discarded together
//! - **Dependency-ordered**: modules declare dependencies while validating; commit order
//!   follows dependency depth, and cycles are rejected with the full path
//! - **Safe instantiation**: every module handle is a caching proxy; recursive
//!   instantiation fails fast instead of hanging
//! - **Reuse aware**: a reconfigured module may keep its predecessor's live instance
//!
//! ## Example
//!
//! ```rust,ignore
//! use configkit::ConfigRegistry;
//! use std::sync::Arc;
//!
//! let registry = ConfigRegistry::builder()
//!     .factory(Arc::new(ThreadPoolFactory))
//!     .factory(Arc::new(HttpServerFactory))
//!     .build();
//!
//! let tx = registry.begin_config(false)?;
//! tx.create_module("thread-pool", "workers")?;
//! tx.create_module("http-server", "public")?;
//! let status = registry.commit_config(tx.name())?;
//! tracing::info!(new = ?status.new_instances, "committed");
//! ```

pub use anyhow::Result;

pub mod contracts;
pub use contracts::{
    Instance, ManagementRegistrar, Module, ModuleFactory, NoopRegistrar, Registration,
    ServicePublisher,
};

pub mod deadlock;
pub use deadlock::{DeadlockMonitor, InstantiationContext, InstantiationWatchdog};

pub mod dependency_resolver;
pub use dependency_resolver::{
    CommitInfo, DependencyResolver, DependencyResolverManager, DestroyedModule,
    ModuleInternalInfo, ModuleInternalTransactionalInfo, ModuleReference, ModulesHolder,
    ProxiedModule, ResolverPhase,
};

pub mod errors;
pub use errors::{ConfigError, ValidationError, ValidationReport};

pub mod factories;
pub use factories::FactoriesHolder;

pub mod identifier;
pub use identifier::{ModuleIdentifier, TransactionIdentifier};

pub mod registry;
pub use registry::{CommitStatus, ConfigRegistry, ConfigRegistryBuilder};

pub mod service_reference;
pub use service_reference::{
    ServiceReference, ServiceReferenceLookup, ServiceReferenceRegistry, ServiceReferenceSnapshot,
};

pub mod settings;
pub use settings::RegistrySettings;

pub mod transaction;
pub use transaction::{ConfigTransactionController, TransactionState, TransactionStatus};

#[cfg(test)]
mod testing;
