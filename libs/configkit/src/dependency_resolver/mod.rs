//! Dependency tracking and commit ordering for one transaction.
//!
//! Every module gets a [`DependencyResolver`] through which it declares the
//! modules it depends on while validating. Once commit has started,
//! [`DependencyResolverManager::sorted_identifiers`] computes the dependency
//! depth of every module, rejecting cycles, and orders the working set leaf
//! first. Modules are only ever handed out wrapped in a [`ProxiedModule`].

pub mod info;
pub mod manager;
pub mod modules_holder;
pub mod proxy;
pub mod resolver;

pub use info::{CommitInfo, DestroyedModule, ModuleInternalInfo, ModuleInternalTransactionalInfo};
pub use manager::DependencyResolverManager;
pub use modules_holder::ModulesHolder;
pub use proxy::ProxiedModule;
pub use resolver::{DependencyResolver, ModuleReference, ResolverPhase};
