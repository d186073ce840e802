use std::any::Any;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::deadlock::InstantiationContext;
use crate::dependency_resolver::{DependencyResolver, DependencyResolverManager, ModuleInternalInfo};
use crate::identifier::ModuleIdentifier;

/// The live capability object produced by a module.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// A configurable unit with a validate / instantiate / reuse / close lifecycle.
///
/// Implementations are created by a [`ModuleFactory`] and declare their
/// dependencies through the [`DependencyResolver`] handed to the factory.
pub trait Module: Send + Sync + 'static {
    fn identifier(&self) -> &ModuleIdentifier;

    /// Checks the configuration. This is the only place where dependencies
    /// may be declared; must be idempotent.
    fn validate(&self) -> anyhow::Result<()>;

    /// Returns the live instance, creating it if necessary.
    ///
    /// `ctx` is the chain of modules being instantiated on this call path and
    /// must be passed along to any dependency resolved from here.
    fn get_instance(&self, ctx: &InstantiationContext) -> anyhow::Result<Instance>;

    /// Whether this (new) module may keep the instance of `old`.
    fn can_reuse(&self, _old: &dyn Module) -> bool {
        false
    }

    /// Tears down the live instance, if any.
    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Forbids reuse of the predecessor's instance for the rest of the transaction.
    fn request_recreate(&self) {}

    fn as_any(&self) -> &dyn Any;
}

/// Builds modules of one implementation.
pub trait ModuleFactory: Send + Sync + 'static {
    fn implementation_name(&self) -> &str;

    fn create_module(
        &self,
        instance_name: &str,
        resolver: Arc<DependencyResolver>,
    ) -> anyhow::Result<Arc<dyn Module>>;

    /// Builds the module that continues `old` in a new transaction.
    fn create_module_from_old(
        &self,
        instance_name: &str,
        resolver: Arc<DependencyResolver>,
        old: &ModuleInternalInfo,
    ) -> anyhow::Result<Arc<dyn Module>>;

    /// Qualified names of the service interfaces this factory's modules provide.
    fn service_interfaces(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    fn implements_service_interface(&self, service_interface: &str) -> bool {
        self.service_interfaces().contains(service_interface)
    }

    /// Modules contributed automatically when the factory first appears.
    fn default_modules(
        &self,
        _resolvers: &DependencyResolverManager,
    ) -> anyhow::Result<Vec<Arc<dyn Module>>> {
        Ok(Vec::new())
    }
}

/// Opaque handle owned by a collaborator; the core only ever closes it.
pub trait Registration: Send + Sync {
    fn close(&self);
}

/// Management front end: exposes a module for the lifetime of a transaction.
pub trait ManagementRegistrar: Send + Sync {
    fn register_transaction_module(
        &self,
        transaction: &str,
        module: &ModuleIdentifier,
    ) -> anyhow::Result<Box<dyn Registration>>;
}

/// Discovery registry: publishes committed instances under their service names.
pub trait ServicePublisher: Send + Sync {
    /// `services` maps service interface name to reference name.
    fn publish(
        &self,
        module: &ModuleIdentifier,
        instance: &Instance,
        services: &BTreeMap<String, String>,
    ) -> anyhow::Result<Box<dyn Registration>>;
}

/// Registrar and publisher that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRegistrar;

struct NoopRegistration;

impl Registration for NoopRegistration {
    fn close(&self) {}
}

impl ManagementRegistrar for NoopRegistrar {
    fn register_transaction_module(
        &self,
        _transaction: &str,
        _module: &ModuleIdentifier,
    ) -> anyhow::Result<Box<dyn Registration>> {
        Ok(Box::new(NoopRegistration))
    }
}

impl ServicePublisher for NoopRegistrar {
    fn publish(
        &self,
        _module: &ModuleIdentifier,
        _instance: &Instance,
        _services: &BTreeMap<String, String>,
    ) -> anyhow::Result<Box<dyn Registration>> {
        Ok(Box::new(NoopRegistration))
    }
}
