//! Records describing modules inside and between transactions.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::contracts::{Instance, Module, ModuleFactory, Registration};
use crate::dependency_resolver::proxy::ProxiedModule;
use crate::errors::ConfigError;
use crate::identifier::ModuleIdentifier;

fn close_registration(slot: &Mutex<Option<Box<dyn Registration>>>) {
    if let Some(reg) = slot.lock().take() {
        reg.close();
    }
}

/// A module as committed by a previous transaction, together with its live instance.
pub struct ModuleInternalInfo {
    identifier: ModuleIdentifier,
    module: Arc<dyn Module>,
    instance: Instance,
    factory: Arc<dyn ModuleFactory>,
    ordering_idx: usize,
    is_default: bool,
    service_registration: Mutex<Option<Box<dyn Registration>>>,
}

impl std::fmt::Debug for ModuleInternalInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInternalInfo")
            .field("identifier", &self.identifier)
            .field("factory", &self.factory.implementation_name())
            .field("ordering_idx", &self.ordering_idx)
            .field("is_default", &self.is_default)
            .field("has_service_registration", &self.service_registration.lock().is_some())
            .finish()
    }
}

impl ModuleInternalInfo {
    pub fn new(
        identifier: ModuleIdentifier,
        module: Arc<dyn Module>,
        instance: Instance,
        factory: Arc<dyn ModuleFactory>,
        ordering_idx: usize,
        is_default: bool,
        service_registration: Option<Box<dyn Registration>>,
    ) -> Self {
        Self {
            identifier,
            module,
            instance,
            factory,
            ordering_idx,
            is_default,
            service_registration: Mutex::new(service_registration),
        }
    }

    pub fn identifier(&self) -> &ModuleIdentifier {
        &self.identifier
    }

    /// The real (unproxied) module that produced the instance.
    pub fn module(&self) -> &Arc<dyn Module> {
        &self.module
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn factory(&self) -> &Arc<dyn ModuleFactory> {
        &self.factory
    }

    /// Position in the commit order, which runs deepest module first.
    ///
    /// This is the inverse of the dependency depth, not the depth itself:
    /// dependents get the lowest indices and are torn down first.
    pub fn ordering_idx(&self) -> usize {
        self.ordering_idx
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    pub(crate) fn take_service_registration(&self) -> Option<Box<dyn Registration>> {
        self.service_registration.lock().take()
    }

    pub(crate) fn close_service_registration(&self) {
        close_registration(&self.service_registration);
    }

    pub fn to_destroyed_module(&self) -> DestroyedModule {
        DestroyedModule {
            identifier: self.identifier.clone(),
            module: Arc::clone(&self.module),
            service_registration: self.take_service_registration(),
            ordering_idx: self.ordering_idx,
        }
    }
}

/// Transaction-scoped record of a module: its proxied handle, the real module,
/// its factory and the predecessor it replaces, if any.
pub struct ModuleInternalTransactionalInfo {
    identifier: ModuleIdentifier,
    proxied: Arc<ProxiedModule>,
    factory: Arc<dyn ModuleFactory>,
    predecessor: Option<Arc<ModuleInternalInfo>>,
    is_default: bool,
    transaction_registration: Mutex<Option<Box<dyn Registration>>>,
}

impl std::fmt::Debug for ModuleInternalTransactionalInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInternalTransactionalInfo")
            .field("identifier", &self.identifier)
            .field("factory", &self.factory.implementation_name())
            .field("has_predecessor", &self.predecessor.is_some())
            .field("is_default", &self.is_default)
            .finish()
    }
}

impl ModuleInternalTransactionalInfo {
    pub(crate) fn new(
        identifier: ModuleIdentifier,
        proxied: Arc<ProxiedModule>,
        factory: Arc<dyn ModuleFactory>,
        predecessor: Option<Arc<ModuleInternalInfo>>,
        is_default: bool,
        transaction_registration: Option<Box<dyn Registration>>,
    ) -> Self {
        Self {
            identifier,
            proxied,
            factory,
            predecessor,
            is_default,
            transaction_registration: Mutex::new(transaction_registration),
        }
    }

    pub fn identifier(&self) -> &ModuleIdentifier {
        &self.identifier
    }

    pub fn proxied_module(&self) -> &Arc<ProxiedModule> {
        &self.proxied
    }

    pub fn real_module(&self) -> &Arc<dyn Module> {
        self.proxied.real()
    }

    pub fn factory(&self) -> &Arc<dyn ModuleFactory> {
        &self.factory
    }

    pub fn predecessor(&self) -> Option<&Arc<ModuleInternalInfo>> {
        self.predecessor.as_ref()
    }

    pub fn has_predecessor(&self) -> bool {
        self.predecessor.is_some()
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    pub(crate) fn close_transaction_registration(&self) {
        close_registration(&self.transaction_registration);
    }

    /// Teardown record for the predecessor this entry replaced.
    pub fn to_destroyed_module(&self) -> Result<DestroyedModule, ConfigError> {
        self.predecessor
            .as_ref()
            .map(|old| old.to_destroyed_module())
            .ok_or_else(|| {
                ConfigError::illegal_state(format!(
                    "module '{}' has no predecessor to destroy",
                    self.identifier
                ))
            })
    }
}

/// A committed module scheduled for teardown.
pub struct DestroyedModule {
    identifier: ModuleIdentifier,
    module: Arc<dyn Module>,
    service_registration: Option<Box<dyn Registration>>,
    ordering_idx: usize,
}

impl std::fmt::Debug for DestroyedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestroyedModule")
            .field("identifier", &self.identifier)
            .field("ordering_idx", &self.ordering_idx)
            .finish()
    }
}

impl DestroyedModule {
    pub fn identifier(&self) -> &ModuleIdentifier {
        &self.identifier
    }

    pub fn ordering_idx(&self) -> usize {
        self.ordering_idx
    }

    /// Closes the live instance, then the discovery registration.
    /// Failures are logged; teardown of the remaining modules continues.
    pub fn close(self) {
        tracing::debug!(module = %self.identifier, "Destroying module");
        if let Err(e) = self.module.close() {
            tracing::error!(module = %self.identifier, error = %e, "Error while closing instance");
        }
        if let Some(reg) = self.service_registration {
            reg.close();
        }
    }
}

impl PartialEq for DestroyedModule {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DestroyedModule {}

impl PartialOrd for DestroyedModule {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DestroyedModule {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordering_idx
            .cmp(&other.ordering_idx)
            .then_with(|| self.identifier.cmp(&other.identifier))
    }
}

/// Output of a transaction handed to the commit executor: predecessors to tear
/// down, in order, and the final working set.
#[derive(Debug)]
pub struct CommitInfo {
    destroyed_from_previous_transactions: Vec<DestroyedModule>,
    committed: BTreeMap<ModuleIdentifier, Arc<ModuleInternalTransactionalInfo>>,
}

impl CommitInfo {
    pub(crate) fn new(
        destroyed_from_previous_transactions: Vec<DestroyedModule>,
        committed: BTreeMap<ModuleIdentifier, Arc<ModuleInternalTransactionalInfo>>,
    ) -> Self {
        Self {
            destroyed_from_previous_transactions,
            committed,
        }
    }

    pub fn destroyed_from_previous_transactions(&self) -> &[DestroyedModule] {
        &self.destroyed_from_previous_transactions
    }

    pub fn committed(&self) -> &BTreeMap<ModuleIdentifier, Arc<ModuleInternalTransactionalInfo>> {
        &self.committed
    }

    pub fn into_parts(
        self,
    ) -> (
        Vec<DestroyedModule>,
        BTreeMap<ModuleIdentifier, Arc<ModuleInternalTransactionalInfo>>,
    ) {
        (self.destroyed_from_previous_transactions, self.committed)
    }
}
