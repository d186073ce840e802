use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::contracts::{ManagementRegistrar, Module, ModuleFactory};
use crate::deadlock::{InstantiationContext, InstantiationWatchdog};
use crate::dependency_resolver::{CommitInfo, DependencyResolverManager, ModuleInternalInfo};
use crate::errors::{ConfigError, ValidationError, ValidationReport};
use crate::factories::FactoriesHolder;
use crate::identifier::{ModuleIdentifier, TransactionIdentifier};
use crate::service_reference::{ServiceReferenceLookup, ServiceReferenceRegistry};
use crate::settings::RegistrySettings;
use crate::transaction::status::{TransactionState, TransactionStatus};

/// Everything a transaction is built from.
pub(crate) struct TransactionParts {
    pub identifier: TransactionIdentifier,
    pub parent_version: u64,
    pub current_version: u64,
    pub blank: bool,
    pub factories: FactoriesHolder,
    pub services: Arc<ServiceReferenceRegistry>,
    pub registrar: Arc<dyn ManagementRegistrar>,
}

/// Drives one configuration transaction: module creation, validation and the
/// two commit phases.
///
/// Mutating operations are serialized; `validate()` of the modules themselves
/// may still declare dependencies from other threads.
pub struct ConfigTransactionController {
    identifier: TransactionIdentifier,
    parent_version: u64,
    current_version: u64,
    blank: bool,
    factories: FactoriesHolder,
    status: Arc<TransactionStatus>,
    services: Arc<ServiceReferenceRegistry>,
    manager: DependencyResolverManager,
    watchdog: Arc<InstantiationWatchdog>,
    registrar: Arc<dyn ManagementRegistrar>,
    op_lock: Mutex<()>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ConfigTransactionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigTransactionController")
            .field("identifier", &self.identifier)
            .field("parent_version", &self.parent_version)
            .field("state", &self.status.state())
            .field("modules", &self.manager.len())
            .finish()
    }
}

fn into_validation_error(
    module: &ModuleIdentifier,
    error: anyhow::Error,
) -> Result<ValidationError, ConfigError> {
    let error = match error.downcast::<ConfigError>() {
        Ok(ConfigError::Validation(v)) => return Ok(v),
        Ok(ConfigError::ValidationFailed { report }) => {
            return Ok(ValidationError::new(module.clone(), report.to_string()))
        }
        Ok(other) => return Err(other),
        Err(e) => e,
    };
    match error.downcast::<ValidationError>() {
        Ok(v) => Ok(v),
        Err(e) => Ok(ValidationError::new(module.clone(), format!("{e:#}"))),
    }
}

impl ConfigTransactionController {
    pub(crate) fn new(parts: TransactionParts, settings: &RegistrySettings) -> Result<Self, ConfigError> {
        let watchdog = Arc::new(InstantiationWatchdog::start(
            parts.identifier.name(),
            settings.instantiation_warn_after,
            settings.watchdog_poll_interval,
        )?);
        let status = Arc::new(TransactionStatus::new());
        let manager = DependencyResolverManager::new(
            parts.identifier.clone(),
            Arc::clone(&status),
            parts.services.clone(),
            watchdog.clone(),
        );
        tracing::debug!(transaction = %parts.identifier, blank = parts.blank, "Transaction opened");
        Ok(Self {
            identifier: parts.identifier,
            parent_version: parts.parent_version,
            current_version: parts.current_version,
            blank: parts.blank,
            factories: parts.factories,
            status,
            services: parts.services,
            manager,
            watchdog,
            registrar: parts.registrar,
            op_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn identifier(&self) -> &TransactionIdentifier {
        &self.identifier
    }

    pub fn name(&self) -> &str {
        self.identifier.name()
    }

    /// Registry version this transaction was opened against.
    pub fn parent_version(&self) -> u64 {
        self.parent_version
    }

    /// Version the registry moves to when this transaction commits.
    pub fn version(&self) -> u64 {
        self.current_version
    }

    pub fn is_blank(&self) -> bool {
        self.blank
    }

    pub fn state(&self) -> TransactionState {
        self.status.state()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn factories(&self) -> &FactoriesHolder {
        &self.factories
    }

    pub fn manager(&self) -> &DependencyResolverManager {
        &self.manager
    }

    pub(crate) fn service_registry(&self) -> &Arc<ServiceReferenceRegistry> {
        &self.services
    }

    fn check_modifiable(&self) -> Result<(), ConfigError> {
        self.status.check_not_aborted()?;
        self.status.check_not_commit_started()?;
        if !self.status.is_modification_allowed() {
            return Err(ConfigError::illegal_state(format!(
                "transaction '{}' does not allow modification in state {:?}",
                self.identifier,
                self.status.state()
            )));
        }
        Ok(())
    }

    fn put_module(
        &self,
        id: ModuleIdentifier,
        module: Arc<dyn Module>,
        factory: Arc<dyn ModuleFactory>,
        predecessor: Option<Arc<ModuleInternalInfo>>,
        is_default: bool,
    ) -> Result<ModuleIdentifier, ConfigError> {
        if module.identifier() != &id {
            return Err(ConfigError::IdentifierMismatch {
                expected: id,
                actual: module.identifier().clone(),
            });
        }
        let registration = self
            .registrar
            .register_transaction_module(self.identifier.name(), &id)
            .map_err(|e| {
                ConfigError::illegal_state(format!("cannot register '{id}' with management: {e:#}"))
            })?;
        self.manager
            .wrap(id.clone(), module, factory, predecessor, Some(registration), is_default)?;
        Ok(id)
    }

    pub fn create_module(&self, factory_name: &str, instance_name: &str) -> Result<ModuleIdentifier, ConfigError> {
        let _guard = self.op_lock.lock();
        self.check_modifiable()?;
        let id = ModuleIdentifier::new(factory_name, instance_name);
        self.manager.assert_not_exists(&id)?;

        let factory = self.factories.find(factory_name)?;
        let resolver = self.manager.get_or_create(&id);
        let module = factory
            .create_module(instance_name, resolver)
            .map_err(|source| ConfigError::Factory {
                factory: factory_name.to_string(),
                source,
            })?;
        tracing::debug!(transaction = %self.identifier, module = %id, "Creating module");
        self.put_module(id, module, factory, None, false)
    }

    /// Forbids the module from reusing its predecessor's instance in this transaction.
    pub fn re_create_module(&self, id: &ModuleIdentifier) -> Result<(), ConfigError> {
        let _guard = self.op_lock.lock();
        self.check_modifiable()?;
        let info = self.manager.find_transactional_info(id)?;
        info.real_module().request_recreate();
        tracing::debug!(transaction = %self.identifier, module = %id, "Module will be recreated");
        Ok(())
    }

    pub fn destroy_module(&self, id: &ModuleIdentifier) -> Result<(), ConfigError> {
        let _guard = self.op_lock.lock();
        self.destroy_locked(id)
    }

    fn destroy_locked(&self, id: &ModuleIdentifier) -> Result<(), ConfigError> {
        self.check_modifiable()?;
        let found = self.manager.find_transactional_info(id)?;
        if !self.blank && found.is_default() {
            tracing::warn!(
                transaction = %self.identifier,
                module = %id,
                "Removing a default module"
            );
        }
        self.services.remove_for_module(id);
        let removed = self.manager.destroy(id)?;
        removed.close_transaction_registration();
        Ok(())
    }

    /// Runs `validate()` on every module and reports all failures at once.
    pub fn validate_config(&self) -> Result<(), ConfigError> {
        let _guard = self.op_lock.lock();
        self.status.check_not_aborted()?;
        self.status.begin_validation()?;
        let result = self.validate_no_locks();
        self.status.end_validation();
        result
    }

    fn validate_no_locks(&self) -> Result<(), ConfigError> {
        tracing::trace!(transaction = %self.identifier, "Validating transaction");
        let mut report = ValidationReport::new();
        for info in self.manager.all_infos() {
            let id = info.identifier();
            let resolver = self.manager.get_or_create(id);
            resolver.begin_validation();
            let result = info.proxied_module().validate();
            resolver.end_validation(result.is_ok());
            if let Err(e) = result {
                let failure = into_validation_error(id, e)?;
                tracing::warn!(transaction = %self.identifier, module = %id, error = %failure, "Validation failed");
                report.add(failure);
            }
        }
        if !report.is_empty() {
            return Err(ConfigError::ValidationFailed { report });
        }
        tracing::trace!(transaction = %self.identifier, "Validated transaction");
        Ok(())
    }

    /// Validates and, on success, locks the transaction for commit.
    ///
    /// A validation failure leaves the transaction open for another attempt.
    pub fn validate_before_commit_and_lock(&self) -> Result<CommitInfo, ConfigError> {
        let _guard = self.op_lock.lock();
        self.status.check_not_aborted()?;
        self.status.check_not_commit_started()?;
        self.status.begin_validation()?;
        if let Err(e) = self.validate_no_locks() {
            tracing::trace!(transaction = %self.identifier, "Commit failed on validation");
            self.status.end_validation();
            return Err(e);
        }
        self.status.set_commit_started()?;
        // Ordering must succeed before anything committed is torn down.
        if let Err(e) = self.manager.sorted_identifiers() {
            tracing::warn!(transaction = %self.identifier, error = %e, "Commit failed on ordering");
            self.internal_abort();
            return Err(e);
        }
        self.manager.commit_info()
    }

    /// Instantiates every module, dependents first, and marks the transaction committed.
    ///
    /// Returns the order used. Any failure aborts the transaction.
    pub fn second_phase_commit(&self) -> Result<Vec<ModuleIdentifier>, ConfigError> {
        let _guard = self.op_lock.lock();
        self.status.check_not_aborted()?;
        if self.status.state() != TransactionState::CommitStarted {
            return Err(ConfigError::illegal_state(
                "validate_before_commit_and_lock must succeed before second phase commit",
            ));
        }
        tracing::trace!(transaction = %self.identifier, "Committing transaction");

        let mut order = match self.manager.sorted_identifiers() {
            Ok(order) => order,
            Err(e) => {
                self.internal_abort();
                return Err(e);
            }
        };
        order.reverse();

        for id in &order {
            tracing::debug!(transaction = %self.identifier, module = %id, "About to commit module");
            let instantiated = self
                .manager
                .find_module(id)
                .map_err(anyhow::Error::from)
                .and_then(|module| module.get_instance(&InstantiationContext::root()));
            if let Err(source) = instantiated {
                tracing::error!(
                    transaction = %self.identifier,
                    module = %id,
                    error = %source,
                    "Commit failed"
                );
                self.internal_abort();
                return Err(ConfigError::Commit {
                    module: id.clone(),
                    transaction: self.identifier.name().to_string(),
                    source,
                });
            }
        }

        self.status.set_committed()?;
        tracing::trace!(transaction = %self.identifier, "Committed transaction");
        Ok(order)
    }

    pub fn abort_config(&self) -> Result<(), ConfigError> {
        self.status.check_not_commit_started()?;
        self.status.check_not_aborted()?;
        self.internal_abort();
        Ok(())
    }

    fn internal_abort(&self) {
        tracing::trace!(transaction = %self.identifier, "Aborting transaction");
        if let Err(e) = self.status.set_aborted() {
            tracing::warn!(transaction = %self.identifier, error = %e, "Abort ignored");
        }
        self.close();
    }

    /// Releases the working set, management registrations and the watchdog. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for info in self.manager.all_infos() {
            info.close_transaction_registration();
        }
        self.manager.close();
        self.watchdog.close();
        tracing::debug!(transaction = %self.identifier, "Transaction closed");
    }

    // Lookups

    /// Modules matching the optional factory and instance filters.
    pub fn lookup_config_beans(&self, factory_name: Option<&str>, instance_name: Option<&str>) -> Vec<ModuleIdentifier> {
        self.manager
            .identifiers()
            .into_iter()
            .filter(|id| factory_name.map_or(true, |f| id.factory_name() == f))
            .filter(|id| instance_name.map_or(true, |i| id.instance_name() == i))
            .collect()
    }

    pub fn lookup_config_bean(&self, factory_name: &str, instance_name: &str) -> Result<ModuleIdentifier, ConfigError> {
        let id = ModuleIdentifier::new(factory_name, instance_name);
        if !self.manager.contains(&id) {
            return Err(ConfigError::NotFound(id));
        }
        Ok(id)
    }

    /// Proxied handle of a module; `as_any` reaches the concrete module.
    pub fn find_module(&self, id: &ModuleIdentifier) -> Result<Arc<dyn Module>, ConfigError> {
        self.manager.find_module(id)
    }

    pub fn available_module_names(&self) -> Vec<String> {
        self.factories.module_names()
    }

    // Service references

    pub fn save_service_reference(
        &self,
        service_interface: &str,
        ref_name: &str,
        module: &ModuleIdentifier,
    ) -> Result<Option<ModuleIdentifier>, ConfigError> {
        let _guard = self.op_lock.lock();
        self.check_modifiable()?;
        self.save_service_reference_locked(service_interface, ref_name, module)
    }

    fn save_service_reference_locked(
        &self,
        service_interface: &str,
        ref_name: &str,
        module: &ModuleIdentifier,
    ) -> Result<Option<ModuleIdentifier>, ConfigError> {
        let info = self.manager.find_transactional_info(module)?;
        if !info.factory().implements_service_interface(service_interface) {
            return Err(ConfigError::ServiceInterfaceNotImplemented {
                module: module.clone(),
                service_interface: service_interface.to_string(),
            });
        }
        Ok(self.services.save(service_interface, ref_name, module.clone()))
    }

    pub fn remove_service_reference(&self, service_interface: &str, ref_name: &str) -> Result<ModuleIdentifier, ConfigError> {
        let _guard = self.op_lock.lock();
        self.check_modifiable()?;
        self.services.remove(service_interface, ref_name)
    }

    pub fn remove_all_service_references(&self) -> Result<(), ConfigError> {
        let _guard = self.op_lock.lock();
        self.check_modifiable()?;
        self.services.remove_all();
        Ok(())
    }

    /// Removes every reference to `module`; true if any existed.
    pub fn remove_service_references(&self, module: &ModuleIdentifier) -> Result<bool, ConfigError> {
        let _guard = self.op_lock.lock();
        self.check_modifiable()?;
        self.manager.find_transactional_info(module)?;
        Ok(self.services.remove_for_module(module))
    }

    pub fn lookup_config_bean_by_service_interface_name(
        &self,
        service_interface: &str,
        ref_name: &str,
    ) -> Result<ModuleIdentifier, ConfigError> {
        self.services
            .lookup_module(service_interface, ref_name)
            .ok_or_else(|| ConfigError::ServiceReferenceNotFound {
                service_interface: service_interface.to_string(),
                ref_name: ref_name.to_string(),
            })
    }

    pub fn service_mapping(&self) -> BTreeMap<String, BTreeMap<String, ModuleIdentifier>> {
        self.services.service_mapping()
    }

    pub fn lookup_service_references_by_interface(&self, service_interface: &str) -> BTreeMap<String, ModuleIdentifier> {
        self.services.lookup_by_interface(service_interface)
    }

    pub fn lookup_service_interface_names(&self, module: &ModuleIdentifier) -> Result<BTreeSet<String>, ConfigError> {
        self.manager.find_transactional_info(module)?;
        Ok(self
            .services
            .find_service_interfaces(module)
            .into_keys()
            .collect())
    }

    // Seeding

    /// Copies the committed configuration into this transaction, then adds the
    /// default modules of new factories and destroys the modules of factories
    /// missing from this transaction.
    pub fn copy_existing_modules_and_process_factory_diff(
        &self,
        existing: &[Arc<ModuleInternalInfo>],
        last_factories: &[Arc<dyn ModuleFactory>],
    ) -> Result<(), ConfigError> {
        let _guard = self.op_lock.lock();
        for old in existing {
            self.copy_existing_module(old)?;
        }
        self.process_default_modules(last_factories)
    }

    fn copy_existing_module(&self, old: &Arc<ModuleInternalInfo>) -> Result<(), ConfigError> {
        self.check_modifiable()?;
        let id = old.identifier().clone();
        self.manager.assert_not_exists(&id)?;

        // A factory that disappeared still copies its modules; the diff destroys them.
        let factory = self
            .factories
            .find(id.factory_name())
            .unwrap_or_else(|_| Arc::clone(old.factory()));
        let resolver = self.manager.get_or_create(&id);
        let module = factory
            .create_module_from_old(id.instance_name(), resolver, old)
            .map_err(|source| ConfigError::Factory {
                factory: factory.implementation_name().to_string(),
                source,
            })?;
        self.put_module(id, module, factory, Some(Arc::clone(old)), old.is_default())?;
        Ok(())
    }

    fn process_default_modules(&self, last_factories: &[Arc<dyn ModuleFactory>]) -> Result<(), ConfigError> {
        self.check_modifiable()?;
        let previous: BTreeSet<&str> = last_factories.iter().map(|f| f.implementation_name()).collect();

        let added: Vec<_> = self
            .factories
            .factories()
            .filter(|f| !previous.contains(f.implementation_name()))
            .cloned()
            .collect();
        for factory in added {
            let defaults = factory
                .default_modules(&self.manager)
                .map_err(|source| ConfigError::Factory {
                    factory: factory.implementation_name().to_string(),
                    source,
                })?;
            for module in defaults {
                let id = module.identifier().clone();
                self.manager.get_or_create(&id);
                self.put_module(id.clone(), module, Arc::clone(&factory), None, true)?;
                for service_interface in factory.service_interfaces() {
                    self.save_service_reference_locked(&service_interface, id.instance_name(), &id)?;
                }
                tracing::debug!(transaction = %self.identifier, module = %id, "Default module added");
            }
        }

        let removed: Vec<_> = last_factories
            .iter()
            .filter(|f| !self.factories.contains(f.implementation_name()))
            .collect();
        for factory in removed {
            for info in self.manager.find_all_by_factory(factory.implementation_name()) {
                tracing::info!(
                    transaction = %self.identifier,
                    module = %info.identifier(),
                    "Factory disappeared, destroying its module"
                );
                self.destroy_locked(info.identifier())?;
            }
        }
        Ok(())
    }
}

impl Drop for ConfigTransactionController {
    fn drop(&mut self) {
        self.close();
    }
}
