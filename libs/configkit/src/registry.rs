use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::contracts::{Instance, ManagementRegistrar, ModuleFactory, NoopRegistrar, Registration, ServicePublisher};
use crate::dependency_resolver::{CommitInfo, ModuleInternalInfo};
use crate::errors::ConfigError;
use crate::factories::FactoriesHolder;
use crate::identifier::{ModuleIdentifier, TransactionIdentifier};
use crate::service_reference::{ServiceReferenceLookup, ServiceReferenceRegistry, ServiceReferenceSnapshot};
use crate::settings::RegistrySettings;
use crate::transaction::{ConfigTransactionController, TransactionParts, TransactionState};

/// Outcome of a commit, per module.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitStatus {
    /// Modules that did not exist before.
    pub new_instances: Vec<ModuleIdentifier>,
    /// Modules whose new configuration kept the previous live instance.
    pub reused_instances: Vec<ModuleIdentifier>,
    /// Modules that replaced their previous instance.
    pub recreated_instances: Vec<ModuleIdentifier>,
}

struct RegistryState {
    current: BTreeMap<ModuleIdentifier, Arc<ModuleInternalInfo>>,
    version: u64,
    version_counter: u64,
    factories: Vec<Arc<dyn ModuleFactory>>,
    /// Factories of the last committed transaction.
    last_list_of_factories: Vec<Arc<dyn ModuleFactory>>,
}

/// Owner of the committed configuration; opens and commits transactions.
///
/// Opening and committing are serialized. Committed service references are
/// published as an immutable snapshot readable without locking.
pub struct ConfigRegistry {
    settings: RegistrySettings,
    state: Mutex<RegistryState>,
    transactions: DashMap<String, Arc<ConfigTransactionController>>,
    services: ArcSwap<ServiceReferenceSnapshot>,
    publisher: Arc<dyn ServicePublisher>,
    registrar: Arc<dyn ManagementRegistrar>,
    healthy: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for ConfigRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConfigRegistry")
            .field("version", &state.version)
            .field("modules", &state.current.keys().collect::<Vec<_>>())
            .field("open_transactions", &self.transactions.len())
            .field("healthy", &self.healthy.load(Ordering::Acquire))
            .finish()
    }
}

/// Builder for [`ConfigRegistry`]; collaborators default to no-ops.
#[derive(Default)]
pub struct ConfigRegistryBuilder {
    settings: RegistrySettings,
    factories: Vec<Arc<dyn ModuleFactory>>,
    publisher: Option<Arc<dyn ServicePublisher>>,
    registrar: Option<Arc<dyn ManagementRegistrar>>,
}

impl ConfigRegistryBuilder {
    pub fn settings(mut self, settings: RegistrySettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn factory(mut self, factory: Arc<dyn ModuleFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    pub fn factories(mut self, factories: impl IntoIterator<Item = Arc<dyn ModuleFactory>>) -> Self {
        self.factories.extend(factories);
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn ServicePublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn registrar(mut self, registrar: Arc<dyn ManagementRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn build(self) -> ConfigRegistry {
        ConfigRegistry {
            settings: self.settings,
            state: Mutex::new(RegistryState {
                current: BTreeMap::new(),
                version: 0,
                version_counter: 0,
                factories: self.factories,
                last_list_of_factories: Vec::new(),
            }),
            transactions: DashMap::new(),
            services: ArcSwap::from_pointee(ServiceReferenceSnapshot::default()),
            publisher: self.publisher.unwrap_or_else(|| Arc::new(NoopRegistrar)),
            registrar: self.registrar.unwrap_or_else(|| Arc::new(NoopRegistrar)),
            healthy: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }
}

impl ConfigRegistry {
    pub fn builder() -> ConfigRegistryBuilder {
        ConfigRegistryBuilder::default()
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    fn check_open(&self) -> Result<(), ConfigError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConfigError::illegal_state("config registry is closed"));
        }
        Ok(())
    }

    /// Opens a transaction seeded with the committed configuration.
    ///
    /// A blank transaction is used for housekeeping commits; removing default
    /// modules in it is not reported.
    pub fn begin_config(&self, blank: bool) -> Result<Arc<ConfigTransactionController>, ConfigError> {
        self.check_open()?;
        let mut state = self.state.lock();
        state.version_counter += 1;
        let identifier = TransactionIdentifier::for_version(
            &self.settings.transaction_prefix,
            state.version,
            state.version_counter,
        );

        let snapshot = self.services.load_full();
        let controller = Arc::new(ConfigTransactionController::new(
            TransactionParts {
                identifier: identifier.clone(),
                parent_version: state.version,
                current_version: state.version_counter,
                blank,
                factories: FactoriesHolder::new(state.factories.iter().cloned()),
                services: Arc::new(ServiceReferenceRegistry::from_snapshot(identifier.name(), &snapshot)),
                registrar: Arc::clone(&self.registrar),
            },
            &self.settings,
        )?);

        let existing: Vec<_> = state.current.values().cloned().collect();
        controller.copy_existing_modules_and_process_factory_diff(&existing, &state.last_list_of_factories)?;

        self.transactions
            .insert(identifier.name().to_string(), Arc::clone(&controller));
        tracing::info!(
            transaction = %identifier,
            parent_version = state.version,
            modules = existing.len(),
            "Configuration transaction started"
        );
        Ok(controller)
    }

    /// Commits an open transaction.
    ///
    /// Fails with a conflicting version when another transaction committed
    /// since this one was opened; validation failures leave the transaction
    /// open. A dependency cycle aborts the transaction before any committed
    /// module is touched. Any later failure marks the registry unhealthy.
    pub fn commit_config(&self, transaction: &str) -> Result<CommitStatus, ConfigError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(CommitStatus::default());
        }
        let mut state = self.state.lock();
        tracing::trace!(
            transaction,
            version = state.version,
            version_counter = state.version_counter,
            "About to commit"
        );

        let controller = self
            .transactions
            .get(transaction)
            .map(|tx| Arc::clone(tx.value()))
            .ok_or_else(|| ConfigError::TransactionNotFound(transaction.to_string()))?;
        if state.version != controller.parent_version() {
            return Err(ConfigError::ConflictingVersion {
                expected: state.version,
                actual: controller.parent_version(),
            });
        }

        let commit_info = match controller.validate_before_commit_and_lock() {
            Ok(info) => info,
            Err(e) => {
                if controller.state() == TransactionState::Aborted {
                    self.transactions.remove(transaction);
                }
                return Err(e);
            }
        };
        state.last_list_of_factories = controller.factories().factories().cloned().collect();

        let result = self.second_phase_commit(&mut state, &controller, commit_info);
        self.transactions.remove(transaction);
        match &result {
            Ok(status) => tracing::info!(
                transaction,
                version = state.version,
                new = status.new_instances.len(),
                reused = status.reused_instances.len(),
                recreated = status.recreated_instances.len(),
                "Configuration committed"
            ),
            Err(e) => {
                self.healthy.store(false, Ordering::Release);
                tracing::error!(transaction, error = %e, "Second phase commit failed, registry is unhealthy");
            }
        }
        result
    }

    fn publish(
        &self,
        controller: &ConfigTransactionController,
        id: &ModuleIdentifier,
        instance: &Instance,
        services: &BTreeMap<String, String>,
    ) -> Result<Box<dyn Registration>, ConfigError> {
        self.publisher
            .publish(id, instance, services)
            .map_err(|source| ConfigError::Commit {
                module: id.clone(),
                transaction: controller.name().to_string(),
                source,
            })
    }

    /// Classifies a committed module against its predecessor and publishes it when needed.
    fn register(
        &self,
        controller: &ConfigTransactionController,
        id: &ModuleIdentifier,
        instance: &Instance,
        predecessor: Option<&Arc<ModuleInternalInfo>>,
        previous_services: &ServiceReferenceSnapshot,
        status: &mut CommitStatus,
    ) -> Result<Option<Box<dyn Registration>>, ConfigError> {
        let services = controller.service_registry().find_service_interfaces(id);
        match predecessor {
            Some(old) if Arc::ptr_eq(old.instance(), instance) => {
                status.reused_instances.push(id.clone());
                if previous_services.find_service_interfaces(id) == services {
                    return Ok(old.take_service_registration());
                }
                old.close_service_registration();
            }
            Some(old) => {
                // Closing the old instance is up to the new module.
                status.recreated_instances.push(id.clone());
                old.close_service_registration();
            }
            None => status.new_instances.push(id.clone()),
        }
        self.publish(controller, id, instance, &services).map(Some)
    }

    fn second_phase_commit(
        &self,
        state: &mut RegistryState,
        controller: &ConfigTransactionController,
        commit_info: CommitInfo,
    ) -> Result<CommitStatus, ConfigError> {
        let (destroyed, committed) = commit_info.into_parts();
        for module in destroyed {
            state.current.remove(module.identifier());
            module.close();
        }

        let order = controller.second_phase_commit()?;
        controller.close();

        let previous_services = self.services.load_full();
        let mut status = CommitStatus::default();
        let mut next = Vec::with_capacity(order.len());
        let mut failure = None;

        // Ordering indices follow the commit order, dependents first.
        for (ordering_idx, id) in order.iter().enumerate() {
            tracing::trace!(module = %id, ordering_idx, "Registering committed module");
            let entry = committed
                .get(id)
                .ok_or_else(|| ConfigError::illegal_state(format!("module '{id}' missing from commit")))?;
            let instance = entry
                .proxied_module()
                .cached_instance()
                .ok_or_else(|| ConfigError::illegal_state(format!("module '{id}' was not instantiated")))?;
            if entry.predecessor().is_some() {
                state.current.remove(id);
            }

            // After a failed publication the remaining instances are recorded unpublished.
            let registration = if failure.is_some() {
                if let Some(old) = entry.predecessor() {
                    old.close_service_registration();
                }
                None
            } else {
                match self.register(controller, id, &instance, entry.predecessor(), &previous_services, &mut status) {
                    Ok(registration) => registration,
                    Err(e) => {
                        failure = Some(e);
                        None
                    }
                }
            };

            next.push(ModuleInternalInfo::new(
                id.clone(),
                Arc::clone(entry.real_module()),
                instance,
                Arc::clone(entry.factory()),
                ordering_idx,
                entry.is_default(),
                registration,
            ));
        }

        if let Some(e) = failure {
            // Keep every live instance reachable so close() can still tear it down.
            for info in next {
                info.close_service_registration();
                state.current.insert(info.identifier().clone(), Arc::new(info));
            }
            return Err(e);
        }

        for info in next {
            state.current.insert(info.identifier().clone(), Arc::new(info));
        }
        state.version = controller.version();
        self.services
            .store(Arc::new(controller.service_registry().snapshot()));
        Ok(status)
    }

    /// Installs a new factory list and commits a blank transaction, so default
    /// modules of new factories appear and modules of vanished factories go away.
    pub fn update_factories(
        &self,
        factories: impl IntoIterator<Item = Arc<dyn ModuleFactory>>,
    ) -> Result<CommitStatus, ConfigError> {
        self.check_open()?;
        {
            let mut state = self.state.lock();
            state.factories = factories.into_iter().collect();
            tracing::info!(
                factories = ?state.factories.iter().map(|f| f.implementation_name()).collect::<Vec<_>>(),
                "Module factories updated"
            );
        }
        let tx = self.begin_config(true)?;
        self.commit_config(tx.name())
    }

    /// Names of the transactions still open.
    pub fn open_configs(&self) -> Vec<TransactionIdentifier> {
        self.transactions.retain(|_, tx| !tx.is_closed());
        let mut out: Vec<_> = self
            .transactions
            .iter()
            .map(|tx| tx.value().identifier().clone())
            .collect();
        out.sort();
        out
    }

    pub fn transaction(&self, name: &str) -> Option<Arc<ConfigTransactionController>> {
        self.transactions.get(name).map(|tx| Arc::clone(tx.value()))
    }

    pub fn lookup_config_beans(&self, factory_name: Option<&str>, instance_name: Option<&str>) -> Vec<ModuleIdentifier> {
        self.state
            .lock()
            .current
            .keys()
            .filter(|id| factory_name.map_or(true, |f| id.factory_name() == f))
            .filter(|id| instance_name.map_or(true, |i| id.instance_name() == i))
            .cloned()
            .collect()
    }

    pub fn lookup_config_bean(&self, factory_name: &str, instance_name: &str) -> Result<ModuleIdentifier, ConfigError> {
        let id = ModuleIdentifier::new(factory_name, instance_name);
        if !self.state.lock().current.contains_key(&id) {
            return Err(ConfigError::NotFound(id));
        }
        Ok(id)
    }

    /// Committed record of `id`, including its live instance.
    pub fn committed_module(&self, id: &ModuleIdentifier) -> Result<Arc<ModuleInternalInfo>, ConfigError> {
        self.state
            .lock()
            .current
            .get(id)
            .cloned()
            .ok_or_else(|| ConfigError::NotFound(id.clone()))
    }

    pub fn lookup_config_bean_by_service_interface_name(
        &self,
        service_interface: &str,
        ref_name: &str,
    ) -> Result<ModuleIdentifier, ConfigError> {
        self.services
            .load()
            .lookup_module(service_interface, ref_name)
            .ok_or_else(|| ConfigError::ServiceReferenceNotFound {
                service_interface: service_interface.to_string(),
                ref_name: ref_name.to_string(),
            })
    }

    /// Service references of the last committed configuration.
    pub fn service_references(&self) -> Arc<ServiceReferenceSnapshot> {
        self.services.load_full()
    }

    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn available_module_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .state
            .lock()
            .factories
            .iter()
            .map(|f| f.implementation_name().to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Aborts open transactions and tears down every live module, dependents
    /// before their dependencies. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        for entry in self.transactions.iter() {
            let tx = entry.value();
            if let Err(e) = tx.abort_config() {
                tracing::debug!(transaction = %tx.identifier(), error = %e, "Ignoring error while aborting");
            }
            tx.close();
        }
        self.transactions.clear();

        let mut state = self.state.lock();
        let mut destroyed: Vec<_> = state
            .current
            .values()
            .map(|info| info.to_destroyed_module())
            .collect();
        destroyed.sort();
        tracing::info!(modules = destroyed.len(), "Config registry closing, destroying modules");
        for module in destroyed {
            module.close();
        }
        state.current.clear();
    }
}
