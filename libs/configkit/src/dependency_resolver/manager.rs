use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::contracts::{Module, ModuleFactory, Registration};
use crate::deadlock::DeadlockMonitor;
use crate::dependency_resolver::info::{CommitInfo, ModuleInternalInfo, ModuleInternalTransactionalInfo};
use crate::dependency_resolver::modules_holder::ModulesHolder;
use crate::dependency_resolver::proxy::ProxiedModule;
use crate::dependency_resolver::resolver::{DependencyResolver, DepthWalk};
use crate::errors::ConfigError;
use crate::identifier::{ModuleIdentifier, TransactionIdentifier};
use crate::service_reference::ServiceReferenceLookup;
use crate::transaction::TransactionStatus;

/// State shared by the manager and every resolver of one transaction.
/// Resolvers hold it weakly; it lives as long as the manager.
pub(crate) struct TransactionScope {
    pub(crate) transaction: TransactionIdentifier,
    pub(crate) status: Arc<TransactionStatus>,
    pub(crate) modules: RwLock<ModulesHolder>,
    pub(crate) services: Arc<dyn ServiceReferenceLookup>,
}

/// Per-transaction registry of dependency resolvers and owner of the working set.
pub struct DependencyResolverManager {
    scope: Arc<TransactionScope>,
    resolvers: DashMap<ModuleIdentifier, Arc<DependencyResolver>>,
    monitor: Arc<dyn DeadlockMonitor>,
}

impl std::fmt::Debug for DependencyResolverManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyResolverManager")
            .field("transaction", &self.scope.transaction)
            .field("modules", &self.scope.modules.read().len())
            .field("resolvers", &self.resolvers.len())
            .finish()
    }
}

impl DependencyResolverManager {
    pub fn new(
        transaction: TransactionIdentifier,
        status: Arc<TransactionStatus>,
        services: Arc<dyn ServiceReferenceLookup>,
        monitor: Arc<dyn DeadlockMonitor>,
    ) -> Self {
        Self {
            scope: Arc::new(TransactionScope {
                transaction,
                status,
                modules: RwLock::new(ModulesHolder::new()),
                services,
            }),
            resolvers: DashMap::new(),
            monitor,
        }
    }

    pub fn transaction(&self) -> &TransactionIdentifier {
        &self.scope.transaction
    }

    pub fn status(&self) -> &Arc<TransactionStatus> {
        &self.scope.status
    }

    /// Returns the resolver of `id`, creating it on first use.
    pub fn get_or_create(&self, id: &ModuleIdentifier) -> Arc<DependencyResolver> {
        self.resolvers
            .entry(id.clone())
            .or_insert_with(|| {
                Arc::new(DependencyResolver::new(
                    id.clone(),
                    Arc::downgrade(&self.scope),
                ))
            })
            .value()
            .clone()
    }

    pub fn resolver(&self, id: &ModuleIdentifier) -> Option<Arc<DependencyResolver>> {
        self.resolvers.get(id).map(|r| r.value().clone())
    }

    /// Proxies `module` and adds it to the working set.
    pub fn wrap(
        &self,
        identifier: ModuleIdentifier,
        module: Arc<dyn Module>,
        factory: Arc<dyn ModuleFactory>,
        predecessor: Option<Arc<ModuleInternalInfo>>,
        transaction_registration: Option<Box<dyn Registration>>,
        is_default: bool,
    ) -> Result<Arc<ModuleInternalTransactionalInfo>, ConfigError> {
        if module.identifier() != &identifier {
            return Err(ConfigError::IdentifierMismatch {
                expected: identifier,
                actual: module.identifier().clone(),
            });
        }
        let proxied = Arc::new(ProxiedModule::new(module, Arc::clone(&self.monitor)));
        let info = Arc::new(ModuleInternalTransactionalInfo::new(
            identifier,
            proxied,
            factory,
            predecessor,
            is_default,
            transaction_registration,
        ));
        self.scope.modules.write().put(Arc::clone(&info))?;
        tracing::debug!(
            transaction = %self.scope.transaction,
            module = %info.identifier(),
            has_predecessor = info.has_predecessor(),
            "Module added to transaction"
        );
        Ok(info)
    }

    /// Removes `id` from the working set; its predecessor, if any, is scheduled for teardown.
    pub fn destroy(&self, id: &ModuleIdentifier) -> Result<Arc<ModuleInternalTransactionalInfo>, ConfigError> {
        let removed = self.scope.modules.write().destroy(id)?;
        if let Some((_, resolver)) = self.resolvers.remove(id) {
            resolver.mark_destroyed();
        }
        tracing::debug!(transaction = %self.scope.transaction, module = %id, "Module destroyed");
        Ok(removed)
    }

    pub fn find_transactional_info(
        &self,
        id: &ModuleIdentifier,
    ) -> Result<Arc<ModuleInternalTransactionalInfo>, ConfigError> {
        self.scope.modules.read().find(id).cloned()
    }

    /// Proxied handle of `id`.
    pub fn find_module(&self, id: &ModuleIdentifier) -> Result<Arc<dyn Module>, ConfigError> {
        let info = self.find_transactional_info(id)?;
        Ok(Arc::clone(info.proxied_module()) as Arc<dyn Module>)
    }

    pub fn assert_not_exists(&self, id: &ModuleIdentifier) -> Result<(), ConfigError> {
        self.scope.modules.read().assert_not_exists(id)
    }

    pub fn contains(&self, id: &ModuleIdentifier) -> bool {
        self.scope.modules.read().contains(id)
    }

    pub fn all_modules(&self) -> Vec<Arc<dyn Module>> {
        self.scope.modules.read().all_modules()
    }

    pub fn all_infos(&self) -> Vec<Arc<ModuleInternalTransactionalInfo>> {
        self.scope.modules.read().infos().cloned().collect()
    }

    pub fn identifiers(&self) -> Vec<ModuleIdentifier> {
        self.scope.modules.read().identifiers()
    }

    pub fn find_all_by_factory(&self, factory_name: &str) -> Vec<Arc<ModuleInternalTransactionalInfo>> {
        self.scope.modules.read().find_all_by_factory(factory_name)
    }

    pub fn len(&self) -> usize {
        self.scope.modules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.scope.modules.read().is_empty()
    }

    pub(crate) fn check_commit_started(&self) -> Result<(), ConfigError> {
        self.scope.status.check_commit_started()
    }

    /// Working set ordered by ascending dependency depth, ties by identifier.
    ///
    /// Computes every depth in one pass; a cycle fails the whole pass and no
    /// depth is published.
    pub fn sorted_identifiers(&self) -> Result<Vec<ModuleIdentifier>, ConfigError> {
        self.check_commit_started()?;
        let ids = self.identifiers();

        let mut walk = DepthWalk::new(self);
        let result = ids
            .iter()
            .map(|id| walk.visit(id).map(|depth| (depth, id.clone())))
            .collect::<Result<Vec<_>, _>>();
        let mut ordered = walk.finish(result)?;
        ordered.sort();

        tracing::info!(
            transaction = %self.scope.transaction,
            modules = ?ordered.iter().map(|(d, id)| format!("{id}@{d}")).collect::<Vec<_>>(),
            "Modules ordered by dependency depth"
        );
        Ok(ordered.into_iter().map(|(_, id)| id).collect())
    }

    pub fn commit_info(&self) -> Result<CommitInfo, ConfigError> {
        self.scope.modules.write().to_commit_info()
    }

    /// Drops the working set and every resolver.
    pub fn close(&self) {
        self.scope.modules.write().clear();
        for entry in self.resolvers.iter() {
            entry.value().mark_destroyed();
        }
        self.resolvers.clear();
    }
}
