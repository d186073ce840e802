use std::collections::BTreeMap;
use std::sync::Arc;

use crate::contracts::Module;
use crate::dependency_resolver::info::{CommitInfo, ModuleInternalTransactionalInfo};
use crate::errors::{ConfigError, ValidationError};
use crate::identifier::ModuleIdentifier;

/// Working set of one transaction plus the predecessors it has destroyed.
///
/// Pure bookkeeping; graph logic lives in the resolver manager.
#[derive(Debug, Default)]
pub struct ModulesHolder {
    commit_map: BTreeMap<ModuleIdentifier, Arc<ModuleInternalTransactionalInfo>>,
    destroyed_from_previous_transactions: Vec<Arc<ModuleInternalTransactionalInfo>>,
}

impl ModulesHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, id: &ModuleIdentifier) -> Result<&Arc<ModuleInternalTransactionalInfo>, ConfigError> {
        self.commit_map
            .get(id)
            .ok_or_else(|| ConfigError::NotFound(id.clone()))
    }

    /// Lookup on behalf of a declaring module; a miss is that module's validation failure.
    pub fn find_for_dependency(
        &self,
        target: &ModuleIdentifier,
        declaring: &ModuleIdentifier,
        attribute: &str,
    ) -> Result<&Arc<ModuleInternalTransactionalInfo>, ValidationError> {
        self.commit_map.get(target).ok_or_else(|| {
            ValidationError::for_attribute(
                declaring.clone(),
                attribute,
                format!("module '{target}' not found in transaction"),
            )
        })
    }

    pub fn contains(&self, id: &ModuleIdentifier) -> bool {
        self.commit_map.contains_key(id)
    }

    pub fn assert_not_exists(&self, id: &ModuleIdentifier) -> Result<(), ConfigError> {
        if self.contains(id) {
            return Err(ConfigError::AlreadyExists(id.clone()));
        }
        Ok(())
    }

    pub fn put(&mut self, info: Arc<ModuleInternalTransactionalInfo>) -> Result<(), ConfigError> {
        let id = info.identifier().clone();
        self.assert_not_exists(&id)?;
        self.commit_map.insert(id, info);
        Ok(())
    }

    /// Removes the entry; a module with a predecessor joins the carry-over destroy set.
    pub fn destroy(&mut self, id: &ModuleIdentifier) -> Result<Arc<ModuleInternalTransactionalInfo>, ConfigError> {
        let removed = self
            .commit_map
            .remove(id)
            .ok_or_else(|| ConfigError::NotFound(id.clone()))?;
        if removed.has_predecessor() {
            self.destroyed_from_previous_transactions
                .push(Arc::clone(&removed));
        }
        Ok(removed)
    }

    /// Proxied handles of the current working set.
    pub fn all_modules(&self) -> Vec<Arc<dyn Module>> {
        self.commit_map
            .values()
            .map(|info| Arc::clone(info.proxied_module()) as Arc<dyn Module>)
            .collect()
    }

    pub fn infos(&self) -> impl Iterator<Item = &Arc<ModuleInternalTransactionalInfo>> {
        self.commit_map.values()
    }

    pub fn identifiers(&self) -> Vec<ModuleIdentifier> {
        self.commit_map.keys().cloned().collect()
    }

    pub fn find_all_by_factory(&self, factory_name: &str) -> Vec<Arc<ModuleInternalTransactionalInfo>> {
        self.commit_map
            .values()
            .filter(|info| info.factory().implementation_name() == factory_name)
            .cloned()
            .collect()
    }

    pub fn destroyed_count(&self) -> usize {
        self.destroyed_from_previous_transactions.len()
    }

    pub fn len(&self) -> usize {
        self.commit_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commit_map.is_empty()
    }

    pub fn clear(&mut self) {
        self.commit_map.clear();
        self.destroyed_from_previous_transactions.clear();
    }

    /// Drains the carry-over set into teardown records ordered by their recorded
    /// ordering index, and snapshots the working set.
    pub fn to_commit_info(&mut self) -> Result<CommitInfo, ConfigError> {
        let mut destroyed = self
            .destroyed_from_previous_transactions
            .drain(..)
            .map(|info| info.to_destroyed_module())
            .collect::<Result<Vec<_>, _>>()?;
        destroyed.sort();
        Ok(CommitInfo::new(destroyed, self.commit_map.clone()))
    }
}
