use std::collections::BTreeMap;
use std::sync::Arc;

use crate::contracts::ModuleFactory;
use crate::errors::ConfigError;

/// Factories available to one transaction, keyed by implementation name.
#[derive(Clone, Default)]
pub struct FactoriesHolder {
    by_name: BTreeMap<String, Arc<dyn ModuleFactory>>,
}

impl std::fmt::Debug for FactoriesHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoriesHolder")
            .field("factories", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FactoriesHolder {
    /// Later factories with the same implementation name replace earlier ones.
    pub fn new(factories: impl IntoIterator<Item = Arc<dyn ModuleFactory>>) -> Self {
        let mut by_name = BTreeMap::new();
        for factory in factories {
            let name = factory.implementation_name().to_string();
            if by_name.insert(name.clone(), factory).is_some() {
                tracing::warn!(factory = %name, "Duplicate module factory, keeping the last one");
            }
        }
        Self { by_name }
    }

    pub fn find(&self, name: &str) -> Result<Arc<dyn ModuleFactory>, ConfigError> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::FactoryNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn module_names(&self) -> Vec<String> {
        self.by_name.keys().cloned().collect()
    }

    pub fn factories(&self) -> impl Iterator<Item = &Arc<dyn ModuleFactory>> {
        self.by_name.values()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
