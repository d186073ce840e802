//! Service references: named bindings `(service interface, ref name) -> module`.
//!
//! Modules may refer to a dependency by a published service name instead of its
//! identifier; the resolver translates such references through
//! [`ServiceReferenceLookup`].

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::errors::ConfigError;
use crate::identifier::ModuleIdentifier;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceReference {
    pub service_interface: String,
    pub ref_name: String,
}

impl ServiceReference {
    pub fn new(service_interface: impl Into<String>, ref_name: impl Into<String>) -> Self {
        Self {
            service_interface: service_interface.into(),
            ref_name: ref_name.into(),
        }
    }
}

/// Read access to service references, as seen by dependency resolvers.
pub trait ServiceReferenceLookup: Send + Sync {
    fn lookup_module(&self, service_interface: &str, ref_name: &str) -> Option<ModuleIdentifier>;
}

type RefMap = BTreeMap<ServiceReference, ModuleIdentifier>;

fn mapping_of(refs: &RefMap) -> BTreeMap<String, BTreeMap<String, ModuleIdentifier>> {
    let mut out: BTreeMap<String, BTreeMap<String, ModuleIdentifier>> = BTreeMap::new();
    for (sr, module) in refs {
        out.entry(sr.service_interface.clone())
            .or_default()
            .insert(sr.ref_name.clone(), module.clone());
    }
    out
}

fn interfaces_of(refs: &RefMap, module: &ModuleIdentifier) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (sr, target) in refs {
        if target == module {
            out.entry(sr.service_interface.clone())
                .or_insert_with(|| sr.ref_name.clone());
        }
    }
    out
}

/// Immutable view of the references of the last committed configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceReferenceSnapshot {
    refs: RefMap,
}

impl ServiceReferenceSnapshot {
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    /// service interface -> ref name -> module
    pub fn service_mapping(&self) -> BTreeMap<String, BTreeMap<String, ModuleIdentifier>> {
        mapping_of(&self.refs)
    }

    pub fn find_service_interfaces(&self, module: &ModuleIdentifier) -> BTreeMap<String, String> {
        interfaces_of(&self.refs, module)
    }
}

impl ServiceReferenceLookup for ServiceReferenceSnapshot {
    fn lookup_module(&self, service_interface: &str, ref_name: &str) -> Option<ModuleIdentifier> {
        self.refs
            .get(&ServiceReference::new(service_interface, ref_name))
            .cloned()
    }
}

/// Writable references of one transaction, seeded from the committed snapshot.
#[derive(Debug)]
pub struct ServiceReferenceRegistry {
    transaction: String,
    refs: RwLock<RefMap>,
}

impl ServiceReferenceRegistry {
    pub fn new(transaction: impl Into<String>) -> Self {
        Self::from_snapshot(transaction, &ServiceReferenceSnapshot::default())
    }

    pub fn from_snapshot(transaction: impl Into<String>, snapshot: &ServiceReferenceSnapshot) -> Self {
        Self {
            transaction: transaction.into(),
            refs: RwLock::new(snapshot.refs.clone()),
        }
    }

    /// Binds the reference to `module`, returning the previous binding if any.
    pub fn save(
        &self,
        service_interface: &str,
        ref_name: &str,
        module: ModuleIdentifier,
    ) -> Option<ModuleIdentifier> {
        tracing::debug!(
            transaction = %self.transaction,
            service_interface,
            ref_name,
            module = %module,
            "Saving service reference"
        );
        self.refs
            .write()
            .insert(ServiceReference::new(service_interface, ref_name), module)
    }

    pub fn remove(&self, service_interface: &str, ref_name: &str) -> Result<ModuleIdentifier, ConfigError> {
        self.refs
            .write()
            .remove(&ServiceReference::new(service_interface, ref_name))
            .ok_or_else(|| ConfigError::ServiceReferenceNotFound {
                service_interface: service_interface.to_string(),
                ref_name: ref_name.to_string(),
            })
    }

    pub fn remove_all(&self) {
        self.refs.write().clear();
    }

    /// Drops every reference pointing at `module`; true if any was removed.
    pub fn remove_for_module(&self, module: &ModuleIdentifier) -> bool {
        let mut refs = self.refs.write();
        let before = refs.len();
        refs.retain(|_, target| target != module);
        before != refs.len()
    }

    /// ref name -> module, for one service interface.
    pub fn lookup_by_interface(&self, service_interface: &str) -> BTreeMap<String, ModuleIdentifier> {
        self.refs
            .read()
            .iter()
            .filter(|(sr, _)| sr.service_interface == service_interface)
            .map(|(sr, m)| (sr.ref_name.clone(), m.clone()))
            .collect()
    }

    pub fn service_mapping(&self) -> BTreeMap<String, BTreeMap<String, ModuleIdentifier>> {
        mapping_of(&self.refs.read())
    }

    /// service interface -> ref name, for every reference bound to `module`.
    pub fn find_service_interfaces(&self, module: &ModuleIdentifier) -> BTreeMap<String, String> {
        interfaces_of(&self.refs.read(), module)
    }

    pub fn snapshot(&self) -> ServiceReferenceSnapshot {
        ServiceReferenceSnapshot {
            refs: self.refs.read().clone(),
        }
    }
}

impl ServiceReferenceLookup for ServiceReferenceRegistry {
    fn lookup_module(&self, service_interface: &str, ref_name: &str) -> Option<ModuleIdentifier> {
        self.refs
            .read()
            .get(&ServiceReference::new(service_interface, ref_name))
            .cloned()
    }
}
