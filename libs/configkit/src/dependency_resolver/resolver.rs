use std::any::{type_name, Any};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::contracts::Module;
use crate::deadlock::InstantiationContext;
use crate::dependency_resolver::manager::{DependencyResolverManager, TransactionScope};
use crate::errors::{ConfigError, ValidationError};
use crate::identifier::ModuleIdentifier;
use crate::service_reference::ServiceReference;

/// Target of a dependency: a module named directly, or a published service reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModuleReference {
    Module(ModuleIdentifier),
    Service(ServiceReference),
}

impl From<ModuleIdentifier> for ModuleReference {
    fn from(id: ModuleIdentifier) -> Self {
        ModuleReference::Module(id)
    }
}

impl From<&ModuleIdentifier> for ModuleReference {
    fn from(id: &ModuleIdentifier) -> Self {
        ModuleReference::Module(id.clone())
    }
}

impl From<ServiceReference> for ModuleReference {
    fn from(sr: ServiceReference) -> Self {
        ModuleReference::Service(sr)
    }
}

impl fmt::Display for ModuleReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleReference::Module(id) => write!(f, "{id}"),
            ModuleReference::Service(sr) => {
                write!(f, "service {}/{}", sr.service_interface, sr.ref_name)
            }
        }
    }
}

/// Validation status of one module within a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolverPhase {
    Unvalidated,
    Validating,
    /// Last validation succeeded.
    Validated,
    DepthComputed(usize),
    CycleDetected,
    Destroyed,
}

#[derive(Debug)]
struct ResolverState {
    phase: ResolverPhase,
    dependencies: BTreeSet<ModuleIdentifier>,
}

/// Records the dependencies one module declares while validating and, once
/// commit has started, that module's dependency depth.
///
/// Handed to the module's factory; every method is safe to call from
/// concurrently validating modules.
pub struct DependencyResolver {
    identifier: ModuleIdentifier,
    scope: Weak<TransactionScope>,
    state: Mutex<ResolverState>,
}

impl fmt::Debug for DependencyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DependencyResolver")
            .field("identifier", &self.identifier)
            .field("phase", &state.phase)
            .field("dependencies", &state.dependencies)
            .finish()
    }
}

impl DependencyResolver {
    pub(crate) fn new(identifier: ModuleIdentifier, scope: Weak<TransactionScope>) -> Self {
        Self {
            identifier,
            scope,
            state: Mutex::new(ResolverState {
                phase: ResolverPhase::Unvalidated,
                dependencies: BTreeSet::new(),
            }),
        }
    }

    pub fn identifier(&self) -> &ModuleIdentifier {
        &self.identifier
    }

    pub fn phase(&self) -> ResolverPhase {
        self.state.lock().phase
    }

    pub fn dependencies(&self) -> BTreeSet<ModuleIdentifier> {
        self.state.lock().dependencies.clone()
    }

    /// Depth recorded by the last successful ordering pass.
    pub fn max_dependency_depth(&self) -> Result<usize, ConfigError> {
        match self.phase() {
            ResolverPhase::DepthComputed(depth) => Ok(depth),
            other => Err(ConfigError::illegal_state(format!(
                "dependency depth of '{}' is not computed ({other:?})",
                self.identifier
            ))),
        }
    }

    fn scope(&self) -> Result<Arc<TransactionScope>, ConfigError> {
        self.scope.upgrade().ok_or_else(|| {
            ConfigError::illegal_state(format!(
                "transaction of '{}' is closed",
                self.identifier
            ))
        })
    }

    fn attributed(&self, attribute: &str, message: impl Into<String>) -> ConfigError {
        ValidationError::for_attribute(self.identifier.clone(), attribute, message).into()
    }

    fn translate(
        &self,
        scope: &TransactionScope,
        target: ModuleReference,
        attribute: &str,
    ) -> Result<ModuleIdentifier, ConfigError> {
        match target {
            ModuleReference::Module(id) => Ok(id),
            ModuleReference::Service(sr) => scope
                .services
                .lookup_module(&sr.service_interface, &sr.ref_name)
                .ok_or_else(|| {
                    self.attributed(
                        attribute,
                        format!(
                            "service reference '{}'/'{}' is not bound",
                            sr.service_interface, sr.ref_name
                        ),
                    )
                }),
        }
    }

    fn add_dependency(&self, target: &ModuleIdentifier) -> Result<(), ConfigError> {
        let mut state = self.state.lock();
        if state.dependencies.contains(target) {
            return Ok(());
        }
        match state.phase {
            ResolverPhase::DepthComputed(_) | ResolverPhase::Destroyed => {
                Err(ConfigError::illegal_state(format!(
                    "'{}' cannot declare new dependency '{target}' in phase {:?}",
                    self.identifier, state.phase
                )))
            }
            _ => {
                tracing::trace!(module = %self.identifier, dependency = %target, "Dependency declared");
                state.dependencies.insert(target.clone());
                Ok(())
            }
        }
    }

    /// Records `target` as a dependency providing `expected_interface`.
    ///
    /// A target that is unbound, missing from the transaction, or whose factory
    /// does not implement the interface is a validation failure of this module.
    pub fn declare_dependency(
        &self,
        expected_interface: &str,
        target: impl Into<ModuleReference>,
        attribute: &str,
    ) -> Result<ModuleIdentifier, ConfigError> {
        let scope = self.scope()?;
        scope.status.check_not_committed()?;
        let target_id = self.translate(&scope, target.into(), attribute)?;
        {
            let modules = scope.modules.read();
            let info = modules.find_for_dependency(&target_id, &self.identifier, attribute)?;
            if !info.factory().implements_service_interface(expected_interface) {
                return Err(self.attributed(
                    attribute,
                    format!(
                        "module '{target_id}' does not implement service interface '{expected_interface}'"
                    ),
                ));
            }
        }
        self.add_dependency(&target_id)?;
        Ok(target_id)
    }

    /// Records `target` as a dependency and returns its instance as `T`.
    pub fn resolve_instance<T: Any + Send + Sync>(
        &self,
        ctx: &InstantiationContext,
        target: impl Into<ModuleReference>,
        attribute: &str,
    ) -> Result<Arc<T>, ConfigError> {
        let scope = self.scope()?;
        scope.status.check_not_committed()?;
        let target_id = self.translate(&scope, target.into(), attribute)?;
        let proxied = {
            let modules = scope.modules.read();
            let info = modules.find_for_dependency(&target_id, &self.identifier, attribute)?;
            Arc::clone(info.proxied_module())
        };
        self.add_dependency(&target_id)?;

        // The holder lock is released; the target may resolve its own dependencies.
        let instance = proxied
            .get_instance(ctx)
            .map_err(|e| self.instantiation_failure(&target_id, attribute, e))?;

        instance.downcast::<T>().map_err(|_| {
            self.attributed(
                attribute,
                format!(
                    "instance of '{target_id}' cannot be cast to {}",
                    type_name::<T>()
                ),
            )
        })
    }

    fn instantiation_failure(
        &self,
        target: &ModuleIdentifier,
        attribute: &str,
        error: anyhow::Error,
    ) -> ConfigError {
        match error.downcast::<ConfigError>() {
            Ok(e) if !e.is_validation() => e,
            Ok(e) => self.attributed(attribute, format!("instance of '{target}' failed: {e}")),
            Err(e) => self.attributed(attribute, format!("instance of '{target}' failed: {e:#}")),
        }
    }

    /// Whether `target` may keep the instance of its predecessor; false for new modules.
    pub fn can_reuse_dependency(
        &self,
        target: impl Into<ModuleReference>,
        attribute: &str,
    ) -> Result<bool, ConfigError> {
        let scope = self.scope()?;
        let target_id = self.translate(&scope, target.into(), attribute)?;
        let (real, predecessor) = {
            let modules = scope.modules.read();
            let info = modules.find_for_dependency(&target_id, &self.identifier, attribute)?;
            (Arc::clone(info.real_module()), info.predecessor().cloned())
        };
        Ok(match predecessor {
            Some(old) => real.can_reuse(old.module().as_ref()),
            None => false,
        })
    }

    /// Computes the depth of this module and every module it reaches.
    ///
    /// Legal only after commit started; a stored depth is returned unchanged.
    pub fn compute_max_depth(&self, manager: &DependencyResolverManager) -> Result<usize, ConfigError> {
        manager.check_commit_started()?;
        if let ResolverPhase::DepthComputed(depth) = self.phase() {
            return Ok(depth);
        }
        let mut walk = DepthWalk::new(manager);
        let result = walk.visit(&self.identifier);
        walk.finish(result)
    }

    pub(crate) fn begin_validation(&self) {
        let mut state = self.state.lock();
        if matches!(
            state.phase,
            ResolverPhase::Unvalidated | ResolverPhase::Validated
        ) {
            state.phase = ResolverPhase::Validating;
        }
    }

    pub(crate) fn end_validation(&self, ok: bool) {
        let mut state = self.state.lock();
        if state.phase == ResolverPhase::Validating {
            state.phase = if ok {
                ResolverPhase::Validated
            } else {
                ResolverPhase::Unvalidated
            };
        }
    }

    fn publish_depth(&self, depth: usize) {
        let mut state = self.state.lock();
        if state.phase != ResolverPhase::Destroyed {
            state.phase = ResolverPhase::DepthComputed(depth);
        }
    }

    fn mark_cycle(&self) {
        let mut state = self.state.lock();
        if !matches!(state.phase, ResolverPhase::DepthComputed(_) | ResolverPhase::Destroyed) {
            state.phase = ResolverPhase::CycleDetected;
        }
    }

    pub(crate) fn mark_destroyed(&self) {
        self.state.lock().phase = ResolverPhase::Destroyed;
    }
}

/// One depth-first pass over the dependency graph.
///
/// Depths go into a scratch table and reach the resolvers only through
/// [`DepthWalk::finish`] when the whole pass succeeded.
pub(crate) struct DepthWalk<'a> {
    manager: &'a DependencyResolverManager,
    live: BTreeSet<ModuleIdentifier>,
    memo: HashMap<ModuleIdentifier, usize>,
    path: Vec<ModuleIdentifier>,
}

impl<'a> DepthWalk<'a> {
    pub(crate) fn new(manager: &'a DependencyResolverManager) -> Self {
        Self {
            manager,
            live: manager.identifiers().into_iter().collect(),
            memo: HashMap::new(),
            path: Vec::new(),
        }
    }

    pub(crate) fn visit(&mut self, id: &ModuleIdentifier) -> Result<usize, ConfigError> {
        if let Some(depth) = self.memo.get(id) {
            return Ok(*depth);
        }
        if let Some(start) = self.path.iter().position(|m| m == id) {
            let mut path = self.path[start..].to_vec();
            path.push(id.clone());
            return Err(ConfigError::CycleDetected { path });
        }

        let resolver = self.manager.get_or_create(id);
        if let ResolverPhase::DepthComputed(depth) = resolver.phase() {
            self.memo.insert(id.clone(), depth);
            return Ok(depth);
        }

        self.path.push(id.clone());
        let mut depth = 0;
        for dependency in resolver.dependencies() {
            // Edges left over from an earlier validation of a since-destroyed module.
            if !self.live.contains(&dependency) {
                tracing::trace!(module = %id, dependency = %dependency, "Skipping edge to module outside the working set");
                continue;
            }
            depth = depth.max(self.visit(&dependency)? + 1);
        }
        self.path.pop();

        self.memo.insert(id.clone(), depth);
        Ok(depth)
    }

    /// Publishes the scratch depths on success; marks the cycle members otherwise.
    pub(crate) fn finish<T>(self, result: Result<T, ConfigError>) -> Result<T, ConfigError> {
        match result {
            Ok(value) => {
                for (id, depth) in &self.memo {
                    if let Some(resolver) = self.manager.resolver(id) {
                        resolver.publish_depth(*depth);
                    }
                }
                Ok(value)
            }
            Err(ConfigError::CycleDetected { path }) => {
                for id in &path {
                    if let Some(resolver) = self.manager.resolver(id) {
                        resolver.mark_cycle();
                    }
                }
                tracing::error!(cycle = %crate::identifier::format_chain(&path), "Dependency cycle detected");
                Err(ConfigError::CycleDetected { path })
            }
            Err(other) => Err(other),
        }
    }
}
