//! Test modules shared by the integration suites.
#![allow(dead_code)]

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use parking_lot::Mutex;

use configkit::{
    ConfigRegistry, ConfigTransactionController, DependencyResolver, DependencyResolverManager,
    Instance, InstantiationContext, InstantiationWatchdog, Module, ModuleFactory, ModuleIdentifier,
    ModuleInternalInfo, ModuleReference, Registration, RegistrySettings, ServicePublisher,
    ServiceReferenceRegistry, TransactionIdentifier, TransactionStatus,
};

pub const POOL_FACTORY: &str = "thread-pool";
pub const POOL_SERVICE: &str = "threadpool";
pub const CLIENT_FACTORY: &str = "client";
pub const CLIENT_SERVICE: &str = "client";
pub const NODE_FACTORY: &str = "node";
pub const NODE_SERVICE: &str = "node";

pub fn pool_id(name: &str) -> ModuleIdentifier {
    ModuleIdentifier::new(POOL_FACTORY, name)
}

pub fn client_id(name: &str) -> ModuleIdentifier {
    ModuleIdentifier::new(CLIENT_FACTORY, name)
}

pub fn node_id(name: &str) -> ModuleIdentifier {
    ModuleIdentifier::new(NODE_FACTORY, name)
}

/// Ordered record of lifecycle events across modules.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.starts_with(prefix))
            .collect()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == event)
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

// ---------- thread pool ----------

#[derive(Debug)]
pub struct ThreadPool {
    pub name: String,
    pub size: usize,
    log: EventLog,
    closed: AtomicBool,
}

impl ThreadPool {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.log.push(format!("close:{}", self.name));
        }
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.0.lock().iter()).finish()
    }
}

pub struct PoolModule {
    id: ModuleIdentifier,
    log: EventLog,
    size: Mutex<usize>,
    recreate: AtomicBool,
    old: Option<(usize, Instance)>,
    live: Mutex<Option<Arc<ThreadPool>>>,
}

impl PoolModule {
    fn new(id: ModuleIdentifier, log: EventLog, size: usize, old: Option<(usize, Instance)>) -> Arc<Self> {
        Arc::new(Self {
            id,
            log,
            size: Mutex::new(size),
            recreate: AtomicBool::new(false),
            old,
            live: Mutex::new(None),
        })
    }

    pub fn set_size(&self, size: usize) {
        *self.size.lock() = size;
    }

    fn size(&self) -> usize {
        *self.size.lock()
    }
}

impl Module for PoolModule {
    fn identifier(&self) -> &ModuleIdentifier {
        &self.id
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.size() > 0, "size must be positive");
        Ok(())
    }

    fn get_instance(&self, _ctx: &InstantiationContext) -> anyhow::Result<Instance> {
        if let Some((old_size, old_instance)) = &self.old {
            let old_pool = Arc::clone(old_instance)
                .downcast::<ThreadPool>()
                .map_err(|_| anyhow::anyhow!("predecessor of {} is not a thread pool", self.id))?;
            if !self.recreate.load(Ordering::SeqCst) && *old_size == self.size() {
                *self.live.lock() = Some(Arc::clone(&old_pool));
                return Ok(old_pool);
            }
            old_pool.close();
        }
        let pool = Arc::new(ThreadPool {
            name: self.id.to_string(),
            size: self.size(),
            log: self.log.clone(),
            closed: AtomicBool::new(false),
        });
        self.log.push(format!("create:{}", self.id));
        *self.live.lock() = Some(Arc::clone(&pool));
        Ok(pool)
    }

    fn can_reuse(&self, old: &dyn Module) -> bool {
        !self.recreate.load(Ordering::SeqCst)
            && old
                .as_any()
                .downcast_ref::<PoolModule>()
                .is_some_and(|o| o.size() == self.size())
    }

    fn close(&self) -> anyhow::Result<()> {
        if let Some(pool) = self.live.lock().take() {
            pool.close();
        }
        Ok(())
    }

    fn request_recreate(&self) {
        self.recreate.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct PoolFactory {
    log: EventLog,
    defaults: Vec<String>,
}

impl PoolFactory {
    pub fn new(log: &EventLog) -> Self {
        Self {
            log: log.clone(),
            defaults: Vec::new(),
        }
    }

    pub fn with_defaults(log: &EventLog, defaults: &[&str]) -> Self {
        Self {
            log: log.clone(),
            defaults: defaults.iter().map(|d| d.to_string()).collect(),
        }
    }
}

impl ModuleFactory for PoolFactory {
    fn implementation_name(&self) -> &str {
        POOL_FACTORY
    }

    fn create_module(
        &self,
        instance_name: &str,
        _resolver: Arc<DependencyResolver>,
    ) -> anyhow::Result<Arc<dyn Module>> {
        Ok(PoolModule::new(pool_id(instance_name), self.log.clone(), 4, None) as Arc<dyn Module>)
    }

    fn create_module_from_old(
        &self,
        instance_name: &str,
        _resolver: Arc<DependencyResolver>,
        old: &ModuleInternalInfo,
    ) -> anyhow::Result<Arc<dyn Module>> {
        let old_module = old
            .module()
            .as_any()
            .downcast_ref::<PoolModule>()
            .ok_or_else(|| anyhow::anyhow!("{} is not a thread pool module", old.identifier()))?;
        let size = old_module.size();
        Ok(PoolModule::new(
            pool_id(instance_name),
            self.log.clone(),
            size,
            Some((size, Arc::clone(old.instance()))),
        ) as Arc<dyn Module>)
    }

    fn service_interfaces(&self) -> BTreeSet<String> {
        BTreeSet::from([POOL_SERVICE.to_string()])
    }

    fn default_modules(
        &self,
        _resolvers: &DependencyResolverManager,
    ) -> anyhow::Result<Vec<Arc<dyn Module>>> {
        Ok(self
            .defaults
            .iter()
            .map(|name| PoolModule::new(pool_id(name), self.log.clone(), 1, None) as Arc<dyn Module>)
            .collect())
    }
}

// ---------- client ----------

#[derive(Debug)]
pub struct Client {
    pub name: String,
    pub pool: Arc<ThreadPool>,
}

pub struct ClientModule {
    id: ModuleIdentifier,
    log: EventLog,
    resolver: Arc<DependencyResolver>,
    pool: Mutex<Option<ModuleReference>>,
    old: Option<Instance>,
}

impl ClientModule {
    pub fn set_pool(&self, pool: impl Into<ModuleReference>) {
        *self.pool.lock() = Some(pool.into());
    }

    fn pool_ref(&self) -> anyhow::Result<ModuleReference> {
        self.pool
            .lock()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("pool is not set"))
    }
}

impl Module for ClientModule {
    fn identifier(&self) -> &ModuleIdentifier {
        &self.id
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.resolver
            .declare_dependency(POOL_SERVICE, self.pool_ref()?, "pool")?;
        Ok(())
    }

    fn get_instance(&self, ctx: &InstantiationContext) -> anyhow::Result<Instance> {
        let pool = self
            .resolver
            .resolve_instance::<ThreadPool>(ctx, self.pool_ref()?, "pool")?;
        if let Some(old) = &self.old {
            if let Some(old_client) = old.downcast_ref::<Client>() {
                if Arc::ptr_eq(&old_client.pool, &pool) {
                    return Ok(Arc::clone(old));
                }
            }
        }
        self.log.push(format!("create:{}", self.id));
        Ok(Arc::new(Client {
            name: self.id.to_string(),
            pool,
        }))
    }

    fn close(&self) -> anyhow::Result<()> {
        self.log.push(format!("close:{}", self.id));
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct ClientFactory {
    log: EventLog,
}

impl ClientFactory {
    pub fn new(log: &EventLog) -> Self {
        Self { log: log.clone() }
    }
}

impl ModuleFactory for ClientFactory {
    fn implementation_name(&self) -> &str {
        CLIENT_FACTORY
    }

    fn create_module(
        &self,
        instance_name: &str,
        resolver: Arc<DependencyResolver>,
    ) -> anyhow::Result<Arc<dyn Module>> {
        Ok(Arc::new(ClientModule {
            id: client_id(instance_name),
            log: self.log.clone(),
            resolver,
            pool: Mutex::new(None),
            old: None,
        }) as Arc<dyn Module>)
    }

    fn create_module_from_old(
        &self,
        instance_name: &str,
        resolver: Arc<DependencyResolver>,
        old: &ModuleInternalInfo,
    ) -> anyhow::Result<Arc<dyn Module>> {
        let pool = old
            .module()
            .as_any()
            .downcast_ref::<ClientModule>()
            .and_then(|m| m.pool.lock().clone());
        Ok(Arc::new(ClientModule {
            id: client_id(instance_name),
            log: self.log.clone(),
            resolver,
            pool: Mutex::new(pool),
            old: Some(Arc::clone(old.instance())),
        }) as Arc<dyn Module>)
    }

    fn service_interfaces(&self) -> BTreeSet<String> {
        BTreeSet::from([CLIENT_SERVICE.to_string()])
    }
}

// ---------- generic graph node ----------

/// Module whose dependencies are a plain list, declared while validating.
pub struct NodeModule {
    id: ModuleIdentifier,
    resolver: Arc<DependencyResolver>,
    deps: Mutex<Vec<ModuleIdentifier>>,
    /// Resolved from `get_instance` without being declared first.
    late_deps: Vec<ModuleIdentifier>,
    instantiations: AtomicUsize,
    /// Waited on once, after the instantiation starts and before any dependency.
    gate: Mutex<Option<Arc<Barrier>>>,
}

impl NodeModule {
    pub fn new(
        id: ModuleIdentifier,
        resolver: Arc<DependencyResolver>,
        deps: &[&str],
        late_deps: &[&str],
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            resolver,
            deps: Mutex::new(deps.iter().map(|d| node_id(d)).collect()),
            late_deps: late_deps.iter().map(|d| node_id(d)).collect(),
            instantiations: AtomicUsize::new(0),
            gate: Mutex::new(None),
        })
    }

    pub fn set_deps(&self, deps: &[&str]) {
        *self.deps.lock() = deps.iter().map(|d| node_id(d)).collect();
    }

    pub fn set_gate(&self, gate: Arc<Barrier>) {
        *self.gate.lock() = Some(gate);
    }

    pub fn instantiations(&self) -> usize {
        self.instantiations.load(Ordering::SeqCst)
    }
}

impl Module for NodeModule {
    fn identifier(&self) -> &ModuleIdentifier {
        &self.id
    }

    fn validate(&self) -> anyhow::Result<()> {
        let deps = self.deps.lock().clone();
        for dep in &deps {
            self.resolver.declare_dependency(NODE_SERVICE, dep, "deps")?;
        }
        Ok(())
    }

    fn get_instance(&self, ctx: &InstantiationContext) -> anyhow::Result<Instance> {
        self.instantiations.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            gate.wait();
        }
        let deps = self.deps.lock().clone();
        for dep in deps.iter().chain(&self.late_deps) {
            self.resolver.resolve_instance::<String>(ctx, dep, "deps")?;
        }
        Ok(Arc::new(self.id.to_string()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct NodeFactory;

impl ModuleFactory for NodeFactory {
    fn implementation_name(&self) -> &str {
        NODE_FACTORY
    }

    fn create_module(
        &self,
        instance_name: &str,
        resolver: Arc<DependencyResolver>,
    ) -> anyhow::Result<Arc<dyn Module>> {
        Ok(NodeModule::new(node_id(instance_name), resolver, &[], &[]) as Arc<dyn Module>)
    }

    fn create_module_from_old(
        &self,
        instance_name: &str,
        resolver: Arc<DependencyResolver>,
        _old: &ModuleInternalInfo,
    ) -> anyhow::Result<Arc<dyn Module>> {
        self.create_module(instance_name, resolver)
    }

    fn service_interfaces(&self) -> BTreeSet<String> {
        BTreeSet::from([NODE_SERVICE.to_string()])
    }
}

/// A resolver manager over a fresh transaction, fed with [`NodeModule`]s.
pub struct Graph {
    pub status: Arc<TransactionStatus>,
    pub services: Arc<ServiceReferenceRegistry>,
    pub monitor: Arc<InstantiationWatchdog>,
    pub manager: DependencyResolverManager,
    nodes: Mutex<BTreeMap<String, Arc<NodeModule>>>,
}

impl Graph {
    pub fn new() -> Self {
        let status = Arc::new(TransactionStatus::new());
        let services = Arc::new(ServiceReferenceRegistry::new("graph"));
        let monitor = Arc::new(
            InstantiationWatchdog::start("graph", Duration::from_secs(30), Duration::from_millis(20))
                .unwrap(),
        );
        let manager = DependencyResolverManager::new(
            TransactionIdentifier::new("graph"),
            Arc::clone(&status),
            services.clone(),
            monitor.clone(),
        );
        Self {
            status,
            services,
            monitor,
            manager,
            nodes: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn node(&self, name: &str, deps: &[&str]) -> ModuleIdentifier {
        self.node_with_late(name, deps, &[])
    }

    pub fn node_with_late(&self, name: &str, deps: &[&str], late: &[&str]) -> ModuleIdentifier {
        self.insert(name, deps, late, None)
    }

    /// Adds a node that replaces a committed one recorded at `ordering_idx`.
    pub fn node_with_predecessor(&self, name: &str, ordering_idx: usize) -> ModuleIdentifier {
        let id = node_id(name);
        let resolver = self.manager.get_or_create(&id);
        let old = Arc::new(ModuleInternalInfo::new(
            id.clone(),
            NodeModule::new(id.clone(), resolver, &[], &[]),
            Arc::new(name.to_string()),
            Arc::new(NodeFactory),
            ordering_idx,
            false,
            None,
        ));
        self.insert(name, &[], &[], Some(old))
    }

    fn insert(
        &self,
        name: &str,
        deps: &[&str],
        late: &[&str],
        predecessor: Option<Arc<ModuleInternalInfo>>,
    ) -> ModuleIdentifier {
        let id = node_id(name);
        let resolver = self.manager.get_or_create(&id);
        let module = NodeModule::new(id.clone(), resolver, deps, late);
        self.manager
            .wrap(
                id.clone(),
                module.clone(),
                Arc::new(NodeFactory),
                predecessor,
                None,
                false,
            )
            .unwrap();
        self.nodes.lock().insert(name.to_string(), module);
        id
    }

    pub fn module(&self, name: &str) -> Arc<NodeModule> {
        self.nodes.lock()[name].clone()
    }

    /// Validates every node; returns the failures keyed by module.
    pub fn validate(&self) -> BTreeMap<ModuleIdentifier, String> {
        let mut failures = BTreeMap::new();
        for module in self.manager.all_modules() {
            if let Err(e) = module.validate() {
                failures.insert(module.identifier().clone(), e.to_string());
            }
        }
        failures
    }

    pub fn start_commit(&self) {
        self.status.set_commit_started().unwrap();
    }
}

// ---------- collaborators ----------

struct LoggedRegistration {
    log: EventLog,
    event: String,
}

impl Registration for LoggedRegistration {
    fn close(&self) {
        self.log.push(self.event.clone());
    }
}

/// Publisher that records every publication and its withdrawal.
pub struct RecordingPublisher {
    log: EventLog,
    reject: Option<ModuleIdentifier>,
}

impl RecordingPublisher {
    pub fn new(log: &EventLog) -> Self {
        Self {
            log: log.clone(),
            reject: None,
        }
    }

    /// Publisher that fails for `module`.
    pub fn rejecting(log: &EventLog, module: ModuleIdentifier) -> Self {
        Self {
            log: log.clone(),
            reject: Some(module),
        }
    }
}

impl ServicePublisher for RecordingPublisher {
    fn publish(
        &self,
        module: &ModuleIdentifier,
        _instance: &Instance,
        services: &BTreeMap<String, String>,
    ) -> anyhow::Result<Box<dyn Registration>> {
        if self.reject.as_ref() == Some(module) {
            anyhow::bail!("discovery rejected {module}");
        }
        let names: Vec<_> = services.iter().map(|(si, r)| format!("{si}={r}")).collect();
        self.log
            .push(format!("publish:{module}[{}]", names.join(",")));
        Ok(Box::new(LoggedRegistration {
            log: self.log.clone(),
            event: format!("unpublish:{module}"),
        }))
    }
}

pub fn fast_settings() -> RegistrySettings {
    RegistrySettings {
        instantiation_warn_after: Duration::from_secs(10),
        watchdog_poll_interval: Duration::from_millis(20),
        ..RegistrySettings::default()
    }
}

/// Registry with the pool and client factories and a recording publisher.
pub fn registry(log: &EventLog) -> ConfigRegistry {
    ConfigRegistry::builder()
        .settings(fast_settings())
        .factory(Arc::new(PoolFactory::new(log)))
        .factory(Arc::new(ClientFactory::new(log)))
        .publisher(Arc::new(RecordingPublisher::new(log)))
        .build()
}

pub fn configure_pool(tx: &ConfigTransactionController, name: &str, size: usize) {
    let module = tx.find_module(&pool_id(name)).unwrap();
    module
        .as_any()
        .downcast_ref::<PoolModule>()
        .unwrap()
        .set_size(size);
}

pub fn configure_client(tx: &ConfigTransactionController, name: &str, pool: impl Into<ModuleReference>) {
    let module = tx.find_module(&client_id(name)).unwrap();
    module
        .as_any()
        .downcast_ref::<ClientModule>()
        .unwrap()
        .set_pool(pool);
}

pub fn configure_node(tx: &ConfigTransactionController, name: &str, deps: &[&str]) {
    let module = tx.find_module(&node_id(name)).unwrap();
    module
        .as_any()
        .downcast_ref::<NodeModule>()
        .unwrap()
        .set_deps(deps);
}

/// Live instance of a committed module.
pub fn committed_instance<T: Any + Send + Sync>(registry: &ConfigRegistry, id: &ModuleIdentifier) -> Arc<T> {
    let info = registry.committed_module(id).unwrap();
    Arc::clone(info.instance()).downcast::<T>().unwrap()
}
