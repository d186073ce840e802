//! Fakes shared by the unit tests of this crate.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::contracts::{Instance, Module, ModuleFactory};
use crate::deadlock::{InstantiationContext, InstantiationWatchdog};
use crate::dependency_resolver::{DependencyResolver, DependencyResolverManager, ModuleInternalInfo};
use crate::identifier::{ModuleIdentifier, TransactionIdentifier};
use crate::service_reference::ServiceReferenceRegistry;
use crate::transaction::TransactionStatus;

pub(crate) const SERVICE: &str = "test:service";

pub(crate) fn id(name: &str) -> ModuleIdentifier {
    ModuleIdentifier::new("test", name)
}

#[derive(Debug)]
pub(crate) struct TestInstance {
    pub name: String,
    pub deps: Vec<Arc<TestInstance>>,
}

pub(crate) struct TestModule {
    id: ModuleIdentifier,
    resolver: Arc<DependencyResolver>,
    deps: Vec<ModuleIdentifier>,
    fail: bool,
    instantiations: AtomicUsize,
    closed: AtomicBool,
}

impl TestModule {
    pub(crate) fn new(id: ModuleIdentifier, resolver: Arc<DependencyResolver>, deps: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            id,
            resolver,
            deps: deps.iter().map(|d| self::id(d)).collect(),
            fail: false,
            instantiations: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    fn failing(id: ModuleIdentifier, resolver: Arc<DependencyResolver>) -> Arc<Self> {
        Arc::new(Self {
            id,
            resolver,
            deps: Vec::new(),
            fail: true,
            instantiations: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn instantiations(&self) -> usize {
        self.instantiations.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Module for TestModule {
    fn identifier(&self) -> &ModuleIdentifier {
        &self.id
    }

    fn validate(&self) -> anyhow::Result<()> {
        for dep in &self.deps {
            self.resolver.declare_dependency(SERVICE, dep, "deps")?;
        }
        Ok(())
    }

    fn get_instance(&self, ctx: &InstantiationContext) -> anyhow::Result<Instance> {
        self.instantiations.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("{} refuses to start", self.id);
        }
        let deps = self
            .deps
            .iter()
            .map(|dep| self.resolver.resolve_instance::<TestInstance>(ctx, dep, "deps"))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Arc::new(TestInstance {
            name: self.id.instance_name().to_string(),
            deps,
        }))
    }

    fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Factory of [`TestModule`]s; dependencies and failures are configured per instance name.
#[derive(Default)]
pub(crate) struct TestFactory {
    deps: Mutex<BTreeMap<String, Vec<String>>>,
    failing: Mutex<BTreeSet<String>>,
    defaults: Vec<String>,
    created: Mutex<BTreeMap<String, Arc<TestModule>>>,
}

impl TestFactory {
    pub(crate) fn with_defaults(names: &[&str]) -> Self {
        Self {
            defaults: names.iter().map(|n| n.to_string()).collect(),
            ..Self::default()
        }
    }

    pub(crate) fn set_deps(&self, instance: &str, deps: &[&str]) {
        self.deps.lock().insert(
            instance.to_string(),
            deps.iter().map(|d| d.to_string()).collect(),
        );
    }

    pub(crate) fn set_failing(&self, instance: &str) {
        self.failing.lock().insert(instance.to_string());
    }

    /// Last module built for `instance`.
    pub(crate) fn module(&self, instance: &str) -> Arc<TestModule> {
        self.created.lock()[instance].clone()
    }

    fn build(&self, instance_name: &str, resolver: Arc<DependencyResolver>) -> Arc<TestModule> {
        let deps = self.deps.lock().get(instance_name).cloned().unwrap_or_default();
        let module = if self.failing.lock().contains(instance_name) {
            TestModule::failing(id(instance_name), resolver)
        } else {
            let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
            TestModule::new(id(instance_name), resolver, &deps)
        };
        self.created
            .lock()
            .insert(instance_name.to_string(), module.clone());
        module
    }
}

impl ModuleFactory for TestFactory {
    fn implementation_name(&self) -> &str {
        "test"
    }

    fn create_module(
        &self,
        instance_name: &str,
        resolver: Arc<DependencyResolver>,
    ) -> anyhow::Result<Arc<dyn Module>> {
        Ok(self.build(instance_name, resolver) as Arc<dyn Module>)
    }

    fn create_module_from_old(
        &self,
        instance_name: &str,
        resolver: Arc<DependencyResolver>,
        _old: &ModuleInternalInfo,
    ) -> anyhow::Result<Arc<dyn Module>> {
        Ok(self.build(instance_name, resolver) as Arc<dyn Module>)
    }

    fn service_interfaces(&self) -> BTreeSet<String> {
        BTreeSet::from([SERVICE.to_string()])
    }

    fn default_modules(
        &self,
        resolvers: &DependencyResolverManager,
    ) -> anyhow::Result<Vec<Arc<dyn Module>>> {
        Ok(self
            .defaults
            .iter()
            .map(|name| self.build(name, resolvers.get_or_create(&id(name))) as Arc<dyn Module>)
            .collect())
    }
}

/// A manager over a fresh transaction with its collaborators exposed.
pub(crate) struct Fixture {
    pub status: Arc<TransactionStatus>,
    pub services: Arc<ServiceReferenceRegistry>,
    pub manager: DependencyResolverManager,
    modules: Mutex<BTreeMap<String, Arc<TestModule>>>,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        let status = Arc::new(TransactionStatus::new());
        let services = Arc::new(ServiceReferenceRegistry::new("tx-test"));
        let monitor = Arc::new(
            InstantiationWatchdog::start("tx-test", Duration::from_secs(60), Duration::from_millis(50))
                .expect("watchdog"),
        );
        let manager = DependencyResolverManager::new(
            TransactionIdentifier::new("tx-test"),
            Arc::clone(&status),
            services.clone(),
            monitor,
        );
        Self {
            status,
            services,
            manager,
            modules: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn factory(&self) -> Arc<dyn ModuleFactory> {
        Arc::new(TestFactory::default())
    }

    fn insert(&self, module: Arc<TestModule>, predecessor: Option<Arc<ModuleInternalInfo>>) -> ModuleIdentifier {
        let identifier = module.identifier().clone();
        self.manager
            .wrap(identifier.clone(), module.clone(), self.factory(), predecessor, None, false)
            .expect("wrap");
        self.modules
            .lock()
            .insert(identifier.instance_name().to_string(), module);
        identifier
    }

    pub(crate) fn add(&self, name: &str, deps: &[&str]) -> ModuleIdentifier {
        let resolver = self.manager.get_or_create(&id(name));
        self.insert(TestModule::new(id(name), resolver, deps), None)
    }

    pub(crate) fn add_failing(&self, name: &str) -> ModuleIdentifier {
        let resolver = self.manager.get_or_create(&id(name));
        self.insert(TestModule::failing(id(name), resolver), None)
    }

    pub(crate) fn add_with_predecessor(&self, name: &str, ordering_idx: usize) -> ModuleIdentifier {
        let old_resolver = self.manager.get_or_create(&id(name));
        let old = Arc::new(ModuleInternalInfo::new(
            id(name),
            TestModule::new(id(name), old_resolver.clone(), &[]),
            Arc::new(TestInstance {
                name: name.to_string(),
                deps: Vec::new(),
            }),
            self.factory(),
            ordering_idx,
            false,
            None,
        ));
        self.insert(TestModule::new(id(name), old_resolver, &[]), Some(old))
    }

    pub(crate) fn module(&self, name: &str) -> Arc<TestModule> {
        self.modules.lock()[name].clone()
    }

    /// Validates every module the way the transaction controller does.
    pub(crate) fn validate_all(&self) {
        for module in self.manager.all_modules() {
            let resolver = self.manager.get_or_create(module.identifier());
            resolver.begin_validation();
            let result = module.validate();
            resolver.end_validation(result.is_ok());
            result.expect("validation");
        }
    }
}
