use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::contracts::{Instance, Module};
use crate::deadlock::{DeadlockMonitor, InstantiationContext, InstantiationGuard, WaitGuard};
use crate::errors::ConfigError;
use crate::identifier::ModuleIdentifier;

/// How long a blocked `get_instance` waits between deadlock checks.
const CACHE_LOCK_POLL: Duration = Duration::from_millis(10);

/// Safety wrapper around every module handed out during a transaction.
///
/// The first successful `get_instance` is cached for the rest of the
/// transaction; the real module is asked at most once. The instantiation is
/// registered with the deadlock monitor for its whole duration, and a thread
/// blocked on another thread's instantiation reports the wait so a cycle
/// across threads fails instead of hanging. Every other call is forwarded to
/// the real module and its errors are returned untouched.
pub struct ProxiedModule {
    real: Arc<dyn Module>,
    monitor: Arc<dyn DeadlockMonitor>,
    cached: Mutex<Option<Instance>>,
}

impl std::fmt::Debug for ProxiedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxiedModule")
            .field("identifier", self.real.identifier())
            .field("instantiated", &self.cached.lock().is_some())
            .finish()
    }
}

impl ProxiedModule {
    pub fn new(real: Arc<dyn Module>, monitor: Arc<dyn DeadlockMonitor>) -> Self {
        Self {
            real,
            monitor,
            cached: Mutex::new(None),
        }
    }

    pub fn real(&self) -> &Arc<dyn Module> {
        &self.real
    }

    /// Takes the cache lock, reporting the wait to the monitor while another
    /// thread holds it.
    fn lock_cache(
        &self,
        ctx: &InstantiationContext,
        id: &ModuleIdentifier,
    ) -> Result<MutexGuard<'_, Option<Instance>>, ConfigError> {
        if let Some(cached) = self.cached.try_lock() {
            return Ok(cached);
        }
        let _wait = WaitGuard(self.monitor.as_ref());
        loop {
            self.monitor.wait_for(ctx, id)?;
            if let Some(cached) = self.cached.try_lock_for(CACHE_LOCK_POLL) {
                return Ok(cached);
            }
        }
    }

    /// The cached instance, if `get_instance` already succeeded.
    pub fn cached_instance(&self) -> Option<Instance> {
        self.cached.lock().clone()
    }
}

impl Module for ProxiedModule {
    fn identifier(&self) -> &ModuleIdentifier {
        self.real.identifier()
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.real.validate()
    }

    fn get_instance(&self, ctx: &InstantiationContext) -> anyhow::Result<Instance> {
        let id = self.real.identifier();
        // Fails fast on recursion before the cache lock is taken.
        let child = ctx.enter(id)?;

        let mut cached = self.lock_cache(ctx, id)?;
        if let Some(instance) = cached.as_ref() {
            return Ok(Arc::clone(instance));
        }

        if !self.monitor.is_alive() {
            return Err(ConfigError::MonitorUnavailable(id.clone()).into());
        }
        let _registration = InstantiationGuard::enter(self.monitor.as_ref(), ctx, &child);

        tracing::trace!(module = %id, depth = child.depth(), "Instantiating module");
        let instance = self.real.get_instance(&child)?;
        *cached = Some(Arc::clone(&instance));
        Ok(instance)
    }

    fn can_reuse(&self, old: &dyn Module) -> bool {
        self.real.can_reuse(old)
    }

    fn close(&self) -> anyhow::Result<()> {
        self.real.close()
    }

    fn request_recreate(&self) {
        self.real.request_recreate()
    }

    fn as_any(&self) -> &dyn Any {
        self.real.as_any()
    }
}
