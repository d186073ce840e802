//! Deadlock avoidance around module instantiation.
//!
//! Instantiation of one module may recursively instantiate its dependencies.
//! Two mechanisms bound that recursion:
//!
//! - [`InstantiationContext`] is passed explicitly down every `get_instance`
//!   call and carries the chain of modules being instantiated on the current
//!   call path. Re-entering a module already on the chain fails immediately.
//! - A [`DeadlockMonitor`] is told which chain each thread is instantiating
//!   and which module it is blocked on. A wait that closes a cycle across
//!   threads fails fast; long-running instantiations are reported.

use std::collections::{HashMap, HashSet};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

use crate::errors::ConfigError;
use crate::identifier::{format_chain, ModuleIdentifier};

/// Cross-thread bookkeeping of in-flight instantiations.
pub trait DeadlockMonitor: Send + Sync {
    fn is_alive(&self) -> bool;

    /// Records the chain the calling thread is instantiating; an empty chain clears it.
    fn set_currently_instantiating(&self, ctx: &InstantiationContext);

    /// Records that the calling thread, while instantiating `ctx`, is blocked on
    /// `module`. Fails when that wait closes a cycle with other threads.
    fn wait_for(&self, ctx: &InstantiationContext, module: &ModuleIdentifier) -> Result<(), ConfigError>;

    /// Clears the wait recorded for the calling thread.
    fn stop_waiting(&self);
}

/// Chain of modules being instantiated on the current call path.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstantiationContext {
    chain: Vec<ModuleIdentifier>,
}

impl InstantiationContext {
    /// Context for a call that does not originate from another instantiation.
    pub fn root() -> Self {
        Self::default()
    }

    /// Returns the context for instantiating `module` from this one.
    pub fn enter(&self, module: &ModuleIdentifier) -> Result<Self, ConfigError> {
        if let Some(start) = self.chain.iter().position(|m| m == module) {
            let mut path = self.chain[start..].to_vec();
            path.push(module.clone());
            return Err(ConfigError::InstantiationCycle { path });
        }
        let mut chain = self.chain.clone();
        chain.push(module.clone());
        Ok(Self { chain })
    }

    pub fn chain(&self) -> &[ModuleIdentifier] {
        &self.chain
    }

    /// Innermost module being instantiated, if any.
    pub fn current(&self) -> Option<&ModuleIdentifier> {
        self.chain.last()
    }

    pub fn depth(&self) -> usize {
        self.chain.len()
    }
}

/// Registers an instantiation with the monitor and restores the caller's
/// registration when dropped, on every exit path.
pub(crate) struct InstantiationGuard<'a> {
    monitor: &'a dyn DeadlockMonitor,
    parent: &'a InstantiationContext,
}

impl<'a> InstantiationGuard<'a> {
    pub(crate) fn enter(
        monitor: &'a dyn DeadlockMonitor,
        parent: &'a InstantiationContext,
        child: &InstantiationContext,
    ) -> Self {
        monitor.set_currently_instantiating(child);
        Self { monitor, parent }
    }
}

impl Drop for InstantiationGuard<'_> {
    fn drop(&mut self) {
        self.monitor.set_currently_instantiating(self.parent);
    }
}

/// Clears the calling thread's recorded wait when dropped.
pub(crate) struct WaitGuard<'a>(pub(crate) &'a dyn DeadlockMonitor);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.stop_waiting();
    }
}

struct InFlight {
    /// Outermost first; the thread holds every module on it.
    chain: Vec<ModuleIdentifier>,
    since: Instant,
    warned: bool,
}

impl InFlight {
    fn module(&self) -> Option<&ModuleIdentifier> {
        self.chain.last()
    }
}

struct WatchdogState {
    running: bool,
    in_flight: HashMap<ThreadId, InFlight>,
    waiting: HashMap<ThreadId, ModuleIdentifier>,
}

impl WatchdogState {
    /// Follows "blocked on" edges from `wanted` through the threads holding
    /// each module. Returns the cycle when it leads back to `held`.
    fn find_wait_cycle(
        &self,
        me: ThreadId,
        held: &[ModuleIdentifier],
        wanted: &ModuleIdentifier,
    ) -> Option<Vec<ModuleIdentifier>> {
        let mut path = Vec::new();
        let mut target = wanted.clone();
        let mut visited = HashSet::new();
        loop {
            if let Some(pos) = held.iter().position(|m| *m == target) {
                let mut cycle = held[pos..].to_vec();
                cycle.extend(path);
                cycle.push(target);
                return Some(cycle);
            }
            let (owner, entry) = self
                .in_flight
                .iter()
                .find(|(thread, entry)| **thread != me && entry.chain.contains(&target))?;
            if !visited.insert(*owner) {
                return None;
            }
            let pos = entry.chain.iter().position(|m| *m == target)?;
            path.push(target);
            path.extend(entry.chain[pos + 1..].iter().cloned());
            target = self.waiting.get(owner)?.clone();
        }
    }
}

struct WatchdogShared {
    name: String,
    warn_after: Duration,
    poll_interval: Duration,
    state: Mutex<WatchdogState>,
    wakeup: Condvar,
}

impl WatchdogShared {
    fn run(&self) {
        let mut state = self.state.lock();
        while state.running {
            self.wakeup.wait_for(&mut state, self.poll_interval);
            if !state.running {
                break;
            }
            let now = Instant::now();
            for entry in state.in_flight.values_mut() {
                let elapsed = now.saturating_duration_since(entry.since);
                if !entry.warned && elapsed >= self.warn_after {
                    entry.warned = true;
                    let Some(module) = entry.module() else { continue };
                    tracing::warn!(
                        transaction = %self.name,
                        module = %module,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Module instantiation did not finish in time, possible deadlock"
                    );
                }
            }
        }
        tracing::trace!(transaction = %self.name, "Instantiation watchdog stopped");
    }
}

/// In-process [`DeadlockMonitor`] backed by a background thread that warns
/// about instantiations running longer than `warn_after`.
pub struct InstantiationWatchdog {
    shared: Arc<WatchdogShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for InstantiationWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("InstantiationWatchdog")
            .field("name", &self.shared.name)
            .field("running", &state.running)
            .field("in_flight", &state.in_flight.len())
            .field("warn_after", &self.shared.warn_after)
            .finish()
    }
}

impl InstantiationWatchdog {
    pub fn start(
        name: impl Into<String>,
        warn_after: Duration,
        poll_interval: Duration,
    ) -> Result<Self, ConfigError> {
        let shared = Arc::new(WatchdogShared {
            name: name.into(),
            warn_after,
            poll_interval,
            state: Mutex::new(WatchdogState {
                running: true,
                in_flight: HashMap::new(),
                waiting: HashMap::new(),
            }),
            wakeup: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(format!("watchdog-{}", shared.name))
            .spawn(move || worker_shared.run())
            .map_err(|e| {
                ConfigError::illegal_state(format!("cannot start instantiation watchdog: {e}"))
            })?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Instantiations that have been running for at least `warn_after` at `now`.
    pub fn stalled(&self, now: Instant) -> Vec<(ModuleIdentifier, Duration)> {
        let state = self.shared.state.lock();
        let mut out: Vec<_> = state
            .in_flight
            .values()
            .filter_map(|e| {
                let elapsed = now.saturating_duration_since(e.since);
                let module = e.module()?;
                (elapsed >= self.shared.warn_after).then(|| (module.clone(), elapsed))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Modules currently being instantiated, across all threads.
    pub fn in_flight(&self) -> Vec<ModuleIdentifier> {
        let state = self.shared.state.lock();
        let mut out: Vec<_> = state.in_flight.values().filter_map(|e| e.module().cloned()).collect();
        out.sort();
        out
    }

    /// Modules threads are currently blocked on.
    pub fn waiting(&self) -> Vec<ModuleIdentifier> {
        let state = self.shared.state.lock();
        let mut out: Vec<_> = state.waiting.values().cloned().collect();
        out.sort();
        out
    }

    /// Stops the background thread. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            state.in_flight.clear();
            state.waiting.clear();
        }
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!(transaction = %self.shared.name, "Instantiation watchdog panicked");
            }
        }
    }
}

impl DeadlockMonitor for InstantiationWatchdog {
    fn is_alive(&self) -> bool {
        self.shared.state.lock().running
    }

    fn set_currently_instantiating(&self, ctx: &InstantiationContext) {
        let thread = std::thread::current().id();
        let mut state = self.shared.state.lock();
        if ctx.chain().is_empty() {
            state.in_flight.remove(&thread);
            return;
        }
        state.in_flight.insert(
            thread,
            InFlight {
                chain: ctx.chain().to_vec(),
                since: Instant::now(),
                warned: false,
            },
        );
    }

    fn wait_for(&self, ctx: &InstantiationContext, module: &ModuleIdentifier) -> Result<(), ConfigError> {
        let thread = std::thread::current().id();
        let mut state = self.shared.state.lock();
        if !state.running {
            return Err(ConfigError::MonitorUnavailable(module.clone()));
        }
        state.waiting.insert(thread, module.clone());
        if let Some(path) = state.find_wait_cycle(thread, ctx.chain(), module) {
            state.waiting.remove(&thread);
            tracing::warn!(
                transaction = %self.shared.name,
                path = %format_chain(&path),
                "Cross-thread instantiation cycle detected"
            );
            return Err(ConfigError::InstantiationCycle { path });
        }
        Ok(())
    }

    fn stop_waiting(&self) {
        let thread = std::thread::current().id();
        self.shared.state.lock().waiting.remove(&thread);
    }
}

impl Drop for InstantiationWatchdog {
    fn drop(&mut self) {
        self.close();
    }
}
