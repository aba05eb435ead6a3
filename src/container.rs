//! # Containers
//!
//! A [`Container`] is one level of the unit tree: the agent's root registry of
//! programs, or the plugin registry of a single pluggable unit. Every level
//! runs the same code.
//!
//! ```text
//! root ("")
//!  ├── p1            Program
//!  │    └── p1/child Plugin   (in p1's own container)
//!  └── p2            Program
//! ```
//!
//! Ownership only points downward: a container owns its entries, an entry owns
//! its unit's plugin container. Back references (parent, root) are weak.
//!
//! Unloading is post-order. A unit's plugins are unloaded, and their tasks are
//! terminal, before the unit itself is cancelled and its `stop` hook runs.

use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_recursion::async_recursion;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::{AgentConfig, ImportSpec};
use crate::error::{Fault, ImportError, LifecycleError, LifecycleResult, RegistryError};
use crate::event_bus::{EventBus, LifecycleEvent, LifecycleEventType};
use crate::module::ModuleResolver;
use crate::registry::{LifecycleState, PluginRegistry, RegistryEntry, StopTicket, UnitHandle};
use crate::scheduler::{self, panic_message, shutdown_channel, Scheduler, TaskOutcome};
use crate::unit::{Unit, UnitConfig, UnitContext, UnitKind, UnitState};

#[derive(Debug, Clone)]
pub struct ContainerSettings {
    /// Default time a unit gets to honour a stop request.
    pub grace_period: Duration,
    /// Number of fault records kept per container.
    pub fault_history: usize,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_millis(5000),
            fault_history: 64,
        }
    }
}

impl From<&AgentConfig> for ContainerSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            grace_period: config.grace_period,
            fault_history: config.fault_history,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaultRecord {
    pub unit_id: String,
    pub path: String,
    pub fault: Fault,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Someone called `unload_unit`.
    Unload,
    /// The unit's task ended on its own.
    Exit,
}

struct ContainerInner {
    path: String,
    kind: UnitKind,
    registry: PluginRegistry,
    scheduler: Scheduler,
    resolver: Arc<dyn ModuleResolver>,
    events: Arc<EventBus>,
    settings: ContainerSettings,
    parent: WeakContainer,
    root: WeakContainer,
    faults: Mutex<VecDeque<FaultRecord>>,
    pending: AtomicUsize,
    changes: watch::Sender<u64>,
    /// Only the root container can escalate to the agent.
    fatal: Option<mpsc::UnboundedSender<String>>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

/// Non-owning reference to a container.
#[derive(Clone, Default)]
pub struct WeakContainer(Weak<ContainerInner>);

impl WeakContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upgrade(&self) -> Option<Container> {
        self.0.upgrade().map(|inner| Container { inner })
    }
}

impl std::fmt::Debug for WeakContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("WeakContainer")
            .field(&self.upgrade().map(|c| c.path().to_string()))
            .finish()
    }
}

/// Counts an import in flight for the lifetime of the guard.
struct PendingGuard<'a>(&'a Container);

impl<'a> PendingGuard<'a> {
    fn new(container: &'a Container) -> Self {
        container.inner.pending.fetch_add(1, Ordering::SeqCst);
        Self(container)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.inner.pending.fetch_sub(1, Ordering::SeqCst);
        self.0.notify();
    }
}

fn validate_id(id: &str) -> Result<(), ImportError> {
    let reason = if id.is_empty() {
        "must not be empty"
    } else if id.contains('/') {
        "must not contain '/'"
    } else {
        return Ok(());
    };
    Err(ImportError::InvalidId {
        unit_id: id.to_string(),
        reason: reason.to_string(),
    })
}

impl Container {
    /// Creates the root registry of programs. Faults that break a root
    /// registry invariant are sent to `fatal`.
    pub fn new_root(
        resolver: Arc<dyn ModuleResolver>,
        scheduler: Scheduler,
        events: Arc<EventBus>,
        settings: ContainerSettings,
        fatal: mpsc::UnboundedSender<String>,
    ) -> Self {
        let inner = Arc::new_cyclic(|root| ContainerInner {
            path: String::new(),
            kind: UnitKind::Program,
            registry: PluginRegistry::new(),
            scheduler,
            resolver,
            events,
            settings,
            parent: WeakContainer::new(),
            root: WeakContainer(root.clone()),
            faults: Mutex::new(VecDeque::new()),
            pending: AtomicUsize::new(0),
            changes: watch::channel(0).0,
            fatal: Some(fatal),
            closed: AtomicBool::new(false),
        });
        Self { inner }
    }

    /// Plugin registry for the unit living at `path` in this container.
    fn nested(&self, path: &str) -> Self {
        let inner = Arc::new(ContainerInner {
            path: path.to_string(),
            kind: UnitKind::Plugin,
            registry: PluginRegistry::new(),
            scheduler: self.inner.scheduler.clone(),
            resolver: self.inner.resolver.clone(),
            events: self.inner.events.clone(),
            settings: self.inner.settings.clone(),
            parent: self.downgrade(),
            root: self.inner.root.clone(),
            faults: Mutex::new(VecDeque::new()),
            pending: AtomicUsize::new(0),
            changes: watch::channel(0).0,
            fatal: None,
            closed: AtomicBool::new(false),
        });
        Self { inner }
    }

    pub fn downgrade(&self) -> WeakContainer {
        WeakContainer(Arc::downgrade(&self.inner))
    }

    /// Path of the unit owning this container, empty at the root.
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Kind of the units this container holds.
    pub fn kind(&self) -> UnitKind {
        self.inner.kind
    }

    pub fn is_root(&self) -> bool {
        self.inner.fatal.is_some()
    }

    /// The container one level up, if any.
    pub fn parent(&self) -> Option<Container> {
        self.inner.parent.upgrade()
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.inner.settings
    }

    fn child_path(&self, id: &str) -> String {
        if self.inner.path.is_empty() {
            id.to_string()
        } else {
            format!("{}/{}", self.inner.path, id)
        }
    }

    pub async fn import_unit(
        &self,
        module_ref: &str,
        id: &str,
        config: UnitConfig,
    ) -> LifecycleResult<()> {
        self.import_unit_with_state(module_ref, id, config, UnitState::default())
            .await
    }

    /// Resolves, registers, configures and spawns a unit. On any failure the
    /// registry is left exactly as it was.
    #[tracing::instrument(skip(self, config, state), fields(container = %self.inner.path), level = "debug")]
    pub async fn import_unit_with_state(
        &self,
        module_ref: &str,
        id: &str,
        config: UnitConfig,
        state: UnitState,
    ) -> LifecycleResult<()> {
        validate_id(id)?;
        // Must be counted before the closed check; `unload_all` closes first
        // and then waits for pending imports.
        let _pending = PendingGuard::new(self);
        if self.is_closed() {
            return Err(LifecycleError::ContainerClosed {
                path: self.inner.path.clone(),
            });
        }

        let mut unit = self.inner.resolver.resolve(module_ref)?;
        let path = self.child_path(id);
        let (trigger, signal) = shutdown_channel();
        let plugins = unit.accepts_plugins().then(|| self.nested(&path));
        let ctx = UnitContext::new(
            id,
            &path,
            self.inner.kind,
            signal,
            plugins.clone(),
            self.downgrade(),
            self.inner.root.clone(),
            self.inner.events.clone(),
        );

        self.inner
            .registry
            .register(id, RegistryEntry::loading(module_ref, config.clone(), ctx.clone()))?;
        self.notify();
        self.publish(
            LifecycleEvent::new(LifecycleEventType::UnitLoading, &path)
                .with_kind(self.inner.kind)
                .with_detail(module_ref),
        );

        let configured = AssertUnwindSafe(unit.configure(&ctx, &config, state))
            .catch_unwind()
            .await;
        let failure = match configured {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(payload) => Some(format!("panicked: {}", panic_message(payload.as_ref()))),
        };
        if let Some(message) = failure {
            warn!("Failed to configure {} ({}): {}", path, module_ref, message);
            if let Some(plugins) = &plugins {
                plugins.unload_all().await;
            }
            if let Err(e) = self.inner.registry.deregister(id) {
                self.escalate(format!("rollback of {} failed: {}", path, e));
            }
            self.notify();
            self.publish(
                LifecycleEvent::new(LifecycleEventType::UnitUnloaded, &path)
                    .with_kind(self.inner.kind)
                    .with_detail(message.clone()),
            );
            return Err(ImportError::Configure {
                unit_id: id.to_string(),
                message,
            }
            .into());
        }

        let unit: Arc<dyn Unit> = Arc::from(unit);
        let name = unit.name();
        let body_unit = unit.clone();
        let body_ctx = ctx.clone();
        let owner = self.downgrade();
        let exit_id = id.to_string();
        self.inner.registry.mark_running(id, unit, || {
            self.publish(
                LifecycleEvent::new(LifecycleEventType::UnitStarted, &path)
                    .with_kind(self.inner.kind),
            );
            self.inner.scheduler.spawn(
                &path,
                trigger,
                async move { body_unit.start(body_ctx).await },
                move |outcome| {
                    if let Some(container) = owner.upgrade() {
                        tokio::spawn(container.reap(exit_id, outcome));
                    }
                },
            )
        })?;

        info!("Started {} {} ({})", self.inner.kind, path, name);
        self.notify();
        Ok(())
    }

    /// Imports `specs` in order and stops at the first failure. Returns the
    /// number of units imported.
    pub async fn import_list(&self, specs: &[ImportSpec]) -> LifecycleResult<usize> {
        for spec in specs {
            self.import_unit(&spec.module, spec.unit_id(), spec.config.clone())
                .await?;
        }
        Ok(specs.len())
    }

    pub async fn unload_unit(&self, id: &str) -> LifecycleResult<UnitState> {
        self.unload_unit_with_grace(id, self.inner.settings.grace_period)
            .await
    }

    /// Stops and removes a unit and, first, every plugin beneath it. Returns
    /// the state the unit handed back from `stop`.
    ///
    /// A unit still LOADING is waited for first; if its import fails the
    /// result is `NotFound`. Concurrent callers all receive the same result.
    ///
    /// The teardown runs in its own task so that it completes even when the
    /// caller is itself a unit being cancelled. A caller running inside a unit
    /// task stops waiting once its own stop is requested and gets an empty
    /// state; this is what lets a unit unload itself, or its own parent,
    /// without sitting out the grace period.
    #[tracing::instrument(skip(self), fields(container = %self.inner.path), level = "debug")]
    pub async fn unload_unit_with_grace(
        &self,
        id: &str,
        grace: Duration,
    ) -> LifecycleResult<UnitState> {
        let teardown = Container::teardown(self.clone(), id.to_string(), grace, Origin::Unload, None);
        let mut join = tokio::spawn(teardown);
        let interrupted = |e: tokio::task::JoinError| LifecycleError::Interrupted {
            unit_id: id.to_string(),
            message: e.to_string(),
        };
        match scheduler::current_stop_signal() {
            Some(stop) => tokio::select! {
                result = &mut join => result.map_err(interrupted)?,
                _ = stop.cancelled() => {
                    debug!("caller of unload {} is stopping, not waiting", id);
                    Ok(UnitState::default())
                }
            },
            None => join.await.map_err(interrupted)?,
        }
    }

    /// Unloads the unit and imports the same module under the same id, handing
    /// over the state the old instance returned.
    #[tracing::instrument(skip(self, config), fields(container = %self.inner.path), level = "debug")]
    pub async fn reload_unit(&self, id: &str, config: Option<UnitConfig>) -> LifecycleResult<()> {
        let previous = self.lookup(id).ok_or_else(|| RegistryError::NotFound {
            unit_id: id.to_string(),
        })?;
        let state = self.unload_unit(id).await?;
        let config = config.unwrap_or(previous.config);
        info!("Reloading {} from {}", previous.path, previous.module_ref);
        self.import_unit_with_state(&previous.module_ref, id, config, state)
            .await
    }

    /// Closes the container to new imports and unloads everything in it.
    /// Returns the collected states keyed by unit id.
    pub async fn unload_all(&self) -> BTreeMap<String, UnitState> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.wait_until(|c| c.inner.pending.load(Ordering::SeqCst) == 0)
            .await;

        let ids = self.inner.registry.ids();
        let results = join_all(ids.iter().map(|id| self.unload_unit(id))).await;

        let mut states = BTreeMap::new();
        for (id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(state) => {
                    states.insert(id, state);
                }
                Err(e) => warn!("Failed to unload {}: {}", self.child_path(&id), e),
            }
        }
        states
    }

    #[async_recursion]
    async fn teardown(
        container: Container,
        id: String,
        grace: Duration,
        origin: Origin,
        fault: Option<Fault>,
    ) -> LifecycleResult<UnitState> {
        let registry = &container.inner.registry;
        let ticket = loop {
            match registry.mark_stopping(&id, fault.clone()) {
                Err(RegistryError::InvalidTransition {
                    from: LifecycleState::Loading,
                    ..
                }) if origin == Origin::Unload => {
                    debug!("{} is still loading, waiting", id);
                    container
                        .wait_until(|c| c.inner.registry.state(&id) != Some(LifecycleState::Loading))
                        .await;
                }
                other => break other?,
            }
        };
        match ticket {
            StopTicket::Owner(done) => {
                let result = Container::stop_owned(&container, &id, grace, fault).await;
                done.send_replace(Some(result.clone()));
                if result.is_ok() {
                    container.notify();
                }
                result
            }
            StopTicket::Wait(_) if origin == Origin::Exit => Ok(UnitState::default()),
            StopTicket::Wait(mut rx) => {
                debug!("{} is already stopping, waiting", id);
                match rx.wait_for(Option::is_some).await {
                    Ok(result) => result.clone().unwrap_or_else(|| Ok(UnitState::default())),
                    Err(_) => Ok(UnitState::default()),
                }
            }
        }
    }

    /// Runs the teardown of an entry this caller moved to STOPPING.
    async fn stop_owned(
        container: &Container,
        id: &str,
        grace: Duration,
        fault: Option<Fault>,
    ) -> LifecycleResult<UnitState> {
        let registry = &container.inner.registry;
        let (Some(handle), Some(ctx)) = (registry.lookup(id), registry.context(id)) else {
            return Err(RegistryError::NotFound {
                unit_id: id.to_string(),
            }
            .into());
        };
        let path = handle.path.clone();
        info!("Stopping {} {}", handle.kind, path);
        container.publish(
            LifecycleEvent::new(LifecycleEventType::UnitStopping, &path).with_kind(handle.kind),
        );

        let plugin_states = match ctx.plugins() {
            Some(plugins) => plugins.unload_all().await,
            None => BTreeMap::new(),
        };

        let outcome = match handle.task() {
            Some(task) => container.inner.scheduler.cancel(task, grace).await,
            None => TaskOutcome::Completed,
        };
        if let Some(fault) = fault.or_else(|| outcome.to_fault(id)) {
            container.record_fault(id, &path, fault);
        }

        let mut state = match handle.unit() {
            Some(unit) => match AssertUnwindSafe(unit.stop(&ctx)).catch_unwind().await {
                Ok(Ok(state)) => state,
                Ok(Err(e)) => {
                    warn!("stop hook of {} failed: {}", path, e);
                    UnitState::default()
                }
                Err(payload) => {
                    warn!(
                        "stop hook of {} panicked: {}",
                        path,
                        panic_message(payload.as_ref())
                    );
                    UnitState::default()
                }
            },
            None => UnitState::default(),
        };
        state.plugins.extend(plugin_states);

        if let Err(e) = registry.deregister(id) {
            container.escalate(format!("deregister of {} failed: {}", path, e));
            return Err(e.into());
        }
        container.publish(
            LifecycleEvent::new(LifecycleEventType::UnitUnloaded, &path).with_kind(handle.kind),
        );
        info!("Unloaded {} {}", handle.kind, path);
        Ok(state)
    }

    /// Removes a unit whose task ended without being asked to.
    async fn reap(self, id: String, outcome: TaskOutcome) {
        let fault = outcome.to_fault(&id);
        match &fault {
            Some(fault) => warn!("{}", fault),
            None => debug!("{} finished", self.child_path(&id)),
        }
        let grace = self.inner.settings.grace_period;
        if let Err(e) = Container::teardown(self, id, grace, Origin::Exit, fault).await {
            warn!("Failed to reap unit: {}", e);
        }
    }

    /// Delivers `command` to every running unit in this container and,
    /// recursively, to their plugins. Returns how many units accepted it.
    #[async_recursion]
    pub async fn propagate(&self, command: &str, data: &Value) -> usize {
        let mut delivered = 0;
        for handle in self.list() {
            if !handle.is_running() {
                continue;
            }
            let (Some(unit), Some(ctx)) = (handle.unit(), self.inner.registry.context(&handle.id))
            else {
                continue;
            };
            match AssertUnwindSafe(unit.propagate(&ctx, command, data))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!("{} rejected {:?}: {}", handle.path, command, e),
                Err(payload) => warn!(
                    "{} panicked on {:?}: {}",
                    handle.path,
                    command,
                    panic_message(payload.as_ref())
                ),
            }
            if let Some(plugins) = handle.plugins() {
                delivered += plugins.propagate(command, data).await;
            }
        }
        delivered
    }

    pub fn lookup(&self, id: &str) -> Option<UnitHandle> {
        self.inner.registry.lookup(id)
    }

    pub fn list(&self) -> Vec<UnitHandle> {
        self.inner.registry.list()
    }

    pub fn len(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.registry.is_empty()
    }

    /// Empty and with no import in flight.
    pub fn is_idle(&self) -> bool {
        self.is_empty() && self.inner.pending.load(Ordering::SeqCst) == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Most recent faults recorded in this container, oldest first.
    pub fn faults(&self) -> Vec<FaultRecord> {
        self.lock_faults().iter().cloned().collect()
    }

    /// Ticks on every registry change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    fn lock_faults(&self) -> std::sync::MutexGuard<'_, VecDeque<FaultRecord>> {
        self.inner
            .faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_fault(&self, id: &str, path: &str, fault: Fault) {
        warn!("Fault in {}: {}", path, fault);
        self.inner.registry.record_fault(id, fault.clone());
        self.publish(
            LifecycleEvent::new(LifecycleEventType::UnitFaulted, path)
                .with_kind(self.inner.kind)
                .with_detail(fault.to_string()),
        );
        let mut faults = self.lock_faults();
        faults.push_back(FaultRecord {
            unit_id: id.to_string(),
            path: path.to_string(),
            fault,
            at: Utc::now(),
        });
        while faults.len() > self.inner.settings.fault_history {
            faults.pop_front();
        }
    }

    fn escalate(&self, message: String) {
        match &self.inner.fatal {
            Some(fatal) => {
                error!("Fatal fault at the root: {}", message);
                let _ = fatal.send(message);
            }
            None => error!("Registry invariant broken in {:?}: {}", self.inner.path, message),
        }
    }

    fn publish(&self, event: LifecycleEvent) {
        self.inner.events.publish(event);
    }

    fn notify(&self) {
        self.inner.changes.send_modify(|tick| *tick = tick.wrapping_add(1));
    }

    async fn wait_until<F>(&self, done: F)
    where
        F: Fn(&Container) -> bool,
    {
        let mut changes = self.changes();
        while !done(self) {
            if changes.changed().await.is_err() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("path", &self.inner.path)
            .field("kind", &self.inner.kind)
            .field("units", &self.inner.registry.ids())
            .field("closed", &self.is_closed())
            .finish()
    }
}
