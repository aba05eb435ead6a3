//! Keyed store of the units owned by one container.
//!
//! Every mutation goes through a single `DashMap` entry operation so that two
//! racing imports of the same id cannot both succeed, and so that an entry is
//! never observed half-updated. No map reference is held across an `.await`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;

use crate::container::Container;
use crate::error::{Fault, LifecycleResult, RegistryError, RegistryResult};
use crate::scheduler::{TaskHandle, TaskOutcome};
use crate::unit::{Unit, UnitConfig, UnitContext, UnitKind, UnitState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
pub enum LifecycleState {
    Unloaded,
    Loading,
    Running,
    Stopping,
}

/// Outcome of a teardown, `None` until it finishes.
pub(crate) type StopResult = Option<LifecycleResult<UnitState>>;

/// Result of moving an entry to STOPPING.
pub(crate) enum StopTicket {
    /// The caller owns the teardown and publishes its result on the sender.
    Owner(Arc<watch::Sender<StopResult>>),
    /// Another teardown is in progress; its result arrives here.
    Wait(watch::Receiver<StopResult>),
}

pub(crate) struct RegistryEntry {
    kind: UnitKind,
    module_ref: String,
    config: UnitConfig,
    state: LifecycleState,
    /// Empty while LOADING: `configure` still owns the unit mutably.
    unit: Option<Arc<dyn Unit>>,
    context: UnitContext,
    task: Option<Arc<TaskHandle>>,
    fault: Option<Fault>,
    loaded_at: DateTime<Utc>,
    /// Filled by the owner of the teardown once the entry is gone.
    done: Arc<watch::Sender<StopResult>>,
}

impl RegistryEntry {
    pub(crate) fn loading(module_ref: &str, config: UnitConfig, context: UnitContext) -> Self {
        Self {
            kind: context.kind(),
            module_ref: module_ref.to_string(),
            config,
            state: LifecycleState::Loading,
            unit: None,
            context,
            task: None,
            fault: None,
            loaded_at: Utc::now(),
            done: Arc::new(watch::channel(None).0),
        }
    }

    fn is_terminal(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }

    fn snapshot(&self, id: &str) -> UnitHandle {
        UnitHandle {
            id: id.to_string(),
            path: self.context.path().to_string(),
            kind: self.kind,
            module_ref: self.module_ref.clone(),
            state: self.state,
            config: self.config.clone(),
            unit: self.unit.clone(),
            task: self.task.clone(),
            fault: self.fault.clone(),
            plugins: self.context.plugins().cloned(),
            loaded_at: self.loaded_at,
        }
    }
}

/// Point-in-time view of a registry entry.
///
/// The lifecycle state is a snapshot; whether the task is still alive is
/// read live from the scheduler's handle.
#[derive(Clone)]
pub struct UnitHandle {
    pub id: String,
    pub path: String,
    pub kind: UnitKind,
    pub module_ref: String,
    pub state: LifecycleState,
    pub config: UnitConfig,
    pub fault: Option<Fault>,
    pub loaded_at: DateTime<Utc>,
    unit: Option<Arc<dyn Unit>>,
    task: Option<Arc<TaskHandle>>,
    plugins: Option<Container>,
}

impl UnitHandle {
    /// True while the entry is RUNNING and its task has not terminated.
    pub fn is_running(&self) -> bool {
        self.state == LifecycleState::Running
            && self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn unit(&self) -> Option<&Arc<dyn Unit>> {
        self.unit.as_ref()
    }

    pub fn task(&self) -> Option<&Arc<TaskHandle>> {
        self.task.as_ref()
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.task.as_ref().and_then(|task| task.outcome())
    }

    /// The unit's own plugin registry, if it accepts plugins.
    pub fn plugins(&self) -> Option<&Container> {
        self.plugins.as_ref()
    }
}

impl std::fmt::Debug for UnitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitHandle")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("module_ref", &self.module_ref)
            .field("state", &self.state)
            .field("running", &self.is_running())
            .field("fault", &self.fault)
            .finish()
    }
}

#[derive(Clone, Default)]
pub struct PluginRegistry {
    entries: Arc<DashMap<String, RegistryEntry>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a LOADING entry. Fails without touching the map if the id is
    /// already taken, whatever state the existing entry is in.
    pub(crate) fn register(&self, id: &str, entry: RegistryEntry) -> RegistryResult<()> {
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateId {
                unit_id: id.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    /// LOADING -> RUNNING. `spawn` runs while the entry is locked so that an
    /// early exit of the task can only be observed once the entry is RUNNING.
    pub(crate) fn mark_running<S>(
        &self,
        id: &str,
        unit: Arc<dyn Unit>,
        spawn: S,
    ) -> RegistryResult<Arc<TaskHandle>>
    where
        S: FnOnce() -> Arc<TaskHandle>,
    {
        let mut entry = self.entries.get_mut(id).ok_or_else(|| RegistryError::NotFound {
            unit_id: id.to_string(),
        })?;
        if entry.state != LifecycleState::Loading {
            return Err(RegistryError::InvalidTransition {
                unit_id: id.to_string(),
                from: entry.state,
                to: LifecycleState::Running,
            });
        }
        let task = spawn();
        entry.unit = Some(unit);
        entry.task = Some(task.clone());
        entry.state = LifecycleState::Running;
        Ok(task)
    }

    /// RUNNING -> STOPPING. Only the first caller becomes the owner of the
    /// teardown; later callers get a receiver for its final state.
    pub(crate) fn mark_stopping(
        &self,
        id: &str,
        fault: Option<Fault>,
    ) -> RegistryResult<StopTicket> {
        let mut entry = self.entries.get_mut(id).ok_or_else(|| RegistryError::NotFound {
            unit_id: id.to_string(),
        })?;
        match entry.state {
            LifecycleState::Running => {
                entry.state = LifecycleState::Stopping;
                if entry.fault.is_none() {
                    entry.fault = fault;
                }
                Ok(StopTicket::Owner(entry.done.clone()))
            }
            LifecycleState::Stopping => Ok(StopTicket::Wait(entry.done.subscribe())),
            from => Err(RegistryError::InvalidTransition {
                unit_id: id.to_string(),
                from,
                to: LifecycleState::Stopping,
            }),
        }
    }

    pub(crate) fn record_fault(&self, id: &str, fault: Fault) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.fault = Some(fault);
        }
    }

    /// Removes an entry whose task is terminal, or which never got one.
    pub(crate) fn deregister(&self, id: &str) -> RegistryResult<()> {
        if self
            .entries
            .remove_if(id, |_, entry| entry.is_terminal())
            .is_some()
        {
            return Ok(());
        }
        if self.entries.contains_key(id) {
            Err(RegistryError::StillRunning {
                unit_id: id.to_string(),
            })
        } else {
            Err(RegistryError::NotFound {
                unit_id: id.to_string(),
            })
        }
    }

    pub fn state(&self, id: &str) -> Option<LifecycleState> {
        self.entries.get(id).map(|entry| entry.state)
    }

    pub(crate) fn context(&self, id: &str) -> Option<UnitContext> {
        self.entries.get(id).map(|entry| entry.context.clone())
    }

    pub fn lookup(&self, id: &str) -> Option<UnitHandle> {
        self.entries.get(id).map(|entry| entry.snapshot(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Snapshot of every entry, ordered by id. Entries removed while the
    /// snapshot is taken are skipped.
    pub fn list(&self) -> Vec<UnitHandle> {
        let mut ids = self.ids();
        ids.sort();
        ids.iter().filter_map(|id| self.lookup(id)).collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
