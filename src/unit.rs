use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::container::{Container, WeakContainer};
use crate::error::{UnitError, UnitResult};
use crate::event_bus::EventBus;
use crate::registry::UnitHandle;
use crate::scheduler::ShutdownSignal;

/// Which level of the tree a unit lives at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum UnitKind {
    /// Owned by the agent's root registry.
    Program,
    /// Owned by another unit's plugin registry.
    Plugin,
}

/// Opaque configuration handed through `import_unit` into `configure`.
///
/// The host never looks inside; units parse it into their own typed settings
/// with [`UnitConfig::parse`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitConfig(Value);

impl UnitConfig {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_inner(self) -> Value {
        self.0
    }

    /// Deserializes the configuration into the unit's own settings type.
    /// A missing (`null`) configuration parses as an empty object so that
    /// settings types made of defaulted fields accept it.
    pub fn parse<T: DeserializeOwned>(&self) -> UnitResult<T> {
        let value = match &self.0 {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        serde_json::from_value(value).map_err(|e| UnitError::InvalidConfig(e.to_string()))
    }
}

impl From<Value> for UnitConfig {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// State handed from an unloading instance to its replacement on reload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitState {
    #[serde(default)]
    pub data: Value,
    /// States returned by the unit's plugins, keyed by plugin id.
    #[serde(default)]
    pub plugins: BTreeMap<String, UnitState>,
}

impl UnitState {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            plugins: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_null() && self.plugins.is_empty()
    }

    pub fn plugin(&self, id: &str) -> Option<&UnitState> {
        self.plugins.get(id)
    }
}

/// Lifecycle contract shared by programs and plugins.
///
/// The owning container drives every transition:
///
/// 1. `configure` runs once while the unit is LOADING. A failure rolls the
///    registry entry back, including any plugins imported here.
/// 2. `start` is the unit's body and runs in its own task. It may loop until
///    [`UnitContext::shutdown`] fires or return immediately; returning ends
///    the unit's life and it is unloaded.
/// 3. `stop` runs after the task is terminal and after every plugin of the
///    unit has been unloaded. Its result is handed to the next instance on
///    reload.
#[async_trait]
pub trait Unit: Send + Sync {
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Units returning `true` get their own plugin registry through
    /// [`UnitContext::plugins`].
    fn accepts_plugins(&self) -> bool {
        false
    }

    async fn configure(
        &mut self,
        _ctx: &UnitContext,
        _config: &UnitConfig,
        _state: UnitState,
    ) -> UnitResult<()> {
        Ok(())
    }

    async fn start(&self, ctx: UnitContext) -> UnitResult<()>;

    async fn stop(&self, _ctx: &UnitContext) -> UnitResult<UnitState> {
        Ok(UnitState::default())
    }

    /// Receives commands broadcast with `Container::propagate`.
    async fn propagate(&self, _ctx: &UnitContext, _command: &str, _data: &Value) -> UnitResult<()> {
        Ok(())
    }
}

/// A unit's view of the host. Cheap to clone; every reference to a
/// container other than the unit's own plugin registry is non-owning.
#[derive(Clone)]
pub struct UnitContext {
    id: String,
    path: String,
    kind: UnitKind,
    shutdown: ShutdownSignal,
    plugins: Option<Container>,
    parent: WeakContainer,
    root: WeakContainer,
    events: Arc<EventBus>,
}

impl UnitContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: &str,
        path: &str,
        kind: UnitKind,
        shutdown: ShutdownSignal,
        plugins: Option<Container>,
        parent: WeakContainer,
        root: WeakContainer,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            id: id.to_string(),
            path: path.to_string(),
            kind,
            shutdown,
            plugins,
            parent,
            root,
            events,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    /// Fires when the owning container asks the unit to wind down.
    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// The unit's own plugin registry, present when the unit accepts plugins.
    pub fn plugins(&self) -> Option<&Container> {
        self.plugins.as_ref()
    }

    /// The registry this unit lives in.
    pub fn owner(&self) -> Option<Container> {
        self.parent.upgrade()
    }

    /// Another unit in the same registry.
    pub fn sibling(&self, id: &str) -> Option<UnitHandle> {
        self.parent.upgrade()?.lookup(id)
    }

    /// A unit in the registry one level above this unit's owner.
    pub fn uncle(&self, id: &str) -> Option<UnitHandle> {
        self.parent.upgrade()?.parent()?.lookup(id)
    }

    /// The agent's root registry of programs.
    pub fn agent(&self) -> Option<Container> {
        self.root.upgrade()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Runs blocking work on the blocking thread pool without stalling other
    /// units.
    pub async fn offload<F, T>(&self, work: F) -> UnitResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(work)
            .await
            .map_err(|e| UnitError::failed(format!("offloaded work of {} failed: {}", self.path, e)))
    }
}

impl std::fmt::Debug for UnitContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitContext")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("stopping", &self.is_stopping())
            .field("accepts_plugins", &self.plugins.is_some())
            .finish()
    }
}
