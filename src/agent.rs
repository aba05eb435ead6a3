use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::{AgentConfig, ImportSpec};
use crate::container::{Container, ContainerSettings, FaultRecord};
use crate::error::{AgentError, AgentResult, LifecycleResult};
use crate::event_bus::{EventBus, EventReceiver, LifecycleEvent, LifecycleEventType};
use crate::module::ModuleResolver;
use crate::registry::UnitHandle;
use crate::scheduler::{shutdown_channel, RunControl, Scheduler, ShutdownSignal, ShutdownTrigger};
use crate::unit::{UnitConfig, UnitState};

/// The process-wide root container.
///
/// ```no_run
/// # use dogma::{builtin, Agent, UnitConfig};
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let agent = Agent::new(builtin::catalog());
/// agent
///     .import_unit("builtin.heartbeat", "tick", UnitConfig::default())
///     .await?;
/// agent.init().await?;
/// # Ok(())
/// # }
/// ```
pub struct Agent {
    config: AgentConfig,
    root: Container,
    scheduler: Scheduler,
    events: Arc<EventBus>,
    shutdown_tx: ShutdownTrigger,
    shutdown_rx: ShutdownSignal,
    fatal_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl Agent {
    pub fn new<R: ModuleResolver + 'static>(resolver: R) -> Self {
        Self::with_config(resolver, AgentConfig::default())
    }

    pub fn with_config<R: ModuleResolver + 'static>(resolver: R, config: AgentConfig) -> Self {
        let scheduler = Scheduler::new();
        let events = Arc::new(EventBus::new(config.event_buffer_size));
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let root = Container::new_root(
            Arc::new(resolver),
            scheduler.clone(),
            events.clone(),
            ContainerSettings::from(&config),
            fatal_tx,
        );
        let (shutdown_tx, shutdown_rx) = shutdown_channel();

        Self {
            config,
            root,
            scheduler,
            events,
            shutdown_tx,
            shutdown_rx,
            fatal_rx: Mutex::new(Some(fatal_rx)),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// The root registry of programs.
    pub fn programs(&self) -> &Container {
        &self.root
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub async fn import_unit(
        &self,
        module_ref: &str,
        id: &str,
        config: UnitConfig,
    ) -> LifecycleResult<()> {
        self.root.import_unit(module_ref, id, config).await
    }

    pub async fn import_list(&self, specs: &[ImportSpec]) -> LifecycleResult<usize> {
        self.root.import_list(specs).await
    }

    pub async fn unload_unit(&self, id: &str) -> LifecycleResult<UnitState> {
        self.root.unload_unit(id).await
    }

    pub async fn unload_unit_with_grace(
        &self,
        id: &str,
        grace: Duration,
    ) -> LifecycleResult<UnitState> {
        self.root.unload_unit_with_grace(id, grace).await
    }

    pub async fn reload_unit(&self, id: &str, config: Option<UnitConfig>) -> LifecycleResult<()> {
        self.root.reload_unit(id, config).await
    }

    pub async fn propagate(&self, command: &str, data: &Value) -> usize {
        self.root.propagate(command, data).await
    }

    pub fn lookup(&self, id: &str) -> Option<UnitHandle> {
        self.root.lookup(id)
    }

    pub fn list(&self) -> Vec<UnitHandle> {
        self.root.list()
    }

    pub fn faults(&self) -> Vec<FaultRecord> {
        self.root.faults()
    }

    /// Asks `init()` to unload every program and return. Safe to call from
    /// any task, before or during `init()`.
    pub fn shutdown(&self) {
        if self.shutdown_tx.is_fired() {
            return;
        }
        info!("Agent shutdown requested");
        self.events
            .publish(LifecycleEvent::agent(LifecycleEventType::AgentStopping));
        self.shutdown_tx.fire();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_rx.is_cancelled()
    }

    /// Runs the scheduler until shutdown, until the root registry is empty
    /// (when `exit_when_idle` is set), or until a fatal root fault. Can only
    /// be called once.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn init(&self) -> AgentResult<()> {
        let fatal = self
            .fatal_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(AgentError::AlreadyStarted)?;

        info!("Agent started with {} programs", self.root.len());
        self.events
            .publish(LifecycleEvent::agent(LifecycleEventType::AgentStarted));

        let result = self
            .scheduler
            .run_forever(
                &self.root,
                RunControl {
                    shutdown: self.shutdown_rx.clone(),
                    fatal,
                    exit_when_idle: self.config.exit_when_idle,
                },
            )
            .await;

        self.events.publish(
            LifecycleEvent::agent(LifecycleEventType::AgentStopped)
                .with_detail(match &result {
                    Ok(()) => "clean".to_string(),
                    Err(e) => e.to_string(),
                }),
        );
        info!("Agent stopped");
        result
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("programs", &self.root)
            .field("live_tasks", &self.scheduler.live_tasks())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
