//! Units shipped with the host.
//!
//! - `builtin.heartbeat` logs a tick every `interval_ms` until stopped. With
//!   `ticks` set it stops by itself after that many ticks.
//! - `builtin.host` accepts plugins, imports its `plugins` list while
//!   configuring and then idles until stopped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::ImportSpec;
use crate::error::{UnitError, UnitResult};
use crate::module::ModuleCatalog;
use crate::unit::{Unit, UnitConfig, UnitContext, UnitState};

pub const HEARTBEAT: &str = "builtin.heartbeat";
pub const HOST: &str = "builtin.host";

/// Catalog holding every built-in module.
pub fn catalog() -> ModuleCatalog {
    let catalog = ModuleCatalog::new();
    catalog
        .register_default::<Heartbeat>(HEARTBEAT)
        .register_default::<Host>(HOST);
    catalog
}

#[derive(Debug, Deserialize)]
struct HeartbeatSettings {
    #[serde(default = "default_interval_ms")]
    interval_ms: u64,
    #[serde(default)]
    ticks: Option<u64>,
}

fn default_interval_ms() -> u64 {
    1000
}

#[derive(Debug)]
pub struct Heartbeat {
    interval: Duration,
    limit: Option<u64>,
    count: AtomicU64,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(default_interval_ms()),
            limit: None,
            count: AtomicU64::new(0),
        }
    }
}

impl Heartbeat {
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Unit for Heartbeat {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    async fn configure(
        &mut self,
        _ctx: &UnitContext,
        config: &UnitConfig,
        state: UnitState,
    ) -> UnitResult<()> {
        let settings: HeartbeatSettings = config.parse()?;
        if settings.interval_ms == 0 {
            return Err(UnitError::InvalidConfig(
                "interval_ms must be positive".to_string(),
            ));
        }
        self.interval = Duration::from_millis(settings.interval_ms);
        self.limit = settings.ticks;
        // Carried over from the previous instance on reload.
        if let Some(ticks) = state.data.get("ticks").and_then(Value::as_u64) {
            self.count.store(ticks, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn start(&self, ctx: UnitContext) -> UnitResult<()> {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut emitted = 0;

        loop {
            tokio::select! {
                _ = ctx.shutdown().cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    let total = self.count.fetch_add(1, Ordering::SeqCst) + 1;
                    emitted += 1;
                    info!("{} tick {}", ctx.path(), total);
                    if self.limit.is_some_and(|limit| emitted >= limit) {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn stop(&self, _ctx: &UnitContext) -> UnitResult<UnitState> {
        Ok(UnitState::new(json!({ "ticks": self.count() })))
    }

    async fn propagate(&self, ctx: &UnitContext, command: &str, _data: &Value) -> UnitResult<()> {
        match command {
            "reset" => {
                self.count.store(0, Ordering::SeqCst);
                Ok(())
            }
            other => {
                debug!("{} ignores {:?}", ctx.path(), other);
                Ok(())
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct HostSettings {
    #[serde(default)]
    plugins: Vec<ImportSpec>,
}

/// A program that only exists to own plugins.
#[derive(Debug, Default)]
pub struct Host;

#[async_trait]
impl Unit for Host {
    fn name(&self) -> &'static str {
        "host"
    }

    fn accepts_plugins(&self) -> bool {
        true
    }

    async fn configure(
        &mut self,
        ctx: &UnitContext,
        config: &UnitConfig,
        mut state: UnitState,
    ) -> UnitResult<()> {
        let settings: HostSettings = config.parse()?;
        let plugins = ctx
            .plugins()
            .ok_or_else(|| UnitError::failed("host has no plugin registry"))?;

        for spec in settings.plugins {
            let id = spec.unit_id().to_string();
            let previous = state.plugins.remove(&id).unwrap_or_default();
            plugins
                .import_unit_with_state(&spec.module, &id, spec.config, previous)
                .await?;
        }
        Ok(())
    }

    async fn start(&self, ctx: UnitContext) -> UnitResult<()> {
        ctx.shutdown().cancelled().await;
        Ok(())
    }
}
