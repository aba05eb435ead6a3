#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dogma::{ModuleCatalog, Unit, UnitConfig, UnitContext, UnitError, UnitResult, UnitState};
use serde_json::{json, Value};
use tokio::time::{sleep, timeout, Instant};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[ctor::ctor]
fn init_tests() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

pub type Log = Arc<Mutex<Vec<String>>>;

pub fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub fn position(log: &[String], entry: &str) -> usize {
    log.iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("{:?} not in {:?}", entry, log))
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        sleep(Duration::from_millis(5)).await;
    }
}

pub async fn within<F: Future>(limit: Duration, future: F) -> F::Output {
    timeout(limit, future).await.expect("timed out")
}

/// Runs until asked to stop.
#[derive(Default)]
pub struct Idle;

#[async_trait]
impl Unit for Idle {
    async fn start(&self, ctx: UnitContext) -> UnitResult<()> {
        ctx.shutdown().cancelled().await;
        Ok(())
    }
}

/// Never looks at its stop signal.
#[derive(Default)]
pub struct Stubborn;

#[async_trait]
impl Unit for Stubborn {
    async fn start(&self, _ctx: UnitContext) -> UnitResult<()> {
        loop {
            sleep(Duration::from_millis(10)).await;
        }
    }
}

#[derive(Default)]
pub struct Crashing;

#[async_trait]
impl Unit for Crashing {
    async fn start(&self, _ctx: UnitContext) -> UnitResult<()> {
        sleep(Duration::from_millis(10)).await;
        Err(UnitError::failed("boom"))
    }
}

#[derive(Default)]
pub struct Panicking;

#[async_trait]
impl Unit for Panicking {
    async fn start(&self, _ctx: UnitContext) -> UnitResult<()> {
        sleep(Duration::from_millis(10)).await;
        panic!("lost invariant");
    }
}

#[derive(Default)]
pub struct BadConfig;

#[async_trait]
impl Unit for BadConfig {
    async fn configure(
        &mut self,
        _ctx: &UnitContext,
        _config: &UnitConfig,
        _state: UnitState,
    ) -> UnitResult<()> {
        Err(UnitError::InvalidConfig("port is required".to_string()))
    }

    async fn start(&self, _ctx: UnitContext) -> UnitResult<()> {
        Ok(())
    }
}

/// Logs `start:`, `exit:` and `stop:` entries with its path, and echoes the
/// `generation` found in its previous state.
pub struct Recorder {
    log: Log,
    pluggable: bool,
    generation: u64,
}

impl Recorder {
    pub fn new(log: Log, pluggable: bool) -> Self {
        Self {
            log,
            pluggable,
            generation: 0,
        }
    }

    fn push(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl Unit for Recorder {
    fn accepts_plugins(&self) -> bool {
        self.pluggable
    }

    async fn configure(
        &mut self,
        ctx: &UnitContext,
        _config: &UnitConfig,
        state: UnitState,
    ) -> UnitResult<()> {
        self.generation = state.data["generation"].as_u64().unwrap_or(0) + 1;
        self.push(format!("configure:{}:{}", ctx.path(), self.generation));
        Ok(())
    }

    async fn start(&self, ctx: UnitContext) -> UnitResult<()> {
        self.push(format!("start:{}", ctx.path()));
        ctx.shutdown().cancelled().await;
        self.push(format!("exit:{}", ctx.path()));
        Ok(())
    }

    async fn stop(&self, ctx: &UnitContext) -> UnitResult<UnitState> {
        // Every plugin must already be gone.
        let remaining = ctx.plugins().map_or(0, |plugins| plugins.len());
        self.push(format!("stop:{}:{}", ctx.path(), remaining));
        Ok(UnitState::new(json!({ "generation": self.generation })))
    }
}

/// Answers the `probe` command by logging what it can see around it.
pub struct Probe {
    log: Log,
}

#[async_trait]
impl Unit for Probe {
    async fn start(&self, ctx: UnitContext) -> UnitResult<()> {
        ctx.shutdown().cancelled().await;
        Ok(())
    }

    async fn propagate(&self, ctx: &UnitContext, command: &str, _data: &Value) -> UnitResult<()> {
        if command == "probe" {
            let entry = format!(
                "sibling={} uncle={} not_uncle={} agent={}",
                ctx.sibling("peer").is_some(),
                ctx.uncle("p2").is_some(),
                ctx.uncle("peer").is_some(),
                ctx.agent().map_or(0, |root| root.len()),
            );
            self.log.lock().unwrap().push(entry);
        }
        Ok(())
    }
}

/// Removes itself from its own registry shortly after starting.
#[derive(Default)]
pub struct SelfUnload;

#[async_trait]
impl Unit for SelfUnload {
    async fn start(&self, ctx: UnitContext) -> UnitResult<()> {
        sleep(Duration::from_millis(10)).await;
        let owner = ctx
            .owner()
            .ok_or_else(|| UnitError::failed("registry is gone"))?;
        owner
            .unload_unit(ctx.id())
            .await
            .map_err(|e| UnitError::failed(e.to_string()))?;
        Ok(())
    }
}

/// Imports an idle `kid` plugin, then fails with "crash".
#[derive(Default)]
pub struct CrashingHost;

#[async_trait]
impl Unit for CrashingHost {
    fn accepts_plugins(&self) -> bool {
        true
    }

    async fn configure(
        &mut self,
        ctx: &UnitContext,
        _config: &UnitConfig,
        _state: UnitState,
    ) -> UnitResult<()> {
        let plugins = ctx
            .plugins()
            .ok_or_else(|| UnitError::failed("no plugin registry"))?;
        plugins
            .import_unit("test.idle", "kid", UnitConfig::default())
            .await
            .map_err(|e| UnitError::failed(e.to_string()))
    }

    async fn start(&self, _ctx: UnitContext) -> UnitResult<()> {
        sleep(Duration::from_millis(50)).await;
        Err(UnitError::failed("crash"))
    }
}

/// Takes 100ms to configure; rejects `{"fail": true}` after the delay.
#[derive(Default)]
pub struct SlowConfig;

#[async_trait]
impl Unit for SlowConfig {
    async fn configure(
        &mut self,
        _ctx: &UnitContext,
        config: &UnitConfig,
        _state: UnitState,
    ) -> UnitResult<()> {
        sleep(Duration::from_millis(100)).await;
        if config.as_value()["fail"] == json!(true) {
            return Err(UnitError::InvalidConfig("fail is set".to_string()));
        }
        Ok(())
    }

    async fn start(&self, ctx: UnitContext) -> UnitResult<()> {
        ctx.shutdown().cancelled().await;
        Ok(())
    }
}

pub fn catalog(log: &Log) -> ModuleCatalog {
    let catalog = ModuleCatalog::new();
    catalog
        .register_default::<Idle>("test.idle")
        .register_default::<Stubborn>("test.stubborn")
        .register_default::<Crashing>("test.crashing")
        .register_default::<Panicking>("test.panicking")
        .register_default::<BadConfig>("test.bad_config")
        .register_default::<SelfUnload>("test.self_unload")
        .register_default::<CrashingHost>("test.crashing_host")
        .register_default::<SlowConfig>("test.slow_config");

    let shared = log.clone();
    catalog.register("test.recorder", move || {
        Box::new(Recorder::new(shared.clone(), false))
    });
    let shared = log.clone();
    catalog.register("test.host", move || Box::new(Recorder::new(shared.clone(), true)));
    let shared = log.clone();
    catalog.register("test.probe", move || {
        Box::new(Probe {
            log: shared.clone(),
        })
    });
    catalog
}
