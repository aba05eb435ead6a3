//! # Cooperative task runtime
//!
//! Every running unit body lives in its own tokio task. Tasks only yield at
//! `.await` points, so a unit blocked on I/O never stalls its neighbours.
//!
//! Stopping a task is cooperative first: [`Scheduler::cancel`] fires the
//! task's [`ShutdownSignal`] and waits for the body to return. A body that is
//! still alive once the grace period has elapsed is aborted and its outcome is
//! recorded as [`TaskOutcome::Forced`].
//!
//! ```text
//!  spawn ──▶ running ──▶ Completed | Failed | Panicked     (body returned)
//!               │
//!            cancel ──▶ grace period ──▶ Forced             (body ignored the signal)
//! ```

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::container::Container;
use crate::error::{AgentError, AgentResult, Fault, UnitResult};

/// Upper bound for waiting on an aborted task to unwind.
const ABORT_SETTLE: Duration = Duration::from_millis(250);

tokio::task_local! {
    static CURRENT_TASK: TaskScope;
}

/// Identity of the unit task the current code runs in.
#[derive(Debug, Clone)]
struct TaskScope {
    id: Uuid,
    stop: ShutdownSignal,
}

/// Id of the unit task running the caller, if any.
pub fn current_task() -> Option<Uuid> {
    CURRENT_TASK.try_with(|scope| scope.id).ok()
}

/// Stop signal of the unit task running the caller, if any.
pub fn current_stop_signal() -> Option<ShutdownSignal> {
    CURRENT_TASK.try_with(|scope| scope.stop.clone()).ok()
}

/// Creates a linked trigger/signal pair.
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger(tx), ShutdownSignal(rx))
}

#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

impl ShutdownTrigger {
    pub fn fire(&self) {
        self.0.send_replace(true);
    }

    pub fn is_fired(&self) -> bool {
        *self.0.borrow()
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal(self.0.subscribe())
    }
}

/// Observed by a unit body at its own suspension points.
#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown has been requested, or once the trigger is gone.
    pub async fn cancelled(&self) {
        let mut rx = self.0.clone();
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

/// Terminal result of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed(String),
    Panicked(String),
    Forced { grace: Duration },
}

impl TaskOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, TaskOutcome::Completed)
    }

    pub fn to_fault(&self, unit_id: &str) -> Option<Fault> {
        match self {
            TaskOutcome::Completed => None,
            TaskOutcome::Failed(message) => Some(Fault::Failed {
                unit_id: unit_id.to_string(),
                message: message.clone(),
            }),
            TaskOutcome::Panicked(message) => Some(Fault::Panicked {
                unit_id: unit_id.to_string(),
                message: message.clone(),
            }),
            TaskOutcome::Forced { grace } => Some(Fault::ForcedTermination {
                unit_id: unit_id.to_string(),
                grace_ms: grace.as_millis() as u64,
            }),
        }
    }
}

/// Handle to a spawned unit task.
pub struct TaskHandle {
    id: Uuid,
    name: String,
    trigger: ShutdownTrigger,
    outcome: Arc<watch::Sender<Option<TaskOutcome>>>,
    join: Mutex<Option<JoinHandle<()>>>,
    started_at: Instant,
}

impl TaskHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.outcome.borrow().clone()
    }

    pub fn stop_requested(&self) -> bool {
        self.trigger.is_fired()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn request_stop(&self) {
        self.trigger.fire();
    }

    /// Aborts the task and records `Forced` unless the body finished first.
    async fn abort(&self, grace: Duration) -> TaskOutcome {
        if let Some(join) = self.join.lock().await.take() {
            join.abort();
            if timeout(ABORT_SETTLE, join).await.is_err() {
                warn!("task {} did not unwind after abort", self.name);
            }
        }
        record_outcome(&self.outcome, TaskOutcome::Forced { grace });
        self.outcome().unwrap_or(TaskOutcome::Forced { grace })
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("outcome", &self.outcome())
            .finish()
    }
}

fn record_outcome(slot: &watch::Sender<Option<TaskOutcome>>, outcome: TaskOutcome) -> bool {
    slot.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(outcome);
            true
        } else {
            false
        }
    })
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What ends [`Scheduler::run_forever`].
pub struct RunControl {
    pub shutdown: ShutdownSignal,
    pub fatal: mpsc::UnboundedReceiver<String>,
    /// Stop once the root registry is empty and no import is in flight.
    pub exit_when_idle: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    live: Arc<AtomicUsize>,
    spawned: Arc<AtomicU64>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `body` in its own task. Never blocks.
    ///
    /// `on_exit` runs inside the task when the body ends without having been
    /// asked to stop, so the owner can reap a unit that finished or faulted
    /// on its own.
    pub fn spawn<F, E>(
        &self,
        name: &str,
        trigger: ShutdownTrigger,
        body: F,
        on_exit: E,
    ) -> Arc<TaskHandle>
    where
        F: Future<Output = UnitResult<()>> + Send + 'static,
        E: FnOnce(TaskOutcome) + Send + 'static,
    {
        let id = Uuid::new_v4();
        let outcome = Arc::new(watch::channel(None).0);
        let stop = trigger.signal();
        let scope = TaskScope {
            id,
            stop: stop.clone(),
        };
        let task_outcome = outcome.clone();
        let task_name = name.to_string();

        self.live.fetch_add(1, Ordering::SeqCst);
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let guard = LiveGuard(self.live.clone());

        let join = tokio::spawn(async move {
            let _guard = guard;
            let scoped = CURRENT_TASK.scope(scope, body);
            let result = match AssertUnwindSafe(scoped).catch_unwind().await {
                Ok(Ok(())) => TaskOutcome::Completed,
                Ok(Err(e)) => TaskOutcome::Failed(e.to_string()),
                Err(payload) => TaskOutcome::Panicked(panic_message(payload.as_ref())),
            };
            debug!("task {} finished: {:?}", task_name, result);
            let recorded = record_outcome(&task_outcome, result.clone());
            if recorded && !stop.is_cancelled() {
                on_exit(result);
            }
        });

        Arc::new(TaskHandle {
            id,
            name: name.to_string(),
            trigger,
            outcome,
            join: Mutex::new(Some(join)),
            started_at: Instant::now(),
        })
    }

    /// Requests a cooperative stop and waits up to `grace` for the body to
    /// return before aborting it.
    pub async fn cancel(&self, handle: &TaskHandle, grace: Duration) -> TaskOutcome {
        handle.request_stop();
        match timeout(grace, self.join(handle)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    "task {} ignored stop for {:?}, terminating",
                    handle.name(),
                    grace
                );
                handle.abort(grace).await
            }
        }
    }

    /// Suspends the calling task until `handle` is terminal.
    pub async fn join(&self, handle: &TaskHandle) -> TaskOutcome {
        let mut rx = handle.outcome.subscribe();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return handle
                    .outcome()
                    .unwrap_or_else(|| TaskOutcome::Failed("task state lost".to_string()));
            }
        }
    }

    pub fn live_tasks(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn spawned_tasks(&self) -> u64 {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Drives the agent until it is told to stop, the root goes idle, or a
    /// fatal fault reaches the root. Every remaining unit is unloaded before
    /// returning.
    pub async fn run_forever(&self, root: &Container, control: RunControl) -> AgentResult<()> {
        let RunControl {
            shutdown,
            mut fatal,
            exit_when_idle,
        } = control;
        let mut changes = root.changes();

        loop {
            if exit_when_idle && root.is_idle() {
                info!("root registry is empty, scheduler stopping");
                return Ok(());
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested, unloading {} programs", root.len());
                    root.unload_all().await;
                    return Ok(());
                }
                Some(message) = fatal.recv() => {
                    root.unload_all().await;
                    return Err(AgentError::FatalRootFault { message });
                }
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Err(AgentError::FatalRootFault {
                            message: "root registry dropped".to_string(),
                        });
                    }
                }
            }
        }
    }
}
