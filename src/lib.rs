//! # Dogma: in-process component host
//!
//! Dogma runs independently written units of logic inside one process and
//! lets them be loaded, stopped, reloaded or replaced at runtime without
//! restarting the host.
//!
//! ## Building blocks
//!
//! - Units ([`unit`]): the lifecycle contract (`configure`, `start`, `stop`)
//!   shared by programs and plugins.
//! - Containers ([`container`]): one level of the unit tree. The [`Agent`]
//!   owns the root container of programs; every pluggable unit owns a nested
//!   container of plugins. All levels behave the same.
//! - Registry ([`registry`]): the keyed store behind a container, enforcing
//!   unique ids and the `LOADING → RUNNING → STOPPING → UNLOADED` lifecycle.
//! - Scheduler ([`scheduler`]): one tokio task per unit, cooperative stop
//!   with a grace period, forced termination after it.
//! - Module resolution ([`module`]): turns a module reference into a fresh
//!   unit. [`builtin`] provides the units shipped with the binary.
//!
//! ## Lifecycle
//!
//! ```text
//! import_unit ──▶ LOADING ──configure ok──▶ RUNNING ──unload / exit──▶ STOPPING ──▶ removed
//!                    │                                                    │
//!              configure failed ──▶ rolled back          plugins first, then cancel, then stop
//! ```
//!
//! Faults inside a unit (an error, a panic, ignoring a stop request) are
//! recorded by the owning container and published on the [`event_bus`]. They
//! never propagate to siblings or parents; only a broken invariant at the
//! root ends [`Agent::init`] with an error.

pub mod agent;
pub mod builtin;
pub mod config;
pub mod container;
pub mod error;
pub mod event_bus;
pub mod module;
pub mod registry;
pub mod scheduler;
pub mod unit;

// Re-exports
pub use agent::Agent;
pub use config::{AgentConfig, ImportSpec};
pub use container::{Container, FaultRecord, WeakContainer};
pub use error::*;
pub use event_bus::{EventBus, EventReceiver, LifecycleEvent, LifecycleEventType};
pub use module::{ModuleCatalog, ModuleResolver};
pub use registry::{LifecycleState, UnitHandle};
pub use scheduler::{Scheduler, ShutdownSignal, TaskOutcome};
pub use unit::{Unit, UnitConfig, UnitContext, UnitKind, UnitState};
