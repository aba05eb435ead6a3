use thiserror::Error;

use crate::event_bus::EventError;
use crate::registry::LifecycleState;

/// Violations of the registry invariants. Always recoverable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unit already registered: {unit_id}")]
    DuplicateId { unit_id: String },
    #[error("Unit not found: {unit_id}")]
    NotFound { unit_id: String },
    #[error("Unit {unit_id} is still running")]
    StillRunning { unit_id: String },
    #[error("Unit {unit_id} cannot move from {from} to {to}")]
    InvalidTransition {
        unit_id: String,
        from: LifecycleState,
        to: LifecycleState,
    },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Resolution or configuration failures. The registry never keeps a partial
/// entry behind one of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImportError {
    #[error("Unknown module reference: {module_ref}")]
    UnknownModule { module_ref: String },
    #[error("Invalid unit id {unit_id:?}: {reason}")]
    InvalidId { unit_id: String, reason: String },
    #[error("Failed to configure unit {unit_id}: {message}")]
    Configure { unit_id: String, message: String },
}

/// A fault recorded against a single unit. Faults are reported to the owning
/// registry and never travel sideways or upward past the container.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    #[error("Unit {unit_id} ignored the stop request and was terminated after {grace_ms}ms")]
    ForcedTermination { unit_id: String, grace_ms: u64 },
    #[error("Unit {unit_id} failed: {message}")]
    Failed { unit_id: String, message: String },
    #[error("Unit {unit_id} panicked: {message}")]
    Panicked { unit_id: String, message: String },
}

impl Fault {
    pub fn unit_id(&self) -> &str {
        match self {
            Fault::ForcedTermination { unit_id, .. }
            | Fault::Failed { unit_id, .. }
            | Fault::Panicked { unit_id, .. } => unit_id,
        }
    }
}

/// Errors returned by unit implementations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UnitError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl UnitError {
    pub fn failed<S: Into<String>>(message: S) -> Self {
        UnitError::Failed(message.into())
    }
}

pub type UnitResult<T> = Result<T, UnitError>;

/// Errors returned by container operations (`import_unit`, `unload_unit`, ...).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LifecycleError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Import error: {0}")]
    Import(#[from] ImportError),
    #[error("Container {path:?} is closed")]
    ContainerClosed { path: String },
    #[error("Teardown of unit {unit_id} was interrupted: {message}")]
    Interrupted { unit_id: String, message: String },
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Fatal fault at the agent root: {message}")]
    FatalRootFault { message: String },
    #[error("Agent is already running")]
    AlreadyStarted,
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
}

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
    #[error("Unit error: {0}")]
    Unit(#[from] UnitError),
    #[error("Event error: {0}")]
    Event(#[from] EventError),
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type InternalResult<T> = Result<T, Error>;

impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }
}
