use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};

use crate::{unit::UnitConfig, Error, InternalResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Time a unit gets to honour a stop request before it is terminated.
    #[serde(default = "default_grace_period", with = "duration_ms")]
    pub grace_period: Duration,

    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,

    /// Fault records kept per container.
    #[serde(default = "default_fault_history")]
    pub fault_history: usize,

    /// `init()` returns once the root registry is empty and nothing is being
    /// imported. When false only `shutdown()` ends it.
    #[serde(default = "default_true")]
    pub exit_when_idle: bool,

    /// Programs imported by the binary before `init()`.
    #[serde(default)]
    pub programs: Vec<ImportSpec>,
}

/// One entry of an import list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSpec {
    pub module: String,
    /// Defaults to the module reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub config: UnitConfig,
}

impl ImportSpec {
    pub fn new(module: &str) -> Self {
        Self {
            module: module.to_string(),
            id: None,
            config: UnitConfig::default(),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_config(mut self, config: UnitConfig) -> Self {
        self.config = config;
        self
    }

    pub fn unit_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.module)
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> InternalResult<T> {
    let file = File::open(path)
        .map_err(|e| Error::Internal(format!("Failed to open config file: {}", e)))?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)
        .map_err(|e| Error::Internal(format!("Failed to parse config file: {}", e)))?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> InternalResult<T> {
    let config = serde_json::from_str(s)
        .map_err(|e| Error::Internal(format!("Failed to parse config: {}", e)))?;
    Ok(config)
}

fn default_grace_period() -> Duration {
    Duration::from_millis(5000)
}
fn default_event_buffer_size() -> usize {
    256
}
fn default_fault_history() -> usize {
    64
}
fn default_true() -> bool {
    true
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            grace_period: default_grace_period(),
            event_buffer_size: default_event_buffer_size(),
            fault_history: default_fault_history(),
            exit_when_idle: default_true(),
            programs: Vec::new(),
        }
    }
}

impl AgentConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> InternalResult<Self> {
        from_file(path)
    }

    pub fn from_str(s: &str) -> InternalResult<Self> {
        from_str(s)
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_exit_when_idle(mut self, exit_when_idle: bool) -> Self {
        self.exit_when_idle = exit_when_idle;
        self
    }
}
