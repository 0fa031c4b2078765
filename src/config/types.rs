//! Configuration type definitions.
//!
//! Structures for the project file (`millrace.yaml`: backend choice and
//! retry defaults) and per-pipeline declaration files (trigger, inputs,
//! retry overrides).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{BackendError, FifoBackend, InMemoryBackend, QueueBackend};
use crate::core::job::JobTemplate;
use crate::core::retry::{ErrorKindRegistry, RetryError, RetryPolicy};
use crate::core::trigger::RawTrigger;
use crate::core::types::ScheduleId;
use crate::registry::ScheduleDeclaration;

use super::yaml::ConfigError;

/// Project configuration (millrace.yaml).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Backend choice and transport settings.
    pub job_queue: QueueConfig,
    /// Retry defaults applied to pipelines without their own `run`
    /// section.
    pub run: RunSection,
    /// Additional symbolic error kinds registered at startup.
    pub error_kinds: Vec<String>,
}

impl ProjectConfig {
    /// Build the error-kind registry: built-ins plus configured names.
    pub fn error_kind_registry(&self) -> Result<ErrorKindRegistry, RetryError> {
        let mut registry = ErrorKindRegistry::with_builtins();
        for name in &self.error_kinds {
            registry.register(name.clone())?;
        }
        Ok(registry)
    }
}

/// Backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QueueConfig {
    /// In-process backend (default, non-persistent).
    #[default]
    Memory,
    /// Durable SQLite backend.
    Sqlite {
        #[serde(default)]
        connection: SqliteConnection,
    },
    /// Queue-only FIFO backend (no scheduler capability).
    Fifo {
        #[serde(default)]
        connection: FifoConnection,
    },
}

/// SQLite transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConnection {
    /// Path to the database file.
    pub path: String,
}

impl Default for SqliteConnection {
    fn default() -> Self {
        Self {
            path: "millrace.db".to_string(),
        }
    }
}

/// FIFO queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FifoConnection {
    /// Bound on queued jobs.
    pub capacity: usize,
}

impl Default for FifoConnection {
    fn default() -> Self {
        Self {
            capacity: crate::backend::FIFO_DEFAULT_CAPACITY,
        }
    }
}

impl QueueConfig {
    /// Construct the configured backend.
    pub async fn build(&self) -> Result<Arc<dyn QueueBackend>, ConfigError> {
        match self {
            QueueConfig::Memory => Ok(Arc::new(InMemoryBackend::new())),
            QueueConfig::Fifo { connection } => {
                Ok(Arc::new(FifoBackend::with_capacity(connection.capacity)))
            }
            #[cfg(any(feature = "sqlite", test))]
            QueueConfig::Sqlite { connection } => {
                let backend = crate::backend::SqliteBackend::new(&connection.path)
                    .await
                    .map_err(ConfigError::Backend)?;
                Ok(Arc::new(backend))
            }
            #[cfg(not(any(feature = "sqlite", test)))]
            QueueConfig::Sqlite { .. } => Err(ConfigError::InvalidConfig(
                "sqlite backend requires the 'sqlite' feature".to_string(),
            )),
        }
    }
}

/// Retry settings (`run:` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSection {
    /// Maximum retries after the initial attempt.
    pub max_retries: u32,
    /// Base delay in seconds between attempts.
    pub retry_delay: f64,
    /// Jitter factor in [0, 1].
    pub jitter_factor: f64,
    /// Symbolic error kinds eligible for retry; empty = any.
    pub retry_exceptions: Vec<String>,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay: 5.0,
            jitter_factor: 0.0,
            retry_exceptions: Vec::new(),
        }
    }
}

impl RunSection {
    /// Build a validated [`RetryPolicy`], resolving error-kind names
    /// through the registry. Fails fast on unknown names or out-of-range
    /// values.
    pub fn to_policy(&self, registry: &ErrorKindRegistry) -> Result<RetryPolicy, RetryError> {
        if !self.retry_delay.is_finite() || self.retry_delay < 0.0 {
            return Err(RetryError::InvalidDelay(self.retry_delay));
        }

        RetryPolicy::new(self.max_retries, Duration::from_secs_f64(self.retry_delay))
            .with_jitter(self.jitter_factor)?
            .with_retryable(&self.retry_exceptions, registry)
    }
}

/// One pipeline declaration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name, as known to the execution engine.
    pub name: String,
    /// Trigger declaration; absent means manual-only.
    #[serde(default)]
    pub schedule: Option<RawTrigger>,
    /// Explicit schedule id, overriding derivation.
    #[serde(default)]
    pub schedule_id: Option<String>,
    /// Whether the declaration participates in bulk registration.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Queue to enqueue jobs on.
    #[serde(default)]
    pub queue: Option<String>,
    /// Executor choice forwarded to the engine.
    #[serde(default)]
    pub executor: Option<String>,
    /// Pipeline input values.
    #[serde(default)]
    pub inputs: HashMap<String, serde_yaml::Value>,
    /// Pipeline configuration values.
    #[serde(default)]
    pub config: HashMap<String, serde_yaml::Value>,
    /// Output variables to materialize.
    #[serde(default)]
    pub final_vars: Vec<String>,
    /// Retry settings overriding the project defaults.
    #[serde(default)]
    pub run: Option<RunSection>,
}

fn default_true() -> bool {
    true
}

impl PipelineConfig {
    /// Resolve into a registration-ready declaration.
    ///
    /// Retry settings fall back to the project defaults when the file has
    /// no `run` section; validation (unknown error kinds, bad jitter)
    /// fails here, before anything reaches a backend.
    pub fn into_declaration(
        self,
        defaults: &RunSection,
        registry: &ErrorKindRegistry,
    ) -> Result<ScheduleDeclaration, ConfigError> {
        let run = self.run.as_ref().unwrap_or(defaults);
        let retry = run.to_policy(registry)?;

        let mut template = JobTemplate::new(self.name.clone())
            .with_inputs(yaml_map_to_json(self.inputs)?)
            .with_config(yaml_map_to_json(self.config)?)
            .with_final_vars(self.final_vars)
            .with_retry(retry);
        if let Some(queue) = self.queue {
            template = template.with_queue(queue);
        }
        if let Some(executor) = self.executor {
            template = template.with_executor(executor);
        }

        Ok(ScheduleDeclaration {
            name: self.name,
            trigger: self.schedule,
            template,
            enabled: self.enabled,
            explicit_id: self.schedule_id.map(ScheduleId::new),
        })
    }
}

/// Convert YAML values into the JSON values stored on job templates.
fn yaml_map_to_json(
    map: HashMap<String, serde_yaml::Value>,
) -> Result<HashMap<String, serde_json::Value>, ConfigError> {
    map.into_iter()
        .map(|(key, value)| {
            let json = serde_json::to_value(&value).map_err(|e| {
                ConfigError::InvalidConfig(format!("value for {:?} is not JSON-compatible: {}", key, e))
            })?;
            Ok((key, json))
        })
        .collect()
}

impl From<BackendError> for ConfigError {
    fn from(e: BackendError) -> Self {
        ConfigError::Backend(e)
    }
}
