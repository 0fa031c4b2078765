//! Testing utilities for users of the library.
//!
//! Scripted pipeline executors for exercising the scheduler and worker
//! pool without a real execution engine:
//!
//! - [`StaticExecutor`]: always returns the same outcome
//! - [`ScriptedExecutor`]: replays a per-pipeline sequence of outcomes
//!   and records every invocation

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core::types::PipelineRef;
use crate::pipeline::{ExecutionError, PipelineExecutor};

/// One scripted outcome.
pub type Outcome = Result<Value, ExecutionError>;

/// Executor that always returns the same outcome.
pub struct StaticExecutor {
    outcome: Outcome,
}

impl StaticExecutor {
    /// An executor that always succeeds with `null`.
    pub fn ok() -> Arc<Self> {
        Arc::new(Self {
            outcome: Ok(Value::Null),
        })
    }

    /// An executor that always fails with the given kind.
    pub fn failing(kind: impl Into<String>, message: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            outcome: Err(ExecutionError::new(kind, message)),
        })
    }
}

#[async_trait]
impl PipelineExecutor for StaticExecutor {
    async fn execute(
        &self,
        _pipeline: &PipelineRef,
        _inputs: &HashMap<String, Value>,
        _config: &HashMap<String, Value>,
        _final_vars: &[String],
    ) -> Result<Value, ExecutionError> {
        self.outcome.clone()
    }
}

/// Executor that replays scripted outcomes per pipeline.
///
/// Each pipeline has its own FIFO script; once a script runs dry the
/// executor succeeds. Every invocation is recorded for assertions.
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<Outcome>>>,
    invocations: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    /// Create an executor with no scripts (every call succeeds).
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            invocations: Mutex::new(Vec::new()),
        })
    }

    /// Script the next outcomes for a pipeline, appended in order.
    pub async fn script(&self, pipeline: impl Into<String>, outcomes: Vec<Outcome>) {
        let mut scripts = self.scripts.lock().await;
        scripts.entry(pipeline.into()).or_default().extend(outcomes);
    }

    /// Script `n` failures of the given kind followed by success.
    pub async fn fail_n_times(&self, pipeline: impl Into<String>, n: usize, kind: &str) {
        let outcomes = (0..n)
            .map(|i| {
                Err(ExecutionError::new(
                    kind,
                    format!("scripted failure {}", i + 1),
                ))
            })
            .collect();
        self.script(pipeline, outcomes).await;
    }

    /// Names of pipelines invoked so far, in order.
    pub async fn invocations(&self) -> Vec<String> {
        self.invocations.lock().await.clone()
    }

    /// Number of invocations of one pipeline.
    pub async fn invocation_count(&self, pipeline: &str) -> usize {
        self.invocations
            .lock()
            .await
            .iter()
            .filter(|name| name.as_str() == pipeline)
            .count()
    }
}

#[async_trait]
impl PipelineExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        pipeline: &PipelineRef,
        _inputs: &HashMap<String, Value>,
        _config: &HashMap<String, Value>,
        _final_vars: &[String],
    ) -> Result<Value, ExecutionError> {
        self.invocations.lock().await.push(pipeline.to_string());

        let mut scripts = self.scripts.lock().await;
        match scripts.get_mut(pipeline.as_str()).and_then(VecDeque::pop_front) {
            Some(outcome) => outcome,
            None => Ok(Value::Null),
        }
    }
}
