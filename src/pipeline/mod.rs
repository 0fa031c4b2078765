//! Pipeline execution boundary.
//!
//! The DAG engine that actually runs pipeline code is an external
//! collaborator; this crate depends only on the [`PipelineExecutor`]
//! shape. [`ProcessExecutor`] bridges to an engine shipped as a separate
//! binary, one process per invocation.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::core::types::PipelineRef;

/// A failed pipeline invocation: symbolic kind plus human message.
///
/// The kind is the only field the retry policy inspects.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ExecutionError {
    pub kind: String,
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Interface to the external pipeline execution engine.
#[async_trait]
pub trait PipelineExecutor: Send + Sync {
    /// Execute one pipeline invocation.
    async fn execute(
        &self,
        pipeline: &PipelineRef,
        inputs: &HashMap<String, Value>,
        config: &HashMap<String, Value>,
        final_vars: &[String],
    ) -> Result<Value, ExecutionError>;
}

/// Executor that shells out to an external pipeline-runner binary.
///
/// Invokes `<program> [base args..] <pipeline> --inputs <json>
/// --config <json> [--final-vars <json>]`, captures output, and maps
/// process failures onto symbolic error kinds:
/// `SpawnError` (could not start), `Timeout` (wall clock exceeded),
/// `CommandFailed` (non-zero exit). Stdout is parsed as JSON when it is
/// JSON, otherwise returned as a string value.
pub struct ProcessExecutor {
    program: String,
    base_args: Vec<String>,
    timeout: Option<Duration>,
}

impl ProcessExecutor {
    /// Create an executor for the given runner program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            timeout: None,
        }
    }

    /// Add an argument placed before the pipeline name.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.base_args.push(arg.into());
        self
    }

    /// Set a wall-clock timeout for each invocation.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn run_once(
        &self,
        pipeline: &PipelineRef,
        inputs: &HashMap<String, Value>,
        config: &HashMap<String, Value>,
        final_vars: &[String],
    ) -> Result<Value, ExecutionError> {
        let inputs_json = serde_json::to_string(inputs)
            .map_err(|e| ExecutionError::new("DataError", e.to_string()))?;
        let config_json = serde_json::to_string(config)
            .map_err(|e| ExecutionError::new("DataError", e.to_string()))?;

        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.base_args)
            .arg(pipeline.as_str())
            .arg("--inputs")
            .arg(inputs_json)
            .arg("--config")
            .arg(config_json);
        if !final_vars.is_empty() {
            let vars_json = serde_json::to_string(final_vars)
                .map_err(|e| ExecutionError::new("DataError", e.to_string()))?;
            command.arg("--final-vars").arg(vars_json);
        }
        command.kill_on_drop(true);

        let output = command
            .output()
            .await
            .map_err(|e| ExecutionError::new("SpawnError", e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(ExecutionError::new(
                "CommandFailed",
                format!("exit {}: {}", code, stderr.trim()),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        Ok(serde_json::from_str(trimmed)
            .unwrap_or_else(|_| Value::String(trimmed.to_string())))
    }
}

#[async_trait]
impl PipelineExecutor for ProcessExecutor {
    async fn execute(
        &self,
        pipeline: &PipelineRef,
        inputs: &HashMap<String, Value>,
        config: &HashMap<String, Value>,
        final_vars: &[String],
    ) -> Result<Value, ExecutionError> {
        let invocation = self.run_once(pipeline, inputs, config, final_vars);
        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, invocation).await {
                Ok(result) => result,
                Err(_) => Err(ExecutionError::new(
                    "Timeout",
                    format!("pipeline {} exceeded {:?}", pipeline, limit),
                )),
            },
            None => invocation.await,
        }
    }
}
