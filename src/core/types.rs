//! Core identifier types.
//!
//! Type-safe identifiers for pipelines, schedules, and jobs. Pipeline and
//! schedule ids are caller-visible strings; job ids are backend-assigned
//! UUIDs.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Reference to a pipeline known to the external execution engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PipelineRef(String);

/// Unique identifier for a registered schedule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScheduleId(String);

/// Unique identifier for an enqueued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl PipelineRef {
    /// Create a new pipeline reference.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PipelineRef {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PipelineRef {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl ScheduleId {
    /// Create a new schedule id from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ScheduleId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ScheduleId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl JobId {
    /// Generate a new random job id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a job id from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PipelineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
