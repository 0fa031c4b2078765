//! Job-queue backend abstraction.
//!
//! A [`QueueBackend`] owns durable schedule and job records and exposes a
//! uniform contract over materially different implementations: the
//! in-process [`InMemoryBackend`], the durable [`SqliteBackend`], and the
//! queue-only [`FifoBackend`]. Capabilities a variant does not have
//! surface as [`BackendError::Unsupported`] — never as a silent no-op —
//! so callers can detect the gap.

mod fifo;
mod memory;
#[cfg(any(feature = "sqlite", test))]
mod sqlite;
mod timeout;

pub use fifo::{DEFAULT_CAPACITY as FIFO_DEFAULT_CAPACITY, FifoBackend};
pub use memory::InMemoryBackend;
#[cfg(any(feature = "sqlite", test))]
pub use sqlite::SqliteBackend;
pub use timeout::TimedBackend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::job::{JobRecord, JobState, JobTemplate, ScheduleRecord};
use crate::core::trigger::TriggerError;
use crate::core::types::{JobId, PipelineRef, ScheduleId};

/// Errors surfaced by backend operations.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend's transport or store cannot be reached (includes
    /// timed-out calls).
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// A schedule with this id already exists and overwrite was not
    /// requested.
    #[error("schedule already registered: {0}")]
    ScheduleConflict(ScheduleId),

    /// The requested record is unknown to this backend.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend variant does not implement this operation.
    #[error("operation '{operation}' not supported by backend '{backend}'")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    /// In-process store lock was poisoned.
    #[error("backend lock poisoned")]
    LockPoisoned,

    /// A record failed to serialize or deserialize.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A persisted record is internally inconsistent.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        BackendError::Serialization(e.to_string())
    }
}

impl From<TriggerError> for BackendError {
    fn from(e: TriggerError) -> Self {
        BackendError::Corrupt(e.to_string())
    }
}

/// Filter criteria for job listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Restrict to one state.
    pub state: Option<JobState>,
    /// Restrict to one queue.
    pub queue: Option<String>,
    /// Restrict to jobs fired by one schedule.
    pub schedule: Option<ScheduleId>,
    /// Cap the number of returned records.
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_schedule(mut self, schedule: ScheduleId) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check a record against the filter (limit excluded).
    pub fn matches(&self, job: &JobRecord) -> bool {
        if let Some(state) = self.state {
            if job.state != state {
                return false;
            }
        }
        if let Some(queue) = &self.queue {
            if &job.template.queue != queue {
                return false;
            }
        }
        if let Some(schedule) = &self.schedule {
            if job.schedule_id.as_ref() != Some(schedule) {
                return false;
            }
        }
        true
    }
}

/// Filter criteria for schedule listings.
#[derive(Debug, Clone, Default)]
pub struct ScheduleFilter {
    /// Only enabled schedules.
    pub enabled_only: bool,
    /// Restrict to one pipeline.
    pub pipeline: Option<PipelineRef>,
}

impl ScheduleFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn enabled() -> Self {
        Self {
            enabled_only: true,
            ..Self::default()
        }
    }

    pub fn with_pipeline(mut self, pipeline: impl Into<PipelineRef>) -> Self {
        self.pipeline = Some(pipeline.into());
        self
    }

    /// Check a record against the filter.
    pub fn matches(&self, schedule: &ScheduleRecord) -> bool {
        if self.enabled_only && !schedule.enabled {
            return false;
        }
        if let Some(pipeline) = &self.pipeline {
            if &schedule.template.pipeline != pipeline {
                return false;
            }
        }
        true
    }
}

/// Capability interface over a job-queue/scheduler implementation.
///
/// Persisted records are owned by the backend; callers hold ids only.
/// The claim contract is at-most-one: a queued job is handed to exactly
/// one caller of [`claim_next`](Self::claim_next), which atomically moves
/// it to `running`.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Short name of the backend variant, used in errors and logs.
    fn name(&self) -> &'static str;

    // Job operations

    /// Enqueue one job built from a template. All-or-nothing: on error no
    /// partial record exists.
    async fn enqueue(
        &self,
        template: JobTemplate,
        schedule_id: Option<ScheduleId>,
    ) -> Result<JobId, BackendError>;

    /// Fetch a job record by id.
    async fn job(&self, id: &JobId) -> Result<JobRecord, BackendError>;

    /// Persist an updated job record.
    async fn update_job(&self, record: &JobRecord) -> Result<(), BackendError>;

    /// Atomically claim the oldest queued job on a queue, moving it to
    /// `running`. Returns `None` when the queue is empty.
    async fn claim_next(&self, queue: &str) -> Result<Option<JobRecord>, BackendError>;

    /// Request cancellation of a job. Idempotent: cancelling a terminal
    /// or unknown job is a no-op. A queued job is cancelled immediately;
    /// a job in flight gets its cancel flag set for the worker to honor.
    async fn cancel_job(&self, id: &JobId) -> Result<(), BackendError>;

    /// List jobs matching a filter. The result is a finite snapshot.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, BackendError>;

    // Schedule operations

    /// Persist a schedule. Fails with [`BackendError::ScheduleConflict`]
    /// when the id exists and `overwrite` is false; otherwise the prior
    /// record is atomically replaced.
    async fn register_schedule(
        &self,
        record: ScheduleRecord,
        overwrite: bool,
    ) -> Result<(), BackendError>;

    /// Fetch a schedule record by id.
    async fn schedule(&self, id: &ScheduleId) -> Result<ScheduleRecord, BackendError>;

    /// Delete a schedule. Idempotent: unknown ids are a no-op.
    async fn cancel_schedule(&self, id: &ScheduleId) -> Result<(), BackendError>;

    /// Pause a schedule. Pausing an already-paused schedule is a no-op;
    /// a never-registered id is [`BackendError::NotFound`].
    async fn pause_schedule(&self, id: &ScheduleId) -> Result<(), BackendError>;

    /// Resume a paused schedule. Resuming an enabled schedule is a no-op.
    async fn resume_schedule(&self, id: &ScheduleId) -> Result<(), BackendError>;

    /// List schedules matching a filter.
    async fn list_schedules(
        &self,
        filter: &ScheduleFilter,
    ) -> Result<Vec<ScheduleRecord>, BackendError>;

    // Timer-loop support (embedded-scheduler capability)

    /// Enabled schedules due at `now`, soonest-due first.
    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleRecord>, BackendError>;

    /// Advance a schedule's next fire time after it fired at `fired_at`.
    /// One-shot date schedules are disabled. Returns the new fire time.
    async fn advance_schedule(
        &self,
        id: &ScheduleId,
        fired_at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::JobTemplate;

    #[test]
    fn test_job_filter_matches_state_and_queue() {
        let template = JobTemplate::new("p1").with_queue("reports");
        let job = JobRecord::new(template, None);

        assert!(JobFilter::all().matches(&job));
        assert!(JobFilter::all().with_state(JobState::Queued).matches(&job));
        assert!(!JobFilter::all().with_state(JobState::Failed).matches(&job));
        assert!(JobFilter::all().with_queue("reports").matches(&job));
        assert!(!JobFilter::all().with_queue("default").matches(&job));
    }

    #[test]
    fn test_job_filter_matches_schedule() {
        let job = JobRecord::new(JobTemplate::new("p1"), Some(ScheduleId::new("s1")));

        assert!(
            JobFilter::all()
                .with_schedule(ScheduleId::new("s1"))
                .matches(&job)
        );
        assert!(
            !JobFilter::all()
                .with_schedule(ScheduleId::new("s2"))
                .matches(&job)
        );
    }

    #[test]
    fn test_schedule_filter_enabled_only() {
        use crate::core::trigger::RawTrigger;

        let trigger = RawTrigger::interval_secs(60).normalize().unwrap();
        let schedule = ScheduleRecord::new(
            ScheduleId::new("s1"),
            trigger,
            JobTemplate::new("p1"),
        )
        .unwrap()
        .with_enabled(false);

        assert!(ScheduleFilter::all().matches(&schedule));
        assert!(!ScheduleFilter::enabled().matches(&schedule));
        assert!(
            ScheduleFilter::all()
                .with_pipeline("p1")
                .matches(&schedule)
        );
        assert!(
            !ScheduleFilter::all()
                .with_pipeline("p2")
                .matches(&schedule)
        );
    }
}
