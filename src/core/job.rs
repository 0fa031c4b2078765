//! Job and schedule records.
//!
//! [`JobTemplate`] carries everything a pipeline invocation needs;
//! [`ScheduleRecord`] binds a template to a trigger; [`JobRecord`] is one
//! concrete enqueued execution with its state machine. Persisted records
//! are owned exclusively by the active backend — everything else passes
//! ids around.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::retry::RetryPolicy;
use super::trigger::{TriggerError, TriggerSpec};
use super::types::{JobId, PipelineRef, ScheduleId};

/// Default queue name for templates that don't pick one.
pub const DEFAULT_QUEUE: &str = "default";

/// Parameters for one pipeline invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTemplate {
    /// Pipeline to invoke.
    pub pipeline: PipelineRef,
    /// Input values handed to the execution engine.
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    /// Configuration values handed to the execution engine.
    #[serde(default)]
    pub config: HashMap<String, Value>,
    /// Output variables the engine should materialize.
    #[serde(default)]
    pub final_vars: Vec<String>,
    /// Executor choice forwarded to the engine (engine-defined names).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
    /// Queue the job is enqueued on.
    #[serde(default = "default_queue")]
    pub queue: String,
    /// Retry policy applied around the invocation.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

impl JobTemplate {
    /// Create a template for a pipeline with default settings.
    pub fn new(pipeline: impl Into<PipelineRef>) -> Self {
        Self {
            pipeline: pipeline.into(),
            inputs: HashMap::new(),
            config: HashMap::new(),
            final_vars: Vec::new(),
            executor: None,
            queue: default_queue(),
            retry: RetryPolicy::default(),
        }
    }

    /// Set the input values.
    pub fn with_inputs(mut self, inputs: HashMap<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Set the configuration values.
    pub fn with_config(mut self, config: HashMap<String, Value>) -> Self {
        self.config = config;
        self
    }

    /// Set the output variables to materialize.
    pub fn with_final_vars(mut self, vars: Vec<String>) -> Self {
        self.final_vars = vars;
        self
    }

    /// Set the executor choice.
    pub fn with_executor(mut self, executor: impl Into<String>) -> Self {
        self.executor = Some(executor.into());
        self
    }

    /// Set the queue name.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting in the queue for a worker.
    Queued,
    /// Claimed by a worker, attempt in flight.
    Running,
    /// Finished without error.
    Succeeded,
    /// Finished with a non-retryable error or exhausted budget.
    Failed,
    /// Waiting out the delay before the next attempt.
    Retrying,
    /// Cancelled before completion.
    Cancelled,
}

impl JobState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Retrying => "retrying",
            JobState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "retrying" => Ok(JobState::Retrying),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(format!("unknown job state: {}", other)),
        }
    }
}

/// The last error observed for a job: symbolic kind plus message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: String,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// One enqueued pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique job id.
    pub id: JobId,
    /// Invocation parameters, copied from the originating schedule or the
    /// ad-hoc enqueue request.
    pub template: JobTemplate,
    /// Originating schedule; `None` for ad-hoc jobs.
    pub schedule_id: Option<ScheduleId>,
    /// Current lifecycle state.
    pub state: JobState,
    /// Retries performed so far; the initial attempt is 0.
    pub attempt: u32,
    /// Set by an external cancel request while the job is in flight; the
    /// worker resolves it to `Cancelled` at the next interruption point.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Last error observed, populated on failure and retry.
    pub last_failure: Option<JobFailure>,
    /// When the job was enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// When the first attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When a terminal state was reached.
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Create a freshly-queued job from a template.
    pub fn new(template: JobTemplate, schedule_id: Option<ScheduleId>) -> Self {
        Self {
            id: JobId::new(),
            template,
            schedule_id,
            state: JobState::Queued,
            attempt: 0,
            cancel_requested: false,
            last_failure: None,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// The pipeline this job invokes.
    pub fn pipeline(&self) -> &PipelineRef {
        &self.template.pipeline
    }

    /// Mark the job as claimed and running.
    pub fn mark_running(&mut self) {
        self.state = JobState::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Mark the job as waiting for its next attempt.
    pub fn mark_retrying(&mut self, failure: JobFailure) {
        self.state = JobState::Retrying;
        self.last_failure = Some(failure);
    }

    /// Begin the next attempt after a retry delay.
    pub fn begin_next_attempt(&mut self) {
        self.attempt += 1;
        self.state = JobState::Running;
    }

    /// Mark the job as succeeded.
    pub fn mark_succeeded(&mut self) {
        self.state = JobState::Succeeded;
        self.finished_at = Some(Utc::now());
    }

    /// Mark the job as failed with its final error.
    pub fn mark_failed(&mut self, failure: JobFailure) {
        self.state = JobState::Failed;
        self.last_failure = Some(failure);
        self.finished_at = Some(Utc::now());
    }

    /// Mark the job as cancelled.
    pub fn mark_cancelled(&mut self) {
        self.state = JobState::Cancelled;
        self.finished_at = Some(Utc::now());
    }

    /// Total wall-clock duration, once finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// A persisted, named binding of a trigger to a pipeline invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRecord {
    /// Unique schedule id within the backend's namespace.
    pub id: ScheduleId,
    /// Canonical trigger.
    pub trigger: TriggerSpec,
    /// Template for jobs this schedule enqueues.
    pub template: JobTemplate,
    /// Paused schedules remain registered but do not fire.
    pub enabled: bool,
    /// Next instant the schedule is due; `None` once a one-shot date has
    /// fired.
    pub next_fire_at: Option<DateTime<Utc>>,
    /// When the schedule was registered.
    pub created_at: DateTime<Utc>,
    /// When the schedule was last modified.
    pub updated_at: DateTime<Utc>,
}

impl ScheduleRecord {
    /// Create an enabled schedule with its first fire time computed from
    /// now.
    pub fn new(
        id: ScheduleId,
        trigger: TriggerSpec,
        template: JobTemplate,
    ) -> Result<Self, TriggerError> {
        let now = Utc::now();
        let next_fire_at = trigger.next_after(now)?;
        Ok(Self {
            id,
            trigger,
            template,
            enabled: true,
            next_fire_at,
            created_at: now,
            updated_at: now,
        })
    }

    /// Set enabled state at construction.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Refresh the updated-at timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether this schedule is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_fire_at.is_some_and(|at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::trigger::RawTrigger;
    use std::time::Duration;

    fn template() -> JobTemplate {
        JobTemplate::new("nightly_report")
            .with_retry(RetryPolicy::new(2, Duration::from_secs(1)))
    }

    #[test]
    fn test_template_defaults() {
        let t = JobTemplate::new("etl");
        assert_eq!(t.queue, DEFAULT_QUEUE);
        assert!(t.inputs.is_empty());
        assert!(t.executor.is_none());
        assert!(!t.retry.is_enabled());
    }

    #[test]
    fn test_job_state_terminality() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Retrying.is_terminal());
    }

    #[test]
    fn test_job_state_round_trips_through_str() {
        for state in [
            JobState::Queued,
            JobState::Running,
            JobState::Succeeded,
            JobState::Failed,
            JobState::Retrying,
            JobState::Cancelled,
        ] {
            let parsed: JobState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("nonsense".parse::<JobState>().is_err());
    }

    #[test]
    fn test_new_job_starts_queued_at_attempt_zero() {
        let job = JobRecord::new(template(), None);
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempt, 0);
        assert!(job.schedule_id.is_none());
        assert!(job.started_at.is_none());
    }

    #[test]
    fn test_retry_cycle_increments_attempt() {
        let mut job = JobRecord::new(template(), None);
        job.mark_running();
        job.mark_retrying(JobFailure::new("Transient", "boom"));
        job.begin_next_attempt();

        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.last_failure.as_ref().unwrap().kind, "Transient");
    }

    #[test]
    fn test_terminal_transitions_stamp_finish_time() {
        let mut job = JobRecord::new(template(), None);
        job.mark_running();
        job.mark_succeeded();
        assert!(job.finished_at.is_some());
        assert!(job.duration().is_some());
    }

    #[test]
    fn test_failed_records_last_failure() {
        let mut job = JobRecord::new(template(), None);
        job.mark_running();
        job.mark_failed(JobFailure::new("DataError", "bad partition"));

        assert_eq!(job.state, JobState::Failed);
        let failure = job.last_failure.unwrap();
        assert_eq!(failure.kind, "DataError");
        assert_eq!(failure.message, "bad partition");
    }

    #[test]
    fn test_schedule_record_computes_first_fire() {
        let trigger = RawTrigger::interval_secs(60).normalize().unwrap();
        let schedule =
            ScheduleRecord::new(ScheduleId::new("s1"), trigger, template()).unwrap();

        assert!(schedule.enabled);
        let next = schedule.next_fire_at.unwrap();
        assert!(next > schedule.created_at);
    }

    #[test]
    fn test_schedule_due_only_when_enabled() {
        let trigger = RawTrigger::interval_secs(60).normalize().unwrap();
        let mut schedule =
            ScheduleRecord::new(ScheduleId::new("s1"), trigger, template()).unwrap();

        let fire_at = schedule.next_fire_at.unwrap();
        assert!(schedule.is_due(fire_at));
        assert!(!schedule.is_due(fire_at - chrono::Duration::seconds(1)));

        schedule.enabled = false;
        assert!(!schedule.is_due(fire_at));
    }

    #[test]
    fn test_job_record_serialization_round_trip() {
        let mut job = JobRecord::new(template(), Some(ScheduleId::new("s1")));
        job.mark_running();
        job.mark_retrying(JobFailure::new("Timeout", "slow upstream"));

        let json = serde_json::to_string(&job).expect("serialize");
        let back: JobRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.state, JobState::Retrying);
        assert_eq!(back.id, job.id);
        assert_eq!(back.template, job.template);
    }
}
