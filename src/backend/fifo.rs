//! Queue-only backend implementation.
//!
//! A minimal bounded FIFO for deployments where schedule evaluation
//! happens elsewhere: jobs can be enqueued, claimed, and tracked, but
//! there is no schedule store and no timer capability. Every schedule
//! operation reports [`BackendError::Unsupported`] so callers can detect
//! the gap instead of silently losing schedules.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use async_trait::async_trait;

use super::{BackendError, JobFilter, QueueBackend, ScheduleFilter};
use crate::core::job::{JobRecord, JobState, JobTemplate, ScheduleRecord};
use crate::core::types::{JobId, ScheduleId};

/// Default bound on queued jobs across all queues.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Bounded in-process FIFO queue without scheduler capability.
pub struct FifoBackend {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    queues: RwLock<HashMap<String, VecDeque<JobId>>>,
    capacity: usize,
}

impl FifoBackend {
    /// Create a queue with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a queue bounded to `capacity` queued jobs.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            queues: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    fn unsupported(operation: &'static str) -> BackendError {
        BackendError::Unsupported {
            backend: "fifo",
            operation,
        }
    }
}

impl Default for FifoBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for FifoBackend {
    fn name(&self) -> &'static str {
        "fifo"
    }

    async fn enqueue(
        &self,
        template: JobTemplate,
        schedule_id: Option<ScheduleId>,
    ) -> Result<JobId, BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::LockPoisoned)?;
        let mut queues = self
            .queues
            .write()
            .map_err(|_| BackendError::LockPoisoned)?;

        let queued: usize = queues.values().map(VecDeque::len).sum();
        if queued >= self.capacity {
            return Err(BackendError::Unavailable(format!(
                "queue full (capacity: {})",
                self.capacity
            )));
        }

        let record = JobRecord::new(template, schedule_id);
        let id = record.id;
        let queue = record.template.queue.clone();
        jobs.insert(id, record);
        queues.entry(queue).or_default().push_back(id);
        Ok(id)
    }

    async fn job(&self, id: &JobId) -> Result<JobRecord, BackendError> {
        let jobs = self.jobs.read().map_err(|_| BackendError::LockPoisoned)?;
        jobs.get(id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("job: {}", id)))
    }

    async fn update_job(&self, record: &JobRecord) -> Result<(), BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::LockPoisoned)?;
        match jobs.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(BackendError::NotFound(format!("job: {}", record.id))),
        }
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<JobRecord>, BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::LockPoisoned)?;
        let mut queues = self
            .queues
            .write()
            .map_err(|_| BackendError::LockPoisoned)?;

        let Some(pending) = queues.get_mut(queue) else {
            return Ok(None);
        };

        while let Some(id) = pending.pop_front() {
            if let Some(record) = jobs.get_mut(&id) {
                if record.state == JobState::Queued {
                    record.mark_running();
                    return Ok(Some(record.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn cancel_job(&self, id: &JobId) -> Result<(), BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::LockPoisoned)?;
        if let Some(record) = jobs.get_mut(id) {
            match record.state {
                JobState::Queued => record.mark_cancelled(),
                JobState::Running | JobState::Retrying => record.cancel_requested = true,
                _ => {}
            }
        }
        Ok(())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, BackendError> {
        let jobs = self.jobs.read().map_err(|_| BackendError::LockPoisoned)?;
        let mut result: Vec<_> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        result.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn register_schedule(
        &self,
        _record: ScheduleRecord,
        _overwrite: bool,
    ) -> Result<(), BackendError> {
        Err(Self::unsupported("register_schedule"))
    }

    async fn schedule(&self, _id: &ScheduleId) -> Result<ScheduleRecord, BackendError> {
        Err(Self::unsupported("schedule"))
    }

    async fn cancel_schedule(&self, _id: &ScheduleId) -> Result<(), BackendError> {
        Err(Self::unsupported("cancel_schedule"))
    }

    async fn pause_schedule(&self, _id: &ScheduleId) -> Result<(), BackendError> {
        Err(Self::unsupported("pause_schedule"))
    }

    async fn resume_schedule(&self, _id: &ScheduleId) -> Result<(), BackendError> {
        Err(Self::unsupported("resume_schedule"))
    }

    async fn list_schedules(
        &self,
        _filter: &ScheduleFilter,
    ) -> Result<Vec<ScheduleRecord>, BackendError> {
        Err(Self::unsupported("list_schedules"))
    }

    async fn due_schedules(
        &self,
        _now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleRecord>, BackendError> {
        Err(Self::unsupported("due_schedules"))
    }

    async fn advance_schedule(
        &self,
        _id: &ScheduleId,
        _fired_at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, BackendError> {
        Err(Self::unsupported("advance_schedule"))
    }
}
