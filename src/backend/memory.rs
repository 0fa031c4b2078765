//! In-process backend implementation.
//!
//! Thread-safe, non-persistent, full capability. The default for tests
//! and the development loop; state does not survive a restart.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use async_trait::async_trait;

use super::{BackendError, JobFilter, QueueBackend, ScheduleFilter};
use crate::core::job::{JobRecord, JobState, JobTemplate, ScheduleRecord};
use crate::core::types::{JobId, ScheduleId};

/// In-process queue backend.
///
/// Locks are never held across await points; every operation takes the
/// locks it needs, mutates, and releases.
pub struct InMemoryBackend {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    queues: RwLock<HashMap<String, VecDeque<JobId>>>,
    schedules: RwLock<HashMap<ScheduleId, ScheduleRecord>>,
}

impl InMemoryBackend {
    /// Create a new empty backend.
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            queues: RwLock::new(HashMap::new()),
            schedules: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn enqueue(
        &self,
        template: JobTemplate,
        schedule_id: Option<ScheduleId>,
    ) -> Result<JobId, BackendError> {
        let record = JobRecord::new(template, schedule_id);
        let id = record.id;
        let queue = record.template.queue.clone();

        let mut jobs = self.jobs.write().map_err(|_| BackendError::LockPoisoned)?;
        let mut queues = self
            .queues
            .write()
            .map_err(|_| BackendError::LockPoisoned)?;

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

        // Ids stay in the deque after cancellation; skip anything that is
        // no longer actually queued.
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
                // Terminal states are immutable.
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
        record: ScheduleRecord,
        overwrite: bool,
    ) -> Result<(), BackendError> {
        let mut schedules = self
            .schedules
            .write()
            .map_err(|_| BackendError::LockPoisoned)?;
        if schedules.contains_key(&record.id) && !overwrite {
            return Err(BackendError::ScheduleConflict(record.id));
        }
        schedules.insert(record.id.clone(), record);
        Ok(())
    }

    async fn schedule(&self, id: &ScheduleId) -> Result<ScheduleRecord, BackendError> {
        let schedules = self
            .schedules
            .read()
            .map_err(|_| BackendError::LockPoisoned)?;
        schedules
            .get(id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("schedule: {}", id)))
    }

    async fn cancel_schedule(&self, id: &ScheduleId) -> Result<(), BackendError> {
        let mut schedules = self
            .schedules
            .write()
            .map_err(|_| BackendError::LockPoisoned)?;
        schedules.remove(id);
        Ok(())
    }

    async fn pause_schedule(&self, id: &ScheduleId) -> Result<(), BackendError> {
        let mut schedules = self
            .schedules
            .write()
            .map_err(|_| BackendError::LockPoisoned)?;
        let record = schedules
            .get_mut(id)
            .ok_or_else(|| BackendError::NotFound(format!("schedule: {}", id)))?;
        if record.enabled {
            record.enabled = false;
            record.touch();
        }
        Ok(())
    }

    async fn resume_schedule(&self, id: &ScheduleId) -> Result<(), BackendError> {
        let mut schedules = self
            .schedules
            .write()
            .map_err(|_| BackendError::LockPoisoned)?;
        let record = schedules
            .get_mut(id)
            .ok_or_else(|| BackendError::NotFound(format!("schedule: {}", id)))?;
        if !record.enabled {
            record.enabled = true;
            // Skip occurrences that elapsed while paused.
            record.next_fire_at = record.trigger.next_after(Utc::now())?;
            record.touch();
        }
        Ok(())
    }

    async fn list_schedules(
        &self,
        filter: &ScheduleFilter,
    ) -> Result<Vec<ScheduleRecord>, BackendError> {
        let schedules = self
            .schedules
            .read()
            .map_err(|_| BackendError::LockPoisoned)?;
        let mut result: Vec<_> = schedules
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(result)
    }

    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleRecord>, BackendError> {
        let schedules = self
            .schedules
            .read()
            .map_err(|_| BackendError::LockPoisoned)?;
        let mut due: Vec<_> = schedules
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_fire_at);
        Ok(due)
    }

    async fn advance_schedule(
        &self,
        id: &ScheduleId,
        fired_at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, BackendError> {
        let mut schedules = self
            .schedules
            .write()
            .map_err(|_| BackendError::LockPoisoned)?;
        let record = schedules
            .get_mut(id)
            .ok_or_else(|| BackendError::NotFound(format!("schedule: {}", id)))?;

        let next = record.trigger.next_after(fired_at)?;
        record.next_fire_at = next;
        if next.is_none() {
            // One-shot date schedules stay registered but never fire again.
            record.enabled = false;
        }
        record.touch();
        Ok(next)
    }
}
