//! I/O deadline decorator for backends.
//!
//! Backend calls may block on transport I/O; [`TimedBackend`] wraps every
//! operation of an inner backend with one caller-supplied deadline and
//! reports an elapsed deadline as [`BackendError::Unavailable`] — a
//! timeout is an infrastructure condition, not a job failure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::{BackendError, JobFilter, QueueBackend, ScheduleFilter};
use crate::core::job::{JobRecord, JobTemplate, ScheduleRecord};
use crate::core::types::{JobId, ScheduleId};

/// Applies a per-call deadline to an inner backend.
#[derive(Clone)]
pub struct TimedBackend {
    inner: Arc<dyn QueueBackend>,
    deadline: Duration,
}

impl TimedBackend {
    /// Wrap a backend with a per-call deadline.
    pub fn new(inner: Arc<dyn QueueBackend>, deadline: Duration) -> Self {
        Self { inner, deadline }
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &Arc<dyn QueueBackend> {
        &self.inner
    }

    async fn timed<T, F>(&self, operation: &'static str, fut: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, BackendError>> + Send,
    {
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Unavailable(format!(
                "{} timed out after {:?}",
                operation, self.deadline
            ))),
        }
    }
}

#[async_trait]
impl QueueBackend for TimedBackend {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn enqueue(
        &self,
        template: JobTemplate,
        schedule_id: Option<ScheduleId>,
    ) -> Result<JobId, BackendError> {
        self.timed("enqueue", self.inner.enqueue(template, schedule_id))
            .await
    }

    async fn job(&self, id: &JobId) -> Result<JobRecord, BackendError> {
        self.timed("job", self.inner.job(id)).await
    }

    async fn update_job(&self, record: &JobRecord) -> Result<(), BackendError> {
        self.timed("update_job", self.inner.update_job(record)).await
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<JobRecord>, BackendError> {
        self.timed("claim_next", self.inner.claim_next(queue)).await
    }

    async fn cancel_job(&self, id: &JobId) -> Result<(), BackendError> {
        self.timed("cancel_job", self.inner.cancel_job(id)).await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, BackendError> {
        self.timed("list_jobs", self.inner.list_jobs(filter)).await
    }

    async fn register_schedule(
        &self,
        record: ScheduleRecord,
        overwrite: bool,
    ) -> Result<(), BackendError> {
        self.timed(
            "register_schedule",
            self.inner.register_schedule(record, overwrite),
        )
        .await
    }

    async fn schedule(&self, id: &ScheduleId) -> Result<ScheduleRecord, BackendError> {
        self.timed("schedule", self.inner.schedule(id)).await
    }

    async fn cancel_schedule(&self, id: &ScheduleId) -> Result<(), BackendError> {
        self.timed("cancel_schedule", self.inner.cancel_schedule(id))
            .await
    }

    async fn pause_schedule(&self, id: &ScheduleId) -> Result<(), BackendError> {
        self.timed("pause_schedule", self.inner.pause_schedule(id))
            .await
    }

    async fn resume_schedule(&self, id: &ScheduleId) -> Result<(), BackendError> {
        self.timed("resume_schedule", self.inner.resume_schedule(id))
            .await
    }

    async fn list_schedules(
        &self,
        filter: &ScheduleFilter,
    ) -> Result<Vec<ScheduleRecord>, BackendError> {
        self.timed("list_schedules", self.inner.list_schedules(filter))
            .await
    }

    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleRecord>, BackendError> {
        self.timed("due_schedules", self.inner.due_schedules(now))
            .await
    }

    async fn advance_schedule(
        &self,
        id: &ScheduleId,
        fired_at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, BackendError> {
        self.timed(
            "advance_schedule",
            self.inner.advance_schedule(id, fired_at),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;

    /// Backend stub whose claim call never completes.
    struct StuckBackend {
        inner: InMemoryBackend,
    }

    #[async_trait]
    impl QueueBackend for StuckBackend {
        fn name(&self) -> &'static str {
            "stuck"
        }

        async fn enqueue(
            &self,
            template: JobTemplate,
            schedule_id: Option<ScheduleId>,
        ) -> Result<JobId, BackendError> {
            self.inner.enqueue(template, schedule_id).await
        }

        async fn job(&self, id: &JobId) -> Result<JobRecord, BackendError> {
            self.inner.job(id).await
        }

        async fn update_job(&self, record: &JobRecord) -> Result<(), BackendError> {
            self.inner.update_job(record).await
        }

        async fn claim_next(&self, _queue: &str) -> Result<Option<JobRecord>, BackendError> {
            std::future::pending().await
        }

        async fn cancel_job(&self, id: &JobId) -> Result<(), BackendError> {
            self.inner.cancel_job(id).await
        }

        async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, BackendError> {
            self.inner.list_jobs(filter).await
        }

        async fn register_schedule(
            &self,
            record: ScheduleRecord,
            overwrite: bool,
        ) -> Result<(), BackendError> {
            self.inner.register_schedule(record, overwrite).await
        }

        async fn schedule(&self, id: &ScheduleId) -> Result<ScheduleRecord, BackendError> {
            self.inner.schedule(id).await
        }

        async fn cancel_schedule(&self, id: &ScheduleId) -> Result<(), BackendError> {
            self.inner.cancel_schedule(id).await
        }

        async fn pause_schedule(&self, id: &ScheduleId) -> Result<(), BackendError> {
            self.inner.pause_schedule(id).await
        }

        async fn resume_schedule(&self, id: &ScheduleId) -> Result<(), BackendError> {
            self.inner.resume_schedule(id).await
        }

        async fn list_schedules(
            &self,
            filter: &ScheduleFilter,
        ) -> Result<Vec<ScheduleRecord>, BackendError> {
            self.inner.list_schedules(filter).await
        }

        async fn due_schedules(
            &self,
            now: DateTime<Utc>,
        ) -> Result<Vec<ScheduleRecord>, BackendError> {
            self.inner.due_schedules(now).await
        }

        async fn advance_schedule(
            &self,
            id: &ScheduleId,
            fired_at: DateTime<Utc>,
        ) -> Result<Option<DateTime<Utc>>, BackendError> {
            self.inner.advance_schedule(id, fired_at).await
        }
    }

    #[tokio::test]
    async fn test_elapsed_deadline_is_unavailable() {
        let stuck = Arc::new(StuckBackend {
            inner: InMemoryBackend::new(),
        });
        let timed = TimedBackend::new(stuck, Duration::from_millis(20));

        let err = timed.claim_next("default").await.unwrap_err();
        match err {
            BackendError::Unavailable(msg) => assert!(msg.contains("claim_next")),
            other => panic!("expected Unavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fast_calls_pass_through() {
        let inner = Arc::new(InMemoryBackend::new());
        let timed = TimedBackend::new(inner, Duration::from_secs(5));

        let id = timed.enqueue(JobTemplate::new("p1"), None).await.unwrap();
        let record = timed.job(&id).await.unwrap();
        assert_eq!(record.id, id);
        assert_eq!(timed.name(), "memory");
    }
}
