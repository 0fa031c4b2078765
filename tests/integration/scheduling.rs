//! Schedule registration and firing, end to end.

use millrace::testing::ScriptedExecutor;
use millrace::{
    BackendError, InMemoryBackend, JobState, JobTemplate, QueueBackend, RawTrigger, RegistryError,
    ScheduleFilter, ScheduleRegistry, Scheduler, SqliteBackend, TriggerSpec, WorkerPool,
};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{wait_for_fired_jobs, wait_for_job_state};

#[tokio::test]
async fn test_interval_schedule_fires_and_job_succeeds() {
    let backend: Arc<dyn QueueBackend> = Arc::new(InMemoryBackend::new());
    let registry = ScheduleRegistry::new(Arc::clone(&backend));

    registry
        .register_raw(
            &RawTrigger::interval_secs(1),
            JobTemplate::new("etl"),
            None,
            false,
        )
        .await
        .unwrap();

    let executor = ScriptedExecutor::new();
    let (scheduler_handle, scheduler_task) = Scheduler::new(Arc::clone(&backend))
        .with_tick_interval(Duration::from_millis(50))
        .start()
        .await;
    let (worker_handle, worker_task) = WorkerPool::new(Arc::clone(&backend), executor.clone())
        .with_poll_interval(Duration::from_millis(20))
        .start()
        .await;

    let jobs = wait_for_fired_jobs(backend.as_ref(), 1, Duration::from_secs(5)).await;
    let record =
        wait_for_job_state(backend.as_ref(), &jobs[0].id, JobState::Succeeded, Duration::from_secs(5))
            .await;
    assert!(record.schedule_id.is_some());
    assert_eq!(record.attempt, 0);

    scheduler_handle.shutdown().await.unwrap();
    worker_handle.shutdown().await;
    scheduler_task.await.unwrap();
    worker_task.await.unwrap();

    assert!(executor.invocation_count("etl").await >= 1);
}

#[tokio::test]
async fn test_reregistration_conflicts_then_overwrites() {
    let backend: Arc<dyn QueueBackend> = Arc::new(InMemoryBackend::new());
    let registry = ScheduleRegistry::new(Arc::clone(&backend));

    let id = registry
        .register_raw(
            &RawTrigger::interval_secs(60),
            JobTemplate::new("etl"),
            None,
            false,
        )
        .await
        .unwrap();

    // Identical registration derives the identical id and conflicts.
    let err = registry
        .register_raw(
            &RawTrigger::interval_secs(60),
            JobTemplate::new("etl"),
            None,
            false,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Backend(BackendError::ScheduleConflict(_))
    ));

    // Overwrite with the explicit id replaces the trigger; a subsequent
    // lookup sees the new one.
    registry
        .register_raw(
            &RawTrigger::interval_str("5m"),
            JobTemplate::new("etl"),
            Some(id.clone()),
            true,
        )
        .await
        .unwrap();

    let stored = backend.schedule(&id).await.unwrap();
    match stored.trigger {
        TriggerSpec::Interval { every } => assert_eq!(every.as_secs(), 300),
        other => panic!("expected interval trigger, got {:?}", other),
    }
}

#[tokio::test]
async fn test_paused_schedule_does_not_fire_until_resumed() {
    let backend: Arc<dyn QueueBackend> = Arc::new(InMemoryBackend::new());
    let registry = ScheduleRegistry::new(Arc::clone(&backend));

    let id = registry
        .register_raw(
            &RawTrigger::interval_secs(1),
            JobTemplate::new("etl"),
            None,
            false,
        )
        .await
        .unwrap();
    registry.pause(&id).await.unwrap();

    let (scheduler_handle, scheduler_task) = Scheduler::new(Arc::clone(&backend))
        .with_tick_interval(Duration::from_millis(50))
        .start()
        .await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let jobs = backend.list_jobs(&Default::default()).await.unwrap();
    assert!(jobs.is_empty(), "paused schedule fired");

    registry.resume(&id).await.unwrap();
    wait_for_fired_jobs(backend.as_ref(), 1, Duration::from_secs(5)).await;

    scheduler_handle.shutdown().await.unwrap();
    scheduler_task.await.unwrap();
}

#[tokio::test]
async fn test_one_shot_date_schedule_fires_once_and_disables() {
    let backend: Arc<dyn QueueBackend> = Arc::new(InMemoryBackend::new());
    let registry = ScheduleRegistry::new(Arc::clone(&backend));

    let at = chrono::Utc::now() + chrono::Duration::milliseconds(300);
    let id = registry
        .register_raw(
            &RawTrigger::date(at.to_rfc3339()),
            JobTemplate::new("oneshot"),
            None,
            false,
        )
        .await
        .unwrap();

    let (scheduler_handle, scheduler_task) = Scheduler::new(Arc::clone(&backend))
        .with_tick_interval(Duration::from_millis(50))
        .start()
        .await;

    wait_for_fired_jobs(backend.as_ref(), 1, Duration::from_secs(5)).await;

    // Give the loop a few more ticks: no second job may appear.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let jobs = backend.list_jobs(&Default::default()).await.unwrap();
    assert_eq!(jobs.len(), 1);

    let stored = backend.schedule(&id).await.unwrap();
    assert!(!stored.enabled);
    assert!(stored.next_fire_at.is_none());

    scheduler_handle.shutdown().await.unwrap();
    scheduler_task.await.unwrap();
}

#[tokio::test]
async fn test_schedules_survive_sqlite_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");

    let id = {
        let backend: Arc<dyn QueueBackend> = Arc::new(SqliteBackend::new(&path).await.unwrap());
        let registry = ScheduleRegistry::new(Arc::clone(&backend));
        registry
            .register_raw(
                &RawTrigger::cron("0 6 * * *"),
                JobTemplate::new("nightly"),
                None,
                false,
            )
            .await
            .unwrap()
    };

    // A fresh process over the same file sees the schedule.
    let reopened = SqliteBackend::new(&path).await.unwrap();
    let stored = reopened.schedule(&id).await.unwrap();
    assert_eq!(stored.template.pipeline.as_str(), "nightly");
    assert!(stored.enabled);

    let listed = reopened.list_schedules(&ScheduleFilter::enabled()).await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn test_ad_hoc_jobs_carry_no_schedule() {
    let backend: Arc<dyn QueueBackend> = Arc::new(InMemoryBackend::new());

    let job_id = backend
        .enqueue(JobTemplate::new("adhoc"), None)
        .await
        .unwrap();

    let executor = ScriptedExecutor::new();
    let (worker_handle, worker_task) = WorkerPool::new(Arc::clone(&backend), executor)
        .with_poll_interval(Duration::from_millis(20))
        .start()
        .await;

    let record =
        wait_for_job_state(backend.as_ref(), &job_id, JobState::Succeeded, Duration::from_secs(5))
            .await;
    assert!(record.schedule_id.is_none());

    worker_handle.shutdown().await;
    worker_task.await.unwrap();
}
