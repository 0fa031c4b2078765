//! Retry orchestration around failing pipeline invocations.

use millrace::testing::ScriptedExecutor;
use millrace::{
    ErrorKindRegistry, InMemoryBackend, JobState, JobTemplate, QueueBackend, RawTrigger,
    RetryPolicy, ScheduleRegistry, Scheduler, WorkerPool,
};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{wait_for_fired_jobs, wait_for_job_state};

#[tokio::test]
async fn test_scheduled_job_retries_twice_then_succeeds() {
    let backend: Arc<dyn QueueBackend> = Arc::new(InMemoryBackend::new());
    let registry = ScheduleRegistry::new(Arc::clone(&backend));

    let template = JobTemplate::new("flaky")
        .with_retry(RetryPolicy::new(2, Duration::from_millis(20)));
    let id = registry
        .register_raw(&RawTrigger::interval_secs(30), template, None, false)
        .await
        .unwrap();

    let executor = ScriptedExecutor::new();
    executor.fail_n_times("flaky", 2, "Transient").await;

    let (scheduler_handle, scheduler_task) = Scheduler::new(Arc::clone(&backend))
        .with_tick_interval(Duration::from_millis(50))
        .start()
        .await;
    let (worker_handle, worker_task) = WorkerPool::new(Arc::clone(&backend), executor.clone())
        .with_poll_interval(Duration::from_millis(20))
        .start()
        .await;

    // 30-second interval: fire it now instead of waiting out the timer.
    let job_id = scheduler_handle.trigger_now(id).await.unwrap();

    let record =
        wait_for_job_state(backend.as_ref(), &job_id, JobState::Succeeded, Duration::from_secs(5))
            .await;

    // Two retries were consumed before the success.
    assert_eq!(record.attempt, 2);
    assert_eq!(record.last_failure.unwrap().kind, "Transient");
    assert_eq!(executor.invocation_count("flaky").await, 3);

    scheduler_handle.shutdown().await.unwrap();
    worker_handle.shutdown().await;
    scheduler_task.await.unwrap();
    worker_task.await.unwrap();
}

#[tokio::test]
async fn test_exhausted_retries_report_last_error_and_attempts() {
    let backend: Arc<dyn QueueBackend> = Arc::new(InMemoryBackend::new());

    let template = JobTemplate::new("doomed")
        .with_retry(RetryPolicy::new(2, Duration::from_millis(10)));
    let job_id = backend.enqueue(template, None).await.unwrap();

    let executor = ScriptedExecutor::new();
    executor.fail_n_times("doomed", 10, "Timeout").await;

    let (worker_handle, worker_task) = WorkerPool::new(Arc::clone(&backend), executor.clone())
        .with_poll_interval(Duration::from_millis(20))
        .start()
        .await;

    let record =
        wait_for_job_state(backend.as_ref(), &job_id, JobState::Failed, Duration::from_secs(5))
            .await;

    assert_eq!(record.attempt, 2);
    let failure = record.last_failure.unwrap();
    assert_eq!(failure.kind, "Timeout");
    assert!(!failure.message.is_empty());
    // Initial attempt plus two retries, nothing more.
    assert_eq!(executor.invocation_count("doomed").await, 3);

    worker_handle.shutdown().await;
    worker_task.await.unwrap();
}

#[tokio::test]
async fn test_error_kind_filter_blocks_retry_for_other_kinds() {
    let backend: Arc<dyn QueueBackend> = Arc::new(InMemoryBackend::new());
    let kinds = ErrorKindRegistry::with_builtins();

    let policy = RetryPolicy::new(3, Duration::from_millis(10))
        .with_retryable(["Timeout"], &kinds)
        .unwrap();
    let job_id = backend
        .enqueue(JobTemplate::new("strict").with_retry(policy), None)
        .await
        .unwrap();

    let executor = ScriptedExecutor::new();
    executor.fail_n_times("strict", 1, "DataError").await;

    let (worker_handle, worker_task) = WorkerPool::new(Arc::clone(&backend), executor.clone())
        .with_poll_interval(Duration::from_millis(20))
        .start()
        .await;

    let record =
        wait_for_job_state(backend.as_ref(), &job_id, JobState::Failed, Duration::from_secs(5))
            .await;

    // DataError is not in the retryable set: one attempt, no retries.
    assert_eq!(record.attempt, 0);
    assert_eq!(executor.invocation_count("strict").await, 1);

    worker_handle.shutdown().await;
    worker_task.await.unwrap();
}

#[tokio::test]
async fn test_retrying_state_is_visible_mid_flight() {
    let backend: Arc<dyn QueueBackend> = Arc::new(InMemoryBackend::new());

    let template = JobTemplate::new("slow-retry")
        .with_retry(RetryPolicy::new(1, Duration::from_secs(2)));
    let job_id = backend.enqueue(template, None).await.unwrap();

    let executor = ScriptedExecutor::new();
    executor.fail_n_times("slow-retry", 1, "Transient").await;

    let (worker_handle, worker_task) = WorkerPool::new(Arc::clone(&backend), executor)
        .with_poll_interval(Duration::from_millis(20))
        .start()
        .await;

    // While the runner sleeps out the delay the job reads as retrying.
    let record =
        wait_for_job_state(backend.as_ref(), &job_id, JobState::Retrying, Duration::from_secs(5))
            .await;
    assert_eq!(record.last_failure.unwrap().kind, "Transient");

    wait_for_job_state(backend.as_ref(), &job_id, JobState::Succeeded, Duration::from_secs(10))
        .await;

    worker_handle.shutdown().await;
    worker_task.await.unwrap();
}

#[tokio::test]
async fn test_schedule_fires_with_retry_policy_from_template() {
    let backend: Arc<dyn QueueBackend> = Arc::new(InMemoryBackend::new());
    let registry = ScheduleRegistry::new(Arc::clone(&backend));

    let template = JobTemplate::new("resilient")
        .with_retry(RetryPolicy::new(1, Duration::from_millis(10)));
    registry
        .register_raw(&RawTrigger::interval_secs(1), template, None, false)
        .await
        .unwrap();

    let executor = ScriptedExecutor::new();
    executor.fail_n_times("resilient", 1, "ConnectionError").await;

    let (scheduler_handle, scheduler_task) = Scheduler::new(Arc::clone(&backend))
        .with_tick_interval(Duration::from_millis(50))
        .start()
        .await;
    let (worker_handle, worker_task) = WorkerPool::new(Arc::clone(&backend), executor)
        .with_poll_interval(Duration::from_millis(20))
        .start()
        .await;

    let jobs = wait_for_fired_jobs(backend.as_ref(), 1, Duration::from_secs(5)).await;
    let record = wait_for_job_state(
        backend.as_ref(),
        &jobs[0].id,
        JobState::Succeeded,
        Duration::from_secs(5),
    )
    .await;

    // The fired job inherited the schedule's retry policy.
    assert_eq!(record.attempt, 1);

    scheduler_handle.shutdown().await.unwrap();
    worker_handle.shutdown().await;
    scheduler_task.await.unwrap();
    worker_task.await.unwrap();
}
