//! Cooperative cancellation at the interruption points.

use millrace::testing::ScriptedExecutor;
use millrace::{
    InMemoryBackend, JobState, JobTemplate, QueueBackend, RetryPolicy, WorkerPool,
};
use std::sync::Arc;
use std::time::Duration;

use crate::common::wait_for_job_state;

#[tokio::test]
async fn test_cancel_during_retry_sleep_stops_the_job() {
    let backend: Arc<dyn QueueBackend> = Arc::new(InMemoryBackend::new());

    // Long retry delay so the cancel lands mid-sleep.
    let template = JobTemplate::new("sleeper")
        .with_retry(RetryPolicy::new(5, Duration::from_secs(60)));
    let job_id = backend.enqueue(template, None).await.unwrap();

    let executor = ScriptedExecutor::new();
    executor.fail_n_times("sleeper", 10, "Transient").await;

    let (worker_handle, worker_task) = WorkerPool::new(Arc::clone(&backend), executor.clone())
        .with_poll_interval(Duration::from_millis(20))
        .with_cancel_poll_interval(Duration::from_millis(20))
        .start()
        .await;

    wait_for_job_state(backend.as_ref(), &job_id, JobState::Retrying, Duration::from_secs(5))
        .await;
    backend.cancel_job(&job_id).await.unwrap();

    let record =
        wait_for_job_state(backend.as_ref(), &job_id, JobState::Cancelled, Duration::from_secs(5))
            .await;
    assert!(record.finished_at.is_some());

    // The sleep was interrupted: exactly the one attempt ran.
    assert_eq!(executor.invocation_count("sleeper").await, 1);

    // The terminal state is immutable; no success or failure follows.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let settled = backend.job(&job_id).await.unwrap();
    assert_eq!(settled.state, JobState::Cancelled);

    worker_handle.shutdown().await;
    worker_task.await.unwrap();
}

#[tokio::test]
async fn test_cancel_queued_job_never_runs() {
    let backend: Arc<dyn QueueBackend> = Arc::new(InMemoryBackend::new());

    let job_id = backend
        .enqueue(JobTemplate::new("never"), None)
        .await
        .unwrap();
    backend.cancel_job(&job_id).await.unwrap();

    let executor = ScriptedExecutor::new();
    let (worker_handle, worker_task) = WorkerPool::new(Arc::clone(&backend), executor.clone())
        .with_poll_interval(Duration::from_millis(20))
        .start()
        .await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    let record = backend.job(&job_id).await.unwrap();
    assert_eq!(record.state, JobState::Cancelled);
    assert_eq!(executor.invocation_count("never").await, 0);

    worker_handle.shutdown().await;
    worker_task.await.unwrap();
}

#[tokio::test]
async fn test_cancel_is_idempotent_on_terminal_job() {
    let backend: Arc<dyn QueueBackend> = Arc::new(InMemoryBackend::new());

    let job_id = backend
        .enqueue(JobTemplate::new("done"), None)
        .await
        .unwrap();

    let executor = ScriptedExecutor::new();
    let (worker_handle, worker_task) = WorkerPool::new(Arc::clone(&backend), executor)
        .with_poll_interval(Duration::from_millis(20))
        .start()
        .await;

    wait_for_job_state(backend.as_ref(), &job_id, JobState::Succeeded, Duration::from_secs(5))
        .await;

    // Cancelling a finished job must not disturb its terminal state.
    backend.cancel_job(&job_id).await.unwrap();
    backend.cancel_job(&job_id).await.unwrap();

    let record = backend.job(&job_id).await.unwrap();
    assert_eq!(record.state, JobState::Succeeded);

    worker_handle.shutdown().await;
    worker_task.await.unwrap();
}
