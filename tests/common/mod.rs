//! Common test utilities shared across integration tests.

use millrace::{JobFilter, JobId, JobRecord, JobState, QueueBackend};
use std::time::Duration;

/// Wait for a job to reach an expected state, polling the backend.
///
/// More reliable than fixed sleeps since execution time can vary. Polls
/// every 10ms and times out after the specified duration.
///
/// # Panics
///
/// Panics if the timeout is reached before the job reaches the expected
/// state.
pub async fn wait_for_job_state(
    backend: &dyn QueueBackend,
    job_id: &JobId,
    expected: JobState,
    timeout: Duration,
) -> JobRecord {
    let start = tokio::time::Instant::now();
    loop {
        let record = backend.job(job_id).await.unwrap();
        if record.state == expected {
            return record;
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for job {} to reach {:?}, current state: {:?}",
                job_id, expected, record.state
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until a schedule has fired at least `count` jobs.
pub async fn wait_for_fired_jobs(
    backend: &dyn QueueBackend,
    count: usize,
    timeout: Duration,
) -> Vec<JobRecord> {
    let start = tokio::time::Instant::now();
    loop {
        let jobs = backend.list_jobs(&JobFilter::all()).await.unwrap();
        if jobs.len() >= count {
            return jobs;
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for {} fired job(s), have {}",
                count,
                jobs.len()
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
