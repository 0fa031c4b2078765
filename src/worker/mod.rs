//! Job execution wrapper and worker pool.
//!
//! [`JobRunner`] drives one claimed job through its state machine,
//! wrapping the external engine call with the job's retry policy:
//! `running → succeeded`, `running → retrying → running` while the
//! policy allows, `running → failed` when it doesn't, and
//! `→ cancelled` at either interruption point (before an attempt, or
//! during the retry sleep — the only intentional suspension point in
//! this crate, and it is cancellable). A running attempt itself is never
//! pre-empted.
//!
//! [`WorkerPool`] claims queued jobs up to a concurrency bound and runs
//! each in its own task, propagating backend cancel requests to the
//! per-job cancellation token.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::QueueBackend;
use crate::core::job::{DEFAULT_QUEUE, JobFailure, JobRecord, JobState};
use crate::core::types::JobId;
use crate::events::{Event, EventBus};
use crate::pipeline::PipelineExecutor;

/// Buffer size for the pool's command channel.
const COMMAND_CHANNEL_BUFFER: usize = 8;

/// How often a sleeping runner re-checks the backend's cancel flag.
const DEFAULT_CANCEL_POLL: Duration = Duration::from_millis(250);

/// Executes one claimed job to a terminal state.
pub struct JobRunner {
    backend: Arc<dyn QueueBackend>,
    executor: Arc<dyn PipelineExecutor>,
    event_bus: Arc<EventBus>,
    cancel_poll_interval: Duration,
}

impl JobRunner {
    /// Create a runner over a backend and executor.
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        executor: Arc<dyn PipelineExecutor>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            backend,
            executor,
            event_bus,
            cancel_poll_interval: DEFAULT_CANCEL_POLL,
        }
    }

    /// Set how often a sleeping runner polls for cancellation.
    pub fn with_cancel_poll_interval(mut self, interval: Duration) -> Self {
        self.cancel_poll_interval = interval;
        self
    }

    /// Run a claimed job to a terminal state, returning it.
    ///
    /// `record` must already be in `running` state (the claim did that).
    pub async fn run(&self, mut record: JobRecord, token: CancellationToken) -> JobState {
        loop {
            // Interruption point: before an attempt is issued.
            if self.cancel_requested(&record, &token).await {
                return self.finish_cancelled(&mut record).await;
            }

            self.event_bus
                .emit(Event::job_started(record.id, record.attempt))
                .await;
            tracing::debug!(job_id = %record.id, attempt = record.attempt, "Starting attempt");

            let result = self
                .executor
                .execute(
                    &record.template.pipeline,
                    &record.template.inputs,
                    &record.template.config,
                    &record.template.final_vars,
                )
                .await;

            let error = match result {
                Ok(_) => {
                    record.mark_succeeded();
                    self.persist(&record).await;
                    self.event_bus
                        .emit(Event::job_succeeded(record.id, record.attempt))
                        .await;
                    tracing::info!(job_id = %record.id, attempts = record.attempt, "Job succeeded");
                    return JobState::Succeeded;
                }
                Err(error) => error,
            };

            // A cancel that landed during the attempt stops retries; the
            // attempt itself was allowed to finish.
            if self.cancel_requested(&record, &token).await {
                return self.finish_cancelled(&mut record).await;
            }

            let policy = record.template.retry.clone();
            if !policy.should_retry(record.attempt, &error.kind) {
                record.mark_failed(JobFailure::new(&error.kind, &error.message));
                self.persist(&record).await;
                self.event_bus
                    .emit(Event::job_failed(
                        record.id,
                        &error.kind,
                        &error.message,
                        record.attempt,
                    ))
                    .await;
                tracing::warn!(
                    job_id = %record.id,
                    error_kind = %error.kind,
                    attempts = record.attempt,
                    "Job failed: {}",
                    error.message
                );
                return JobState::Failed;
            }

            let delay = policy.next_delay();
            record.mark_retrying(JobFailure::new(&error.kind, &error.message));
            self.persist(&record).await;
            self.event_bus
                .emit(Event::job_retrying(
                    record.id,
                    record.attempt,
                    &error.kind,
                    delay,
                ))
                .await;
            tracing::info!(
                job_id = %record.id,
                attempt = record.attempt,
                error_kind = %error.kind,
                "Retrying after {:?}",
                delay
            );

            // Interruption point: the retry sleep is cancellable.
            if self.sleep_cancellable(&record.id, delay, &token).await {
                return self.finish_cancelled(&mut record).await;
            }

            record.begin_next_attempt();
            self.persist(&record).await;
        }
    }

    async fn finish_cancelled(&self, record: &mut JobRecord) -> JobState {
        record.mark_cancelled();
        self.persist(record).await;
        self.event_bus.emit(Event::job_cancelled(record.id)).await;
        tracing::info!(job_id = %record.id, "Job cancelled");
        JobState::Cancelled
    }

    /// Check both cancellation paths: the in-process token and the
    /// backend's persisted cancel flag.
    async fn cancel_requested(&self, record: &JobRecord, token: &CancellationToken) -> bool {
        if token.is_cancelled() || record.cancel_requested {
            return true;
        }
        match self.backend.job(&record.id).await {
            Ok(stored) => stored.cancel_requested || stored.state == JobState::Cancelled,
            Err(e) => {
                tracing::warn!(job_id = %record.id, error = %e, "Failed to check cancel flag");
                false
            }
        }
    }

    /// Sleep for `delay`, waking early on cancellation. Returns true if
    /// the job was cancelled during the sleep.
    async fn sleep_cancellable(
        &self,
        id: &JobId,
        delay: Duration,
        token: &CancellationToken,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let slice = remaining.min(self.cancel_poll_interval);

            tokio::select! {
                _ = token.cancelled() => return true,
                _ = tokio::time::sleep(slice) => {
                    match self.backend.job(id).await {
                        Ok(stored)
                            if stored.cancel_requested
                                || stored.state == JobState::Cancelled =>
                        {
                            return true;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(job_id = %id, error = %e, "Failed to poll cancel flag during retry sleep");
                        }
                    }
                }
            }
        }
    }

    async fn persist(&self, record: &JobRecord) {
        if let Err(e) = self.backend.update_job(record).await {
            tracing::warn!(job_id = %record.id, error = %e, "Failed to persist job state");
        }
    }
}

/// Commands that can be sent to the worker pool.
enum WorkerCommand {
    /// Stop claiming and wait for in-flight jobs.
    Shutdown { response: oneshot::Sender<()> },
}

/// Handle for controlling a running worker pool.
#[derive(Clone)]
pub struct WorkerHandle {
    command_tx: mpsc::Sender<WorkerCommand>,
}

impl WorkerHandle {
    /// Shut the pool down, waiting for in-flight jobs up to the pool's
    /// shutdown timeout.
    pub async fn shutdown(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .command_tx
            .send(WorkerCommand::Shutdown {
                response: response_tx,
            })
            .await
            .is_ok()
        {
            let _ = response_rx.await;
        }
    }
}

/// Pool of concurrent workers pulling jobs from the backend.
pub struct WorkerPool {
    backend: Arc<dyn QueueBackend>,
    executor: Arc<dyn PipelineExecutor>,
    event_bus: Arc<EventBus>,
    queues: Vec<String>,
    concurrency: usize,
    poll_interval: Duration,
    shutdown_timeout: Duration,
    cancel_poll_interval: Duration,
}

impl WorkerPool {
    /// Create a pool over a backend and executor.
    pub fn new(backend: Arc<dyn QueueBackend>, executor: Arc<dyn PipelineExecutor>) -> Self {
        Self {
            backend,
            executor,
            event_bus: Arc::new(EventBus::new()),
            queues: vec![DEFAULT_QUEUE.to_string()],
            concurrency: 4,
            poll_interval: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(30),
            cancel_poll_interval: DEFAULT_CANCEL_POLL,
        }
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Set the queues this pool pulls from.
    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = queues;
        self
    }

    /// Set the number of concurrent jobs.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the claim poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set how often sleeping runners poll for cancellation.
    pub fn with_cancel_poll_interval(mut self, interval: Duration) -> Self {
        self.cancel_poll_interval = interval;
        self
    }

    /// Start the pool and return a handle for controlling it.
    pub async fn start(self) -> (WorkerHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let handle = WorkerHandle { command_tx };

        let pool_task = tokio::spawn(async move {
            self.run(command_rx).await;
        });

        (handle, pool_task)
    }

    async fn run(self, mut command_rx: mpsc::Receiver<WorkerCommand>) {
        let runner = Arc::new(
            JobRunner::new(
                Arc::clone(&self.backend),
                Arc::clone(&self.executor),
                Arc::clone(&self.event_bus),
            )
            .with_cancel_poll_interval(self.cancel_poll_interval),
        );
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let running: Arc<RwLock<HashMap<JobId, (CancellationToken, JoinHandle<()>)>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_cancel_requests(&running).await;
                    running.write().await.retain(|_, (_, handle)| !handle.is_finished());
                    self.claim_available(&runner, &semaphore, &running).await;
                }

                Some(command) = command_rx.recv() => {
                    match command {
                        WorkerCommand::Shutdown { response } => {
                            self.await_running_jobs(&running).await;
                            let _ = response.send(());
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Claim queued jobs while permits are available.
    async fn claim_available(
        &self,
        runner: &Arc<JobRunner>,
        semaphore: &Arc<Semaphore>,
        running: &Arc<RwLock<HashMap<JobId, (CancellationToken, JoinHandle<()>)>>>,
    ) {
        while semaphore.available_permits() > 0 {
            let Some(record) = self.claim_one().await else {
                break;
            };

            let permit = Arc::clone(semaphore)
                .acquire_owned()
                .await
                .expect("semaphore closed");
            let token = CancellationToken::new();
            if record.cancel_requested {
                token.cancel();
            }

            let job_id = record.id;
            let runner = Arc::clone(runner);
            let running_map = Arc::clone(running);
            let task_token = token.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                runner.run(record, task_token).await;
                running_map.write().await.remove(&job_id);
            });

            running.write().await.insert(job_id, (token, handle));
        }
    }

    /// Claim the next queued job from the first non-empty queue.
    async fn claim_one(&self) -> Option<JobRecord> {
        for queue in &self.queues {
            match self.backend.claim_next(queue).await {
                Ok(Some(record)) => return Some(record),
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(queue = %queue, error = %e, "Failed to claim job");
                    return None;
                }
            }
        }
        None
    }

    /// Propagate backend cancel requests to in-process tokens.
    async fn sweep_cancel_requests(
        &self,
        running: &Arc<RwLock<HashMap<JobId, (CancellationToken, JoinHandle<()>)>>>,
    ) {
        let snapshot: Vec<(JobId, CancellationToken)> = running
            .read()
            .await
            .iter()
            .filter(|(_, (token, _))| !token.is_cancelled())
            .map(|(id, (token, _))| (*id, token.clone()))
            .collect();

        for (id, token) in snapshot {
            match self.backend.job(&id).await {
                Ok(record) if record.cancel_requested || record.state == JobState::Cancelled => {
                    tracing::info!(job_id = %id, "Propagating cancel request to worker");
                    token.cancel();
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(job_id = %id, error = %e, "Failed to sweep cancel flag");
                }
            }
        }
    }

    /// Wait for in-flight jobs to finish, up to the shutdown timeout.
    async fn await_running_jobs(
        &self,
        running: &Arc<RwLock<HashMap<JobId, (CancellationToken, JoinHandle<()>)>>>,
    ) {
        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;

        loop {
            let remaining = {
                let mut map = running.write().await;
                map.retain(|_, (_, handle)| !handle.is_finished());
                map.len()
            };

            if remaining == 0 {
                tracing::info!("All in-flight jobs finished");
                return;
            }

            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    "Shutdown timeout ({:?}) exceeded with {} job(s) still running",
                    self.shutdown_timeout,
                    remaining
                );
                return;
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
