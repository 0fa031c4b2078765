//! Scheduler engine implementation.
//!
//! One lightweight timer loop per backend with scheduler capability:
//! each tick fetches the schedules due now (soonest first), enqueues one
//! job per due schedule, and advances the schedule's next fire time.
//! Control flows through a command channel — manual triggers, pause,
//! resume, shutdown — exactly one task owns the loop and nothing shares
//! mutable state with the workers; coordination happens entirely through
//! the backend's store.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::backend::{BackendError, QueueBackend};
use crate::core::types::{JobId, ScheduleId};
use crate::events::{Event, EventBus};

/// Buffer size for the command channel between handle and engine.
const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Backend error.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Command channel error.
    #[error("channel error: {0}")]
    ChannelError(String),
}

/// State of the scheduler loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Scheduler is stopped.
    Stopped,
    /// Scheduler is evaluating schedules.
    Running,
    /// Scheduler is paused; nothing fires, manual triggers still work.
    Paused,
}

/// Commands that can be sent to the scheduler.
enum SchedulerCommand {
    /// Fire a schedule immediately, regardless of its timer.
    TriggerNow {
        schedule_id: ScheduleId,
        response: oneshot::Sender<Result<JobId, SchedulerError>>,
    },
    /// Pause schedule evaluation.
    Pause { response: oneshot::Sender<()> },
    /// Resume schedule evaluation.
    Resume { response: oneshot::Sender<()> },
    /// Shut the loop down.
    Shutdown { response: oneshot::Sender<()> },
}

/// Handle for controlling a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<SchedulerCommand>,
    state: Arc<RwLock<SchedulerState>>,
}

impl SchedulerHandle {
    async fn send_unit_command(
        &self,
        build: impl FnOnce(oneshot::Sender<()>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<(), SchedulerError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx.send(build(response_tx)).await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to send {} command", operation))
        })?;
        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })?;
        Ok(())
    }

    /// Fire a schedule immediately. Works while paused.
    pub async fn trigger_now(
        &self,
        schedule_id: impl Into<ScheduleId>,
    ) -> Result<JobId, SchedulerError> {
        let schedule_id = schedule_id.into();
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(SchedulerCommand::TriggerNow {
                schedule_id,
                response: response_tx,
            })
            .await
            .map_err(|_| SchedulerError::ChannelError("failed to send trigger command".into()))?;
        response_rx
            .await
            .map_err(|_| SchedulerError::ChannelError("failed to receive trigger response".into()))?
    }

    /// Pause schedule evaluation.
    pub async fn pause(&self) -> Result<(), SchedulerError> {
        self.send_unit_command(|response| SchedulerCommand::Pause { response }, "pause")
            .await
    }

    /// Resume schedule evaluation after a pause.
    pub async fn resume(&self) -> Result<(), SchedulerError> {
        self.send_unit_command(|response| SchedulerCommand::Resume { response }, "resume")
            .await
    }

    /// Shut the scheduler down.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.send_unit_command(
            |response| SchedulerCommand::Shutdown { response },
            "shutdown",
        )
        .await
    }

    /// Get the current scheduler state.
    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    /// Check if the scheduler is evaluating schedules.
    pub async fn is_running(&self) -> bool {
        *self.state.read().await == SchedulerState::Running
    }
}

/// Timer engine over one backend.
pub struct Scheduler {
    backend: Arc<dyn QueueBackend>,
    event_bus: Arc<EventBus>,
    tick_interval: Duration,
}

impl Scheduler {
    /// Create a scheduler over a backend.
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            backend,
            event_bus: Arc::new(EventBus::new()),
            tick_interval: Duration::from_secs(1),
        }
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Set the tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Get the event bus.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Start the loop and return a handle for controlling it.
    pub async fn start(self) -> (SchedulerHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let state = Arc::new(RwLock::new(SchedulerState::Running));

        let handle = SchedulerHandle {
            command_tx,
            state: Arc::clone(&state),
        };

        let engine_task = tokio::spawn(async move {
            self.run(command_rx, state).await;
        });

        (handle, engine_task)
    }

    /// Main loop.
    async fn run(
        self,
        mut command_rx: mpsc::Receiver<SchedulerCommand>,
        state: Arc<RwLock<SchedulerState>>,
    ) {
        let mut interval = tokio::time::interval(self.tick_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let current_state = *state.read().await;
                    if current_state == SchedulerState::Running {
                        self.fire_due_schedules().await;
                    }
                }

                Some(command) = command_rx.recv() => {
                    match command {
                        SchedulerCommand::TriggerNow { schedule_id, response } => {
                            let result = self.fire_schedule_now(&schedule_id).await;
                            let _ = response.send(result);
                        }
                        SchedulerCommand::Pause { response } => {
                            *state.write().await = SchedulerState::Paused;
                            tracing::info!("Scheduler paused");
                            let _ = response.send(());
                        }
                        SchedulerCommand::Resume { response } => {
                            *state.write().await = SchedulerState::Running;
                            tracing::info!("Scheduler resumed");
                            let _ = response.send(());
                        }
                        SchedulerCommand::Shutdown { response } => {
                            *state.write().await = SchedulerState::Stopped;
                            let _ = response.send(());
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Enqueue one job per due schedule and advance fire times.
    ///
    /// A schedule fires at most once per tick no matter how many
    /// occurrences elapsed since the last evaluation — advancing from
    /// `now` collapses any missed occurrences instead of bursting
    /// catch-up jobs.
    async fn fire_due_schedules(&self) {
        let now = chrono::Utc::now();
        let due = match self.backend.due_schedules(now).await {
            Ok(due) => due,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to fetch due schedules");
                return;
            }
        };

        for schedule in due {
            tracing::info!(schedule_id = %schedule.id, "Schedule due, enqueueing job");

            match self
                .backend
                .enqueue(schedule.template.clone(), Some(schedule.id.clone()))
                .await
            {
                Ok(job_id) => {
                    self.event_bus
                        .emit(Event::job_enqueued(job_id, Some(schedule.id.clone())))
                        .await;
                }
                Err(e) => {
                    tracing::warn!(schedule_id = %schedule.id, error = %e, "Failed to enqueue scheduled job");
                    // Leave next_fire_at alone so the next tick retries.
                    continue;
                }
            }

            if let Err(e) = self.backend.advance_schedule(&schedule.id, now).await {
                tracing::warn!(schedule_id = %schedule.id, error = %e, "Failed to advance schedule");
            }
        }
    }

    /// Fire one schedule immediately without touching its timer.
    async fn fire_schedule_now(&self, id: &ScheduleId) -> Result<JobId, SchedulerError> {
        let schedule = self.backend.schedule(id).await?;
        let job_id = self
            .backend
            .enqueue(schedule.template, Some(schedule.id.clone()))
            .await?;
        self.event_bus
            .emit(Event::job_enqueued(job_id, Some(schedule.id)))
            .await;
        Ok(job_id)
    }
}
