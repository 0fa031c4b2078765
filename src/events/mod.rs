//! Lifecycle events and event handling.
//!
//! Schedule and job lifecycle events give observers (the CLI's logging
//! handler, tests) a view of what the scheduler and workers are doing
//! without coupling them to either.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::core::types::{JobId, ScheduleId};

/// Lifecycle events emitted by the registry, scheduler, and workers.
#[derive(Debug, Clone)]
pub enum Event {
    /// A schedule was registered (or overwritten).
    ScheduleRegistered {
        schedule_id: ScheduleId,
        timestamp: DateTime<Utc>,
    },

    /// A schedule was paused.
    SchedulePaused {
        schedule_id: ScheduleId,
        timestamp: DateTime<Utc>,
    },

    /// A schedule was resumed.
    ScheduleResumed {
        schedule_id: ScheduleId,
        timestamp: DateTime<Utc>,
    },

    /// A schedule was cancelled and removed.
    ScheduleCancelled {
        schedule_id: ScheduleId,
        timestamp: DateTime<Utc>,
    },

    /// A job entered the queue, either from a fired schedule or an
    /// ad-hoc enqueue.
    JobEnqueued {
        job_id: JobId,
        schedule_id: Option<ScheduleId>,
        timestamp: DateTime<Utc>,
    },

    /// A worker claimed the job and started an attempt.
    JobStarted {
        job_id: JobId,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    /// The job failed and will be retried after a delay.
    JobRetrying {
        job_id: JobId,
        /// The attempt that just failed (initial attempt = 0).
        attempt: u32,
        error_kind: String,
        delay: Duration,
        timestamp: DateTime<Utc>,
    },

    /// The job finished without error.
    JobSucceeded {
        job_id: JobId,
        /// Retries performed before success.
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    /// The job failed terminally.
    JobFailed {
        job_id: JobId,
        error_kind: String,
        error_message: String,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    /// The job was cancelled before completion.
    JobCancelled {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::ScheduleRegistered { timestamp, .. } => *timestamp,
            Event::SchedulePaused { timestamp, .. } => *timestamp,
            Event::ScheduleResumed { timestamp, .. } => *timestamp,
            Event::ScheduleCancelled { timestamp, .. } => *timestamp,
            Event::JobEnqueued { timestamp, .. } => *timestamp,
            Event::JobStarted { timestamp, .. } => *timestamp,
            Event::JobRetrying { timestamp, .. } => *timestamp,
            Event::JobSucceeded { timestamp, .. } => *timestamp,
            Event::JobFailed { timestamp, .. } => *timestamp,
            Event::JobCancelled { timestamp, .. } => *timestamp,
        }
    }

    pub fn schedule_registered(schedule_id: ScheduleId) -> Self {
        Event::ScheduleRegistered {
            schedule_id,
            timestamp: Utc::now(),
        }
    }

    pub fn schedule_paused(schedule_id: ScheduleId) -> Self {
        Event::SchedulePaused {
            schedule_id,
            timestamp: Utc::now(),
        }
    }

    pub fn schedule_resumed(schedule_id: ScheduleId) -> Self {
        Event::ScheduleResumed {
            schedule_id,
            timestamp: Utc::now(),
        }
    }

    pub fn schedule_cancelled(schedule_id: ScheduleId) -> Self {
        Event::ScheduleCancelled {
            schedule_id,
            timestamp: Utc::now(),
        }
    }

    pub fn job_enqueued(job_id: JobId, schedule_id: Option<ScheduleId>) -> Self {
        Event::JobEnqueued {
            job_id,
            schedule_id,
            timestamp: Utc::now(),
        }
    }

    pub fn job_started(job_id: JobId, attempt: u32) -> Self {
        Event::JobStarted {
            job_id,
            attempt,
            timestamp: Utc::now(),
        }
    }

    pub fn job_retrying(
        job_id: JobId,
        attempt: u32,
        error_kind: impl Into<String>,
        delay: Duration,
    ) -> Self {
        Event::JobRetrying {
            job_id,
            attempt,
            error_kind: error_kind.into(),
            delay,
            timestamp: Utc::now(),
        }
    }

    pub fn job_succeeded(job_id: JobId, attempts: u32) -> Self {
        Event::JobSucceeded {
            job_id,
            attempts,
            timestamp: Utc::now(),
        }
    }

    pub fn job_failed(
        job_id: JobId,
        error_kind: impl Into<String>,
        error_message: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Event::JobFailed {
            job_id,
            error_kind: error_kind.into(),
            error_message: error_message.into(),
            attempts,
            timestamp: Utc::now(),
        }
    }

    pub fn job_cancelled(job_id: JobId) -> Self {
        Event::JobCancelled {
            job_id,
            timestamp: Utc::now(),
        }
    }
}

/// Handler for lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event. Called for every emitted event.
    async fn handle(&self, event: &Event);
}

/// Event bus distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
