//! Timer engine: polls due schedules and enqueues jobs.

mod engine;

pub use engine::{Scheduler, SchedulerError, SchedulerHandle, SchedulerState};
