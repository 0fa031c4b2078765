//! millrace - scheduling and retry orchestration for pipeline jobs.
//!
//! Sits between a pipeline-execution call and an interchangeable
//! job-queue backend: normalizes cron/interval/date triggers into one
//! canonical form, owns the retry policy applied around each invocation,
//! and drives schedules and jobs through a uniform backend contract.

pub mod backend;
pub mod config;
pub mod core;
pub mod events;
pub mod pipeline;
pub mod registry;
pub mod scheduler;
pub mod testing;
pub mod worker;

pub use crate::backend::{
    BackendError, FifoBackend, InMemoryBackend, JobFilter, QueueBackend, ScheduleFilter,
    TimedBackend,
};
#[cfg(any(feature = "sqlite", test))]
pub use crate::backend::SqliteBackend;
pub use crate::config::{
    ConfigError, PipelineConfig, ProjectConfig, QueueConfig, RunSection, load_pipeline_configs,
    load_project_config,
};
pub use crate::core::job::{JobFailure, JobRecord, JobState, JobTemplate, ScheduleRecord};
pub use crate::core::retry::{ErrorKind, ErrorKindRegistry, RetryError, RetryPolicy};
pub use crate::core::trigger::{
    CronInput, IntervalInput, RawTrigger, TriggerError, TriggerKind, TriggerSpec,
};
pub use crate::core::types::{JobId, PipelineRef, ScheduleId};
pub use crate::events::{Event, EventBus, EventHandler};
pub use crate::pipeline::{ExecutionError, PipelineExecutor, ProcessExecutor};
pub use crate::registry::{
    RegistryError, ScheduleDeclaration, ScheduleOutcome, ScheduleRegistry, derive_schedule_id,
};
pub use crate::scheduler::{Scheduler, SchedulerError, SchedulerHandle, SchedulerState};
pub use crate::worker::{JobRunner, WorkerHandle, WorkerPool};
