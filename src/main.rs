//! millrace - scheduling and retry orchestration for pipelines.
//!
//! Usage:
//!   mill schedule add <pipeline> --cron "0 6 * * *"   Register a schedule
//!   mill schedule all <dir>                           Register every declaration in a directory
//!   mill job enqueue <pipeline>                       Enqueue an ad-hoc job
//!   mill run <dir>                                    Run the scheduler and worker pool
//!
//! Every command prints a machine-readable JSON result on stdout.

use clap::{Args, Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use millrace::{
    CronInput, Event, EventBus, EventHandler, IntervalInput, JobFilter, JobId, JobState,
    JobTemplate, ProcessExecutor, ProjectConfig, QueueBackend, RawTrigger, RunSection,
    ScheduleFilter, ScheduleId, ScheduleOutcome, ScheduleRegistry, Scheduler, TimedBackend,
    WorkerPool, load_pipeline_configs, load_project_config,
};

/// mill - scheduling and retry orchestration for pipelines
#[derive(Parser)]
#[command(name = "mill")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the project configuration file.
    #[arg(long, global = true, default_value = "millrace.yaml")]
    config: PathBuf,

    /// Deadline in seconds applied to every backend call.
    #[arg(long, global = true, default_value = "10")]
    backend_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage schedules.
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },

    /// Manage jobs.
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },

    /// Run the scheduler timer loop and worker pool.
    Run {
        /// Directory of pipeline declaration files to register first.
        #[arg(value_name = "PIPELINES_DIR")]
        pipelines_dir: Option<PathBuf>,

        /// Pipeline-runner binary invoked per job.
        #[arg(long, default_value = "pipeline-runner")]
        runner: String,

        /// Maximum concurrent jobs.
        #[arg(short = 'j', long, default_value = "4")]
        concurrency: usize,

        /// Scheduler tick interval in seconds.
        #[arg(long, default_value = "1")]
        tick_interval: u64,

        /// Wall-clock timeout in seconds for each pipeline invocation.
        #[arg(long)]
        job_timeout: Option<u64>,
    },
}

#[derive(Subcommand)]
enum ScheduleCommands {
    /// Register a schedule for a pipeline.
    Add {
        /// Pipeline to schedule.
        #[arg(value_name = "PIPELINE")]
        pipeline: String,

        #[command(flatten)]
        trigger: TriggerArgs,

        #[command(flatten)]
        retry: RetryArgs,

        /// Explicit schedule id (derived from the trigger when absent).
        #[arg(long)]
        id: Option<String>,

        /// Replace an existing schedule with the same id.
        #[arg(long)]
        overwrite: bool,

        /// Queue to enqueue fired jobs on.
        #[arg(long)]
        queue: Option<String>,
    },

    /// Register every declaration in a directory.
    All {
        /// Directory of pipeline declaration files.
        #[arg(value_name = "PIPELINES_DIR")]
        pipelines_dir: PathBuf,

        /// Replace existing schedules with the same ids.
        #[arg(long)]
        overwrite: bool,
    },

    /// Cancel (delete) a schedule.
    Cancel {
        #[arg(value_name = "SCHEDULE_ID")]
        id: String,
    },

    /// Pause a schedule.
    Pause {
        #[arg(value_name = "SCHEDULE_ID")]
        id: String,
    },

    /// Resume a paused schedule.
    Resume {
        #[arg(value_name = "SCHEDULE_ID")]
        id: String,
    },

    /// List registered schedules.
    List {
        /// Only enabled schedules.
        #[arg(long)]
        enabled_only: bool,
    },
}

#[derive(Subcommand)]
enum JobCommands {
    /// Enqueue an ad-hoc job (no schedule, no recurrence).
    Enqueue {
        /// Pipeline to invoke.
        #[arg(value_name = "PIPELINE")]
        pipeline: String,

        /// Input values as a JSON object.
        #[arg(long)]
        inputs: Option<String>,

        /// Configuration values as a JSON object.
        #[arg(long, value_name = "JSON")]
        job_config: Option<String>,

        /// Output variables to materialize (comma-separated).
        #[arg(long)]
        final_vars: Option<String>,

        /// Queue to enqueue on.
        #[arg(long)]
        queue: Option<String>,

        #[command(flatten)]
        retry: RetryArgs,
    },

    /// Show the status of a job.
    Status {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },

    /// List jobs.
    List {
        /// Filter by state (queued, running, succeeded, failed, retrying, cancelled).
        #[arg(long)]
        state: Option<String>,

        /// Filter by queue.
        #[arg(long)]
        queue: Option<String>,

        /// Maximum number of jobs to show.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Cancel a job.
    Cancel {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
}

/// Trigger flags; exactly one must be supplied.
#[derive(Args)]
struct TriggerArgs {
    /// Cron expression (5 or 6 fields).
    #[arg(long)]
    cron: Option<String>,

    /// Interval: whole seconds or a duration string like "1h30m".
    #[arg(long)]
    interval: Option<String>,

    /// One-shot ISO-8601 date with UTC offset.
    #[arg(long)]
    date: Option<String>,

    /// IANA timezone for cron triggers.
    #[arg(long)]
    timezone: Option<String>,
}

impl TriggerArgs {
    fn to_raw(&self) -> RawTrigger {
        let interval = self.interval.as_ref().map(|text| match text.parse::<u64>() {
            Ok(secs) => IntervalInput::Seconds(secs),
            Err(_) => IntervalInput::Text(text.clone()),
        });

        RawTrigger {
            cron: self.cron.clone().map(CronInput::Expression),
            interval,
            date: self.date.clone(),
            timezone: self.timezone.clone(),
        }
    }
}

/// Retry flags overriding the project defaults.
#[derive(Args)]
struct RetryArgs {
    /// Maximum retries after the initial attempt.
    #[arg(long)]
    max_retries: Option<u32>,

    /// Base delay in seconds between attempts.
    #[arg(long)]
    retry_delay: Option<f64>,

    /// Jitter factor in [0, 1].
    #[arg(long)]
    jitter_factor: Option<f64>,

    /// Retryable error kinds (comma-separated symbolic names).
    #[arg(long)]
    retry_exceptions: Option<String>,
}

impl RetryArgs {
    fn to_run_section(&self, defaults: &RunSection) -> RunSection {
        RunSection {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            retry_delay: self.retry_delay.unwrap_or(defaults.retry_delay),
            jitter_factor: self.jitter_factor.unwrap_or(defaults.jitter_factor),
            retry_exceptions: match &self.retry_exceptions {
                Some(list) => list.split(',').map(|s| s.trim().to_string()).collect(),
                None => defaults.retry_exceptions.clone(),
            },
        }
    }
}

/// Event handler that logs job and schedule lifecycle events.
struct LoggingHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::JobEnqueued {
                job_id,
                schedule_id,
                ..
            } => match schedule_id {
                Some(schedule_id) => {
                    info!("Job {} enqueued by schedule '{}'", job_id, schedule_id);
                }
                None => info!("Job {} enqueued", job_id),
            },
            Event::JobStarted {
                job_id, attempt, ..
            } => {
                info!("Job {} started (attempt {})", job_id, attempt);
            }
            Event::JobRetrying {
                job_id,
                attempt,
                error_kind,
                delay,
                ..
            } => {
                warn!(
                    "Job {} attempt {} failed ({}), retrying in {:?}",
                    job_id, attempt, error_kind, delay
                );
            }
            Event::JobSucceeded {
                job_id, attempts, ..
            } => {
                info!("Job {} succeeded after {} retries", job_id, attempts);
            }
            Event::JobFailed {
                job_id,
                error_kind,
                error_message,
                attempts,
                ..
            } => {
                error!(
                    "Job {} failed ({}: {}) after {} retries",
                    job_id, error_kind, error_message, attempts
                );
            }
            Event::JobCancelled { job_id, .. } => {
                info!("Job {} cancelled", job_id);
            }
            _ => {}
        }
    }
}

fn load_config(path: &PathBuf) -> Result<ProjectConfig, Box<dyn std::error::Error>> {
    if path.exists() {
        Ok(load_project_config(path)?)
    } else {
        Ok(ProjectConfig::default())
    }
}

async fn build_backend(
    config: &ProjectConfig,
    timeout_secs: u64,
) -> Result<Arc<dyn QueueBackend>, Box<dyn std::error::Error>> {
    let inner = config.job_queue.build().await?;
    Ok(Arc::new(TimedBackend::new(
        inner,
        Duration::from_secs(timeout_secs),
    )))
}

fn parse_job_id(id: &str) -> Result<JobId, Box<dyn std::error::Error>> {
    let uuid = uuid::Uuid::parse_str(id).map_err(|e| format!("invalid job id {:?}: {}", id, e))?;
    Ok(JobId::from_uuid(uuid))
}

fn parse_json_object(
    label: &str,
    raw: &Option<String>,
) -> Result<std::collections::HashMap<String, serde_json::Value>, Box<dyn std::error::Error>> {
    match raw {
        None => Ok(Default::default()),
        Some(raw) => {
            serde_json::from_str(raw).map_err(|e| format!("invalid {} JSON: {}", label, e).into())
        }
    }
}

fn print_json(value: &serde_json::Value) {
    // stdout is the machine-readable surface; logs go to stderr.
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let backend = build_backend(&config, cli.backend_timeout).await?;

    match cli.command {
        Commands::Schedule { command } => run_schedule_command(command, &config, backend).await,
        Commands::Job { command } => run_job_command(command, &config, backend).await,
        Commands::Run {
            pipelines_dir,
            runner,
            concurrency,
            tick_interval,
            job_timeout,
        } => {
            run_loop(
                &config,
                backend,
                pipelines_dir,
                runner,
                concurrency,
                tick_interval,
                job_timeout,
            )
            .await
        }
    }
}

async fn run_schedule_command(
    command: ScheduleCommands,
    config: &ProjectConfig,
    backend: Arc<dyn QueueBackend>,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = ScheduleRegistry::new(backend);

    match command {
        ScheduleCommands::Add {
            pipeline,
            trigger,
            retry,
            id,
            overwrite,
            queue,
        } => {
            let kinds = config.error_kind_registry()?;
            let policy = retry.to_run_section(&config.run).to_policy(&kinds)?;

            let mut template = JobTemplate::new(pipeline).with_retry(policy);
            if let Some(queue) = queue {
                template = template.with_queue(queue);
            }

            let schedule_id = registry
                .register_raw(
                    &trigger.to_raw(),
                    template,
                    id.map(ScheduleId::new),
                    overwrite,
                )
                .await?;
            print_json(&json!({ "status": "registered", "id": schedule_id }));
        }

        ScheduleCommands::All {
            pipelines_dir,
            overwrite,
        } => {
            let outcomes = register_directory(config, &registry, &pipelines_dir, overwrite).await?;
            let any_registered = outcomes.iter().any(ScheduleOutcome::is_registered);
            let any_failed = outcomes
                .iter()
                .any(|o| matches!(o, ScheduleOutcome::Failed { .. }));
            print_json(&serde_json::to_value(&outcomes)?);
            if any_failed && !any_registered {
                return Err("all declarations failed to register".into());
            }
        }

        ScheduleCommands::Cancel { id } => {
            registry.cancel(&ScheduleId::new(id.clone())).await?;
            print_json(&json!({ "status": "cancelled", "id": id }));
        }

        ScheduleCommands::Pause { id } => {
            registry.pause(&ScheduleId::new(id.clone())).await?;
            print_json(&json!({ "status": "paused", "id": id }));
        }

        ScheduleCommands::Resume { id } => {
            registry.resume(&ScheduleId::new(id.clone())).await?;
            print_json(&json!({ "status": "resumed", "id": id }));
        }

        ScheduleCommands::List { enabled_only } => {
            let filter = if enabled_only {
                ScheduleFilter::enabled()
            } else {
                ScheduleFilter::all()
            };
            let schedules = registry.list(&filter).await?;
            print_json(&serde_json::to_value(&schedules)?);
        }
    }

    Ok(())
}

async fn run_job_command(
    command: JobCommands,
    config: &ProjectConfig,
    backend: Arc<dyn QueueBackend>,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        JobCommands::Enqueue {
            pipeline,
            inputs,
            job_config,
            final_vars,
            queue,
            retry,
        } => {
            let kinds = config.error_kind_registry()?;
            let policy = retry.to_run_section(&config.run).to_policy(&kinds)?;

            let mut template = JobTemplate::new(pipeline)
                .with_inputs(parse_json_object("inputs", &inputs)?)
                .with_config(parse_json_object("config", &job_config)?)
                .with_retry(policy);
            if let Some(vars) = final_vars {
                template = template
                    .with_final_vars(vars.split(',').map(|s| s.trim().to_string()).collect());
            }
            if let Some(queue) = queue {
                template = template.with_queue(queue);
            }

            let job_id = backend.enqueue(template, None).await?;
            print_json(&json!({ "status": "enqueued", "id": job_id }));
        }

        JobCommands::Status { id } => {
            let record = backend.job(&parse_job_id(&id)?).await?;
            print_json(&serde_json::to_value(&record)?);
        }

        JobCommands::List {
            state,
            queue,
            limit,
        } => {
            let mut filter = JobFilter::all();
            if let Some(state) = state {
                filter = filter.with_state(state.parse::<JobState>()?);
            }
            if let Some(queue) = queue {
                filter = filter.with_queue(queue);
            }
            if let Some(limit) = limit {
                filter = filter.with_limit(limit);
            }
            let jobs = backend.list_jobs(&filter).await?;
            print_json(&serde_json::to_value(&jobs)?);
        }

        JobCommands::Cancel { id } => {
            backend.cancel_job(&parse_job_id(&id)?).await?;
            print_json(&json!({ "status": "cancel_requested", "id": id }));
        }
    }

    Ok(())
}

/// Register every declaration in a directory, folding per-file
/// resolution errors into the outcome list.
async fn register_directory(
    config: &ProjectConfig,
    registry: &ScheduleRegistry,
    dir: &PathBuf,
    overwrite: bool,
) -> Result<Vec<ScheduleOutcome>, Box<dyn std::error::Error>> {
    let kinds = config.error_kind_registry()?;
    let pipelines = load_pipeline_configs(dir)?;

    let mut declarations = Vec::new();
    let mut outcomes = Vec::new();
    for pipeline in pipelines {
        let name = pipeline.name.clone();
        match pipeline.into_declaration(&config.run, &kinds) {
            Ok(declaration) => declarations.push(declaration),
            Err(e) => outcomes.push(ScheduleOutcome::Failed {
                name,
                error: e.to_string(),
            }),
        }
    }

    outcomes.extend(registry.schedule_all(declarations, overwrite).await);
    Ok(outcomes)
}

async fn run_loop(
    config: &ProjectConfig,
    backend: Arc<dyn QueueBackend>,
    pipelines_dir: Option<PathBuf>,
    runner: String,
    concurrency: usize,
    tick_interval: u64,
    job_timeout: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let event_bus = Arc::new(EventBus::new());
    event_bus.register(Arc::new(LoggingHandler)).await;

    if let Some(dir) = pipelines_dir {
        let registry =
            ScheduleRegistry::new(Arc::clone(&backend)).with_event_bus(Arc::clone(&event_bus));
        let outcomes = register_directory(config, &registry, &dir, true).await?;
        for outcome in &outcomes {
            match outcome {
                ScheduleOutcome::Registered { name, id } => {
                    info!("Registered schedule '{}' for pipeline '{}'", id, name);
                }
                ScheduleOutcome::Skipped { name, reason } => {
                    info!("Skipped pipeline '{}': {}", name, reason);
                }
                ScheduleOutcome::Failed { name, error } => {
                    warn!("Failed to register pipeline '{}': {}", name, error);
                }
            }
        }
    }

    let mut executor = ProcessExecutor::new(runner);
    if let Some(secs) = job_timeout {
        executor = executor.timeout(Duration::from_secs(secs));
    }

    let scheduler = Scheduler::new(Arc::clone(&backend))
        .with_event_bus(Arc::clone(&event_bus))
        .with_tick_interval(Duration::from_secs(tick_interval));
    let (scheduler_handle, scheduler_task) = scheduler.start().await;

    let pool = WorkerPool::new(Arc::clone(&backend), Arc::new(executor))
        .with_event_bus(Arc::clone(&event_bus))
        .with_concurrency(concurrency);
    let (worker_handle, worker_task) = pool.start().await;

    info!("Scheduler and worker pool running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    scheduler_handle.shutdown().await?;
    worker_handle.shutdown().await;
    scheduler_task.await?;
    worker_task.await?;

    Ok(())
}
