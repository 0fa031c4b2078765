//! SQLite backend implementation.
//!
//! Durable, full-capability backend with automatic schema migration.
//! Claiming uses a single UPDATE…RETURNING statement so at most one
//! worker ever receives a given queued job, even across processes
//! sharing the database file.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use super::{BackendError, JobFilter, QueueBackend, ScheduleFilter};
use crate::core::job::{JobFailure, JobRecord, JobState, JobTemplate, ScheduleRecord};
use crate::core::trigger::TriggerSpec;
use crate::core::types::{JobId, ScheduleId};

/// SQLite queue backend.
pub struct SqliteBackend {
    pool: SqlitePool,
}

type JobRow = (
    String,         // id
    String,         // template_json
    Option<String>, // schedule_id
    String,         // state
    i64,            // attempt
    bool,           // cancel_requested
    Option<String>, // failure_kind
    Option<String>, // failure_message
    i64,            // enqueued_at
    Option<i64>,    // started_at
    Option<i64>,    // finished_at
);

type ScheduleRow = (
    String,      // id
    String,      // trigger_json
    String,      // template_json
    bool,        // enabled
    Option<i64>, // next_fire_at
    i64,         // created_at
    i64,         // updated_at
);

const JOB_COLUMNS: &str = "id, template_json, schedule_id, state, attempt, cancel_requested, \
     failure_kind, failure_message, enqueued_at, started_at, finished_at";

const SCHEDULE_COLUMNS: &str =
    "id, trigger_json, template_json, enabled, next_fire_at, created_at, updated_at";

impl SqliteBackend {
    /// Open (or create) a database file and run migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| BackendError::Unavailable(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let backend = Self { pool };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Create an in-memory database (useful for testing).
    pub async fn in_memory() -> Result<Self, BackendError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let backend = Self { pool };
        backend.run_migrations().await?;
        Ok(backend)
    }

    async fn run_migrations(&self) -> Result<(), BackendError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| BackendError::Unavailable(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, BackendError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| BackendError::Corrupt(format!("timestamp out of range: {}", ms)))
}

fn job_from_row(row: JobRow) -> Result<JobRecord, BackendError> {
    let (
        id,
        template_json,
        schedule_id,
        state,
        attempt,
        cancel_requested,
        failure_kind,
        failure_message,
        enqueued_at,
        started_at,
        finished_at,
    ) = row;

    let uuid = uuid::Uuid::parse_str(&id)
        .map_err(|e| BackendError::Corrupt(format!("job id {:?}: {}", id, e)))?;
    let template: JobTemplate = serde_json::from_str(&template_json)?;
    let state: JobState = state.parse().map_err(BackendError::Corrupt)?;
    let last_failure = match (failure_kind, failure_message) {
        (Some(kind), Some(message)) => Some(JobFailure { kind, message }),
        _ => None,
    };

    Ok(JobRecord {
        id: JobId::from_uuid(uuid),
        template,
        schedule_id: schedule_id.map(ScheduleId::new),
        state,
        attempt: attempt as u32,
        cancel_requested,
        last_failure,
        enqueued_at: from_millis(enqueued_at)?,
        started_at: started_at.map(from_millis).transpose()?,
        finished_at: finished_at.map(from_millis).transpose()?,
    })
}

fn schedule_from_row(row: ScheduleRow) -> Result<ScheduleRecord, BackendError> {
    let (id, trigger_json, template_json, enabled, next_fire_at, created_at, updated_at) = row;

    let trigger: TriggerSpec = serde_json::from_str(&trigger_json)?;
    let template: JobTemplate = serde_json::from_str(&template_json)?;

    Ok(ScheduleRecord {
        id: ScheduleId::new(id),
        trigger,
        template,
        enabled,
        next_fire_at: next_fire_at.map(from_millis).transpose()?,
        created_at: from_millis(created_at)?,
        updated_at: from_millis(updated_at)?,
    })
}

#[async_trait]
impl QueueBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn enqueue(
        &self,
        template: JobTemplate,
        schedule_id: Option<ScheduleId>,
    ) -> Result<JobId, BackendError> {
        let record = JobRecord::new(template, schedule_id);
        let template_json = serde_json::to_string(&record.template)?;

        sqlx::query(
            r#"
            INSERT INTO jobs (id, queue, pipeline, template_json, schedule_id, state,
                              attempt, cancel_requested, enqueued_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.template.queue)
        .bind(record.template.pipeline.as_str())
        .bind(template_json)
        .bind(record.schedule_id.as_ref().map(|s| s.to_string()))
        .bind(record.state.to_string())
        .bind(record.attempt as i64)
        .bind(record.cancel_requested)
        .bind(millis(record.enqueued_at))
        .execute(&self.pool)
        .await
        .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        Ok(record.id)
    }

    async fn job(&self, id: &JobId) -> Result<JobRecord, BackendError> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        match row {
            Some(row) => job_from_row(row),
            None => Err(BackendError::NotFound(format!("job: {}", id))),
        }
    }

    async fn update_job(&self, record: &JobRecord) -> Result<(), BackendError> {
        let template_json = serde_json::to_string(&record.template)?;
        let (failure_kind, failure_message) = match &record.last_failure {
            Some(f) => (Some(f.kind.clone()), Some(f.message.clone())),
            None => (None, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET template_json = ?, state = ?, attempt = ?, cancel_requested = ?,
                failure_kind = ?, failure_message = ?, started_at = ?, finished_at = ?
            WHERE id = ?
            "#,
        )
        .bind(template_json)
        .bind(record.state.to_string())
        .bind(record.attempt as i64)
        .bind(record.cancel_requested)
        .bind(failure_kind)
        .bind(failure_message)
        .bind(record.started_at.map(millis))
        .bind(record.finished_at.map(millis))
        .bind(record.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(BackendError::NotFound(format!("job: {}", record.id)));
        }
        Ok(())
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<JobRecord>, BackendError> {
        // Single statement: the subquery picks the oldest queued job and
        // the UPDATE flips it to running before anyone else can see it.
        let sql = format!(
            r#"
            UPDATE jobs
            SET state = 'running', started_at = COALESCE(started_at, ?)
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = ? AND state = 'queued'
                ORDER BY enqueued_at
                LIMIT 1
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(millis(Utc::now()))
            .bind(queue)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        row.map(job_from_row).transpose()
    }

    async fn cancel_job(&self, id: &JobId) -> Result<(), BackendError> {
        // Queued jobs are cancelled outright; in-flight jobs get the flag
        // for the worker to resolve. Terminal and unknown jobs: no-op.
        sqlx::query(
            "UPDATE jobs SET state = 'cancelled', finished_at = ? WHERE id = ? AND state = 'queued'",
        )
        .bind(millis(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        sqlx::query(
            "UPDATE jobs SET cancel_requested = 1 WHERE id = ? AND state IN ('running', 'retrying')",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        Ok(())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, BackendError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM jobs ORDER BY enqueued_at",
            JOB_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let mut result = Vec::new();
        for row in rows {
            let record = job_from_row(row)?;
            if filter.matches(&record) {
                result.push(record);
            }
        }
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn register_schedule(
        &self,
        record: ScheduleRecord,
        overwrite: bool,
    ) -> Result<(), BackendError> {
        let trigger_json = serde_json::to_string(&record.trigger)?;
        let template_json = serde_json::to_string(&record.template)?;

        let verb = if overwrite {
            "INSERT OR REPLACE"
        } else {
            "INSERT"
        };
        let sql = format!(
            r#"
            {} INTO schedules (id, pipeline, trigger_json, template_json, enabled,
                               next_fire_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            verb
        );

        let result = sqlx::query(&sql)
            .bind(record.id.to_string())
            .bind(record.template.pipeline.as_str())
            .bind(trigger_json)
            .bind(template_json)
            .bind(record.enabled)
            .bind(record.next_fire_at.map(millis))
            .bind(millis(record.created_at))
            .bind(millis(record.updated_at))
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(BackendError::ScheduleConflict(record.id))
            }
            Err(e) => Err(BackendError::Unavailable(e.to_string())),
        }
    }

    async fn schedule(&self, id: &ScheduleId) -> Result<ScheduleRecord, BackendError> {
        let row: Option<ScheduleRow> = sqlx::query_as(&format!(
            "SELECT {} FROM schedules WHERE id = ?",
            SCHEDULE_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        match row {
            Some(row) => schedule_from_row(row),
            None => Err(BackendError::NotFound(format!("schedule: {}", id))),
        }
    }

    async fn cancel_schedule(&self, id: &ScheduleId) -> Result<(), BackendError> {
        sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn pause_schedule(&self, id: &ScheduleId) -> Result<(), BackendError> {
        let result = sqlx::query("UPDATE schedules SET enabled = 0, updated_at = ? WHERE id = ?")
            .bind(millis(Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(BackendError::NotFound(format!("schedule: {}", id)));
        }
        Ok(())
    }

    async fn resume_schedule(&self, id: &ScheduleId) -> Result<(), BackendError> {
        let record = self.schedule(id).await?;
        if record.enabled {
            return Ok(());
        }

        // Skip occurrences that elapsed while paused.
        let next = record.trigger.next_after(Utc::now())?;
        sqlx::query(
            "UPDATE schedules SET enabled = 1, next_fire_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(next.map(millis))
        .bind(millis(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn list_schedules(
        &self,
        filter: &ScheduleFilter,
    ) -> Result<Vec<ScheduleRecord>, BackendError> {
        let rows: Vec<ScheduleRow> = sqlx::query_as(&format!(
            "SELECT {} FROM schedules ORDER BY id",
            SCHEDULE_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let mut result = Vec::new();
        for row in rows {
            let record = schedule_from_row(row)?;
            if filter.matches(&record) {
                result.push(record);
            }
        }
        Ok(result)
    }

    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleRecord>, BackendError> {
        let rows: Vec<ScheduleRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM schedules
            WHERE enabled = 1 AND next_fire_at IS NOT NULL AND next_fire_at <= ?
            ORDER BY next_fire_at
            "#,
            SCHEDULE_COLUMNS
        ))
        .bind(millis(now))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        rows.into_iter().map(schedule_from_row).collect()
    }

    async fn advance_schedule(
        &self,
        id: &ScheduleId,
        fired_at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, BackendError> {
        let record = self.schedule(id).await?;
        let next = record.trigger.next_after(fired_at)?;

        sqlx::query(
            "UPDATE schedules SET next_fire_at = ?, enabled = ?, updated_at = ? WHERE id = ?",
        )
        .bind(next.map(millis))
        .bind(record.enabled && next.is_some())
        .bind(millis(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        Ok(next)
    }
}
