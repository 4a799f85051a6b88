//! services/api/src/adapters/queue.rs
//!
//! A durable job queue on top of the `generation_jobs` table. Workers claim
//! jobs with `FOR UPDATE SKIP LOCKED`, so any number of processes can share
//! one queue without handing the same job out twice.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coupon_book_core::domain::{
    GenerationJob, GenerationOutcome, GenerationRequest, JobCounts, JobFilter, JobOptions,
    JobState, ALL_JOBS_PER_STATE, DEFAULT_STALL_TIMEOUT_SECS, KEEP_COMPLETED_JOBS,
    KEEP_FAILED_JOBS, STALLED_REASON,
};
use coupon_book_core::ports::{JobQueue, PortError, PortResult};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const JOB_NAME: &str = "generate-codes";

const JOB_COLUMNS: &str = "id, payload, priority, delay_ms, state, progress, generated, attempts_made, \
    max_attempts, backoff_ms, run_at, result, failed_reason, created_at, processed_at, finished_at";

#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    stall_timeout: Duration,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            stall_timeout: Duration::from_secs(DEFAULT_STALL_TIMEOUT_SECS),
        }
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Puts `active` jobs that stopped reporting back in line, or fails them
    /// once their attempts are used up.
    async fn recover_stalled(&self) -> PortResult<()> {
        let states: Vec<String> = sqlx::query_scalar(
            "WITH stalled AS ( \
               SELECT id FROM generation_jobs \
               WHERE state = 'active' AND processed_at < NOW() - ($1 * INTERVAL '1 millisecond') \
               FOR UPDATE SKIP LOCKED) \
             UPDATE generation_jobs j SET \
               state = CASE WHEN j.attempts_made < j.max_attempts THEN 'waiting' ELSE 'failed' END, \
               run_at = CASE WHEN j.attempts_made < j.max_attempts THEN NOW() ELSE j.run_at END, \
               failed_reason = CASE WHEN j.attempts_made < j.max_attempts THEN j.failed_reason ELSE $2 END, \
               finished_at = CASE WHEN j.attempts_made < j.max_attempts THEN NULL ELSE NOW() END \
             FROM stalled WHERE j.id = stalled.id \
             RETURNING j.state",
        )
        .bind(self.stall_timeout.as_millis() as i64)
        .bind(STALLED_REASON)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        if states.is_empty() {
            return Ok(());
        }
        warn!(recovered = states.len(), "Recovered stalled generation jobs");
        if states.iter().any(|s| s == JobState::Failed.as_str()) {
            self.prune(JobState::Failed, KEEP_FAILED_JOBS).await?;
        }
        Ok(())
    }

    /// Keeps only the newest `keep` finished jobs in `state`.
    async fn prune(&self, state: JobState, keep: usize) -> PortResult<()> {
        let removed = sqlx::query(
            "DELETE FROM generation_jobs WHERE state = $1 AND id NOT IN ( \
               SELECT id FROM generation_jobs WHERE state = $1 \
               ORDER BY finished_at DESC LIMIT $2)",
        )
        .bind(state.as_str())
        .bind(keep as i64)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?
        .rows_affected();
        if removed > 0 {
            debug!(state = state.as_str(), removed, "Pruned finished jobs");
        }
        Ok(())
    }

    /// Explains why a conditional update matched no row.
    async fn state_conflict(&self, job_id: Uuid, message: &str) -> PortError {
        match self.get_job(job_id).await {
            Ok(Some(_)) => PortError::Conflict(message.to_string()),
            Ok(None) => PortError::NotFound("Job not found".to_string()),
            Err(e) => e,
        }
    }
}

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

//=========================================================================================
// "Impure" Database Record Struct
//=========================================================================================

#[derive(FromRow)]
struct JobRecord {
    id: Uuid,
    payload: Json<GenerationRequest>,
    priority: i32,
    delay_ms: i64,
    state: String,
    progress: i16,
    generated: i32,
    attempts_made: i32,
    max_attempts: i32,
    backoff_ms: i64,
    run_at: DateTime<Utc>,
    result: Option<Json<GenerationOutcome>>,
    failed_reason: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}
impl JobRecord {
    fn to_domain(self) -> PortResult<GenerationJob> {
        Ok(GenerationJob {
            id: self.id,
            request: self.payload.0,
            options: JobOptions {
                priority: self.priority,
                delay_ms: self.delay_ms.max(0) as u64,
                attempts: self.max_attempts.max(0) as u32,
                backoff_ms: self.backoff_ms.max(0) as u64,
            },
            state: JobState::from_str(&self.state).map_err(PortError::Unexpected)?,
            progress: self.progress.clamp(0, 100) as u8,
            generated: self.generated.max(0) as u32,
            attempts_made: self.attempts_made.max(0) as u32,
            result: self.result.map(|r| r.0),
            failed_reason: self.failed_reason,
            run_at: self.run_at,
            created_at: self.created_at,
            processed_at: self.processed_at,
            finished_at: self.finished_at,
        })
    }
}

fn to_domain_all(records: Vec<JobRecord>) -> PortResult<Vec<GenerationJob>> {
    records.into_iter().map(JobRecord::to_domain).collect()
}

//=========================================================================================
// `JobQueue` Trait Implementation
//=========================================================================================

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, request: GenerationRequest, options: JobOptions) -> PortResult<GenerationJob> {
        let state = if options.delay_ms > 0 {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        let query = format!(
            "INSERT INTO generation_jobs \
             (id, name, payload, priority, delay_ms, state, max_attempts, backoff_ms, run_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW() + ($5 * INTERVAL '1 millisecond')) \
             RETURNING {}",
            JOB_COLUMNS
        );
        sqlx::query_as::<_, JobRecord>(&query)
            .bind(Uuid::new_v4())
            .bind(JOB_NAME)
            .bind(Json(&request))
            .bind(options.priority)
            .bind(options.delay_ms as i64)
            .bind(state.as_str())
            .bind(options.attempts as i32)
            .bind(options.backoff_ms as i64)
            .fetch_one(&self.pool)
            .await
            .map_err(unexpected)?
            .to_domain()
    }

    async fn get_job(&self, job_id: Uuid) -> PortResult<Option<GenerationJob>> {
        let query = format!("SELECT {} FROM generation_jobs WHERE id = $1", JOB_COLUMNS);
        sqlx::query_as::<_, JobRecord>(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?
            .map(JobRecord::to_domain)
            .transpose()
    }

    async fn list_jobs(&self, filter: JobFilter, limit: usize, offset: usize) -> PortResult<Vec<GenerationJob>> {
        let records = match filter {
            JobFilter::Only(state) => {
                let query = format!(
                    "SELECT {} FROM generation_jobs WHERE state = $1 \
                     ORDER BY created_at DESC LIMIT $2 OFFSET $3",
                    JOB_COLUMNS
                );
                sqlx::query_as::<_, JobRecord>(&query)
                    .bind(state.as_str())
                    .bind(limit as i64)
                    .bind(offset as i64)
                    .fetch_all(&self.pool)
                    .await
            }
            JobFilter::All => {
                let query = format!(
                    "SELECT {cols} FROM ( \
                       SELECT {cols}, ROW_NUMBER() OVER (PARTITION BY state ORDER BY created_at DESC) AS rank \
                       FROM generation_jobs) ranked \
                     WHERE rank <= $1 \
                     ORDER BY array_position(ARRAY['waiting', 'delayed', 'active', 'completed', 'failed'], state), \
                              created_at DESC",
                    cols = JOB_COLUMNS
                );
                sqlx::query_as::<_, JobRecord>(&query)
                    .bind(ALL_JOBS_PER_STATE as i64)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(unexpected)?;
        to_domain_all(records)
    }

    async fn job_counts(&self) -> PortResult<JobCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM generation_jobs GROUP BY state")
                .fetch_all(&self.pool)
                .await
                .map_err(unexpected)?;
        let mut counts = JobCounts::default();
        for (state, count) in rows {
            let state = JobState::from_str(&state).map_err(PortError::Unexpected)?;
            counts.add(state, count.max(0) as u64);
        }
        Ok(counts)
    }

    async fn claim_next(&self) -> PortResult<Option<GenerationJob>> {
        self.recover_stalled().await?;
        let query = format!(
            "UPDATE generation_jobs SET state = 'active', attempts_made = attempts_made + 1, \
             processed_at = NOW() \
             WHERE id = ( \
               SELECT id FROM generation_jobs \
               WHERE state IN ('waiting', 'delayed') AND run_at <= NOW() \
               ORDER BY priority, created_at \
               LIMIT 1 FOR UPDATE SKIP LOCKED) \
             RETURNING {}",
            JOB_COLUMNS
        );
        sqlx::query_as::<_, JobRecord>(&query)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?
            .map(JobRecord::to_domain)
            .transpose()
    }

    async fn report_progress(&self, job_id: Uuid, progress: u8, generated: u32) -> PortResult<()> {
        let updated = sqlx::query(
            "UPDATE generation_jobs SET progress = $2, generated = $3, processed_at = NOW() \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(i16::from(progress.min(100)))
        .bind(i32::try_from(generated).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await
        .map_err(unexpected)?
        .rows_affected();
        if updated == 0 {
            return Err(PortError::NotFound("Job not found".to_string()));
        }
        Ok(())
    }

    async fn complete(&self, job_id: Uuid, outcome: GenerationOutcome) -> PortResult<()> {
        let updated = sqlx::query(
            "UPDATE generation_jobs SET state = 'completed', progress = 100, result = $2, \
             failed_reason = NULL, finished_at = NOW() WHERE id = $1",
        )
        .bind(job_id)
        .bind(Json(&outcome))
        .execute(&self.pool)
        .await
        .map_err(unexpected)?
        .rows_affected();
        if updated == 0 {
            return Err(PortError::NotFound("Job not found".to_string()));
        }
        self.prune(JobState::Completed, KEEP_COMPLETED_JOBS).await
    }

    async fn fail(&self, job_id: Uuid, reason: &str) -> PortResult<JobState> {
        let state: Option<String> = sqlx::query_scalar(
            "UPDATE generation_jobs SET failed_reason = $2, \
               state = CASE WHEN attempts_made < max_attempts THEN 'delayed' ELSE 'failed' END, \
               run_at = CASE WHEN attempts_made < max_attempts \
                 THEN NOW() + (backoff_ms * power(2, GREATEST(attempts_made - 1, 0))) * INTERVAL '1 millisecond' \
                 ELSE run_at END, \
               finished_at = CASE WHEN attempts_made < max_attempts THEN NULL ELSE NOW() END \
             WHERE id = $1 RETURNING state",
        )
        .bind(job_id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        let state = state.ok_or_else(|| PortError::NotFound("Job not found".to_string()))?;
        let state = JobState::from_str(&state).map_err(PortError::Unexpected)?;
        if state == JobState::Failed {
            self.prune(JobState::Failed, KEEP_FAILED_JOBS).await?;
        }
        Ok(state)
    }

    async fn retry(&self, job_id: Uuid) -> PortResult<GenerationJob> {
        let query = format!(
            "UPDATE generation_jobs SET state = 'waiting', attempts_made = 0, \
             failed_reason = NULL, finished_at = NULL, run_at = NOW() \
             WHERE id = $1 AND state = 'failed' RETURNING {}",
            JOB_COLUMNS
        );
        let record = sqlx::query_as::<_, JobRecord>(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?;
        match record {
            Some(record) => record.to_domain(),
            None => Err(self.state_conflict(job_id, "Only failed jobs can be retried").await),
        }
    }

    async fn remove(&self, job_id: Uuid) -> PortResult<()> {
        let removed = sqlx::query(
            "DELETE FROM generation_jobs WHERE id = $1 AND state IN ('waiting', 'delayed')",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?
        .rows_affected();
        if removed == 0 {
            return Err(self
                .state_conflict(job_id, "Only waiting or delayed jobs can be removed")
                .await);
        }
        Ok(())
    }
}
