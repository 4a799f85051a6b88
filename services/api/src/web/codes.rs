//! services/api/src/web/codes.rs
//!
//! Handlers for code generation jobs and manual code overrides.

use crate::error::ApiError;
use crate::web::state::AppState;
use crate::web::{coupon_status_filter, page};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use coupon_book_core::domain::{CodeFilter, CouponCode, GenerationJob, JobCounts, JobFilter, JobState};
use coupon_book_core::generation::GenerateCodes;
use coupon_book_core::ports::PortError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

const DEFAULT_JOB_PAGE: usize = 10;

//=========================================================================================
// Payloads
//=========================================================================================

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct GenerateCodesRequest {
    pub book_id: i64,
    pub quantity: i64,
    /// Falls back to the book's pattern, then to `CODE-####$$$$****`.
    pub pattern: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobAcceptedResponse {
    pub message: String,
    pub job_id: Uuid,
    pub book_id: i64,
    pub quantity: u32,
    pub pattern: String,
    pub state: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobOutcomeView {
    pub generated_count: u32,
    pub requested_count: u32,
    pub book_id: i64,
    pub pattern: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobView {
    pub job_id: Uuid,
    pub state: String,
    pub progress: u8,
    /// Codes inserted so far, across attempts.
    pub generated: u32,
    pub book_id: i64,
    pub quantity: u32,
    pub pattern: String,
    pub batch_size: u32,
    pub priority: i32,
    pub attempts_made: u32,
    pub result: Option<JobOutcomeView>,
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<GenerationJob> for JobView {
    fn from(job: GenerationJob) -> Self {
        Self {
            job_id: job.id,
            state: job.state.as_str().to_string(),
            progress: job.progress,
            generated: job.generated,
            book_id: job.request.book_id,
            quantity: job.request.quantity,
            pattern: job.request.pattern,
            batch_size: job.request.batch_size,
            priority: job.options.priority,
            attempts_made: job.attempts_made,
            result: job.result.map(|r| JobOutcomeView {
                generated_count: r.generated_count,
                requested_count: r.requested_count,
                book_id: r.book_id,
                pattern: r.pattern,
            }),
            failed_reason: job.failed_reason,
            created_at: job.created_at,
            processed_at: job.processed_at,
            finished_at: job.finished_at,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct JobListParams {
    /// `all` (default), `waiting`, `delayed`, `active`, `completed` or `failed`.
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobListResponse {
    pub data: Vec<JobView>,
    pub limit: usize,
    pub offset: usize,
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobStatsResponse {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

impl From<JobCounts> for JobStatsResponse {
    fn from(counts: JobCounts) -> Self {
        Self {
            waiting: counts.waiting,
            delayed: counts.delayed,
            active: counts.active,
            completed: counts.completed,
            failed: counts.failed,
            total: counts.total(),
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CodeListParams {
    pub book_id: Option<i64>,
    /// `AVAILABLE`, `ASSIGNED`, `TEMP_LOCKED`, `REDEEMED`, `DISABLED` or `EXPIRED`.
    pub status: Option<String>,
    /// Defaults to 20, at most 100.
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CodeListResponse {
    pub data: Vec<CodeView>,
    pub limit: i64,
    pub offset: i64,
    pub total: i64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CodeView {
    pub id: i64,
    pub book_id: i64,
    pub code: String,
    pub status: String,
    pub assigned_at: Option<DateTime<Utc>>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<CouponCode> for CodeView {
    fn from(code: CouponCode) -> Self {
        Self {
            id: code.id,
            book_id: code.book_id,
            code: code.code,
            status: code.status.to_string(),
            assigned_at: code.assigned_at,
            used_at: code.used_at,
            created_at: code.created_at,
        }
    }
}

fn job_filter(status: Option<&str>) -> Result<JobFilter, PortError> {
    match status.map(str::trim) {
        None | Some("") | Some("all") => Ok(JobFilter::All),
        Some(raw) => JobState::from_str(raw)
            .map(JobFilter::Only)
            .map_err(|_| PortError::Validation(format!("Unknown job status: {}", raw))),
    }
}

//=========================================================================================
// Handlers
//=========================================================================================

/// Enqueue a background job that generates codes for a book.
#[utoipa::path(
    post,
    path = "/codes/generate",
    request_body = GenerateCodesRequest,
    responses(
        (status = 202, description = "Job enqueued", body = JobAcceptedResponse),
        (status = 400, description = "Invalid quantity", body = crate::error::ErrorBody),
        (status = 404, description = "Book not found", body = crate::error::ErrorBody),
        (status = 409, description = "Book archived or capacity exceeded", body = crate::error::ErrorBody)
    ),
    tag = "Codes"
)]
pub async fn generate_codes(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<GenerateCodesRequest>,
) -> Result<(StatusCode, Json<JobAcceptedResponse>), ApiError> {
    let job = app_state
        .generation
        .enqueue(GenerateCodes {
            book_id: payload.book_id,
            quantity: payload.quantity,
            pattern: payload.pattern,
        })
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(JobAcceptedResponse {
            message: format!(
                "Job enqueued to generate {} codes in the background",
                job.request.quantity
            ),
            job_id: job.id,
            book_id: job.request.book_id,
            quantity: job.request.quantity,
            pattern: job.request.pattern,
            state: job.state.as_str().to_string(),
        }),
    ))
}

/// Get the state and progress of a generation job.
#[utoipa::path(
    get,
    path = "/codes/job/{job_id}",
    params(("job_id" = Uuid, Path, description = "The job id.")),
    responses(
        (status = 200, description = "Job found", body = JobView),
        (status = 404, description = "Job not found", body = crate::error::ErrorBody)
    ),
    tag = "Codes"
)]
pub async fn get_job(
    State(app_state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
    let job = app_state.generation.job(job_id).await?;
    Ok(Json(job.into()))
}

/// List generation jobs, optionally restricted to one state.
#[utoipa::path(
    get,
    path = "/codes/jobs",
    params(JobListParams),
    responses(
        (status = 200, description = "Jobs listed", body = JobListResponse),
        (status = 400, description = "Unknown status", body = crate::error::ErrorBody)
    ),
    tag = "Codes"
)]
pub async fn list_jobs(
    State(app_state): State<Arc<AppState>>,
    Query(params): Query<JobListParams>,
) -> Result<Json<JobListResponse>, ApiError> {
    let filter = job_filter(params.status.as_deref())?;
    let limit = params.limit.unwrap_or(DEFAULT_JOB_PAGE);
    let offset = params.offset.unwrap_or(0);
    let jobs = app_state.generation.jobs(filter, limit, offset).await?;
    let counts = app_state.generation.counts().await?;
    let total = match filter {
        JobFilter::All => counts.total(),
        JobFilter::Only(state) => counts.of(state),
    };
    Ok(Json(JobListResponse {
        data: jobs.into_iter().map(JobView::from).collect(),
        limit,
        offset,
        total: total as usize,
    }))
}

/// Count the queue's jobs per state.
#[utoipa::path(
    get,
    path = "/codes/jobs/stats",
    responses((status = 200, description = "Job counts", body = JobStatsResponse)),
    tag = "Codes"
)]
pub async fn job_stats(
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<JobStatsResponse>, ApiError> {
    Ok(Json(app_state.generation.counts().await?.into()))
}

/// List codes, newest first, optionally narrowed to a book and a status.
#[utoipa::path(
    get,
    path = "/codes",
    params(CodeListParams),
    responses(
        (status = 200, description = "Codes listed", body = CodeListResponse),
        (status = 400, description = "Unknown status", body = crate::error::ErrorBody)
    ),
    tag = "Codes"
)]
pub async fn list_codes(
    State(app_state): State<Arc<AppState>>,
    Query(params): Query<CodeListParams>,
) -> Result<Json<CodeListResponse>, ApiError> {
    let filter = CodeFilter {
        book_id: params.book_id,
        status: coupon_status_filter(params.status.as_deref())?,
    };
    let page = page(params.limit, params.offset);
    let codes = app_state.books.codes(filter, page).await?;
    Ok(Json(CodeListResponse {
        data: codes.items.into_iter().map(CodeView::from).collect(),
        limit: page.limit,
        offset: page.offset,
        total: codes.total,
    }))
}

/// Get one code.
#[utoipa::path(
    get,
    path = "/codes/{id}",
    params(("id" = i64, Path, description = "The code id.")),
    responses(
        (status = 200, description = "Code found", body = CodeView),
        (status = 404, description = "Code not found", body = crate::error::ErrorBody)
    ),
    tag = "Codes"
)]
pub async fn get_code(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<CodeView>, ApiError> {
    Ok(Json(app_state.books.code(id).await?.into()))
}

/// Re-queue a failed generation job.
#[utoipa::path(
    post,
    path = "/codes/job/{job_id}/retry",
    params(("job_id" = Uuid, Path, description = "The job id.")),
    responses(
        (status = 200, description = "Job re-queued", body = JobView),
        (status = 404, description = "Job not found", body = crate::error::ErrorBody),
        (status = 409, description = "Job has not failed", body = crate::error::ErrorBody)
    ),
    tag = "Codes"
)]
pub async fn retry_job(
    State(app_state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
    let job = app_state.generation.retry(job_id).await?;
    Ok(Json(job.into()))
}

/// Cancel a generation job that has not started yet.
#[utoipa::path(
    delete,
    path = "/codes/job/{job_id}",
    params(("job_id" = Uuid, Path, description = "The job id.")),
    responses(
        (status = 204, description = "Job removed"),
        (status = 404, description = "Job not found", body = crate::error::ErrorBody),
        (status = 409, description = "Job already started", body = crate::error::ErrorBody)
    ),
    tag = "Codes"
)]
pub async fn cancel_job(
    State(app_state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    app_state.generation.cancel(job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Take a code out of circulation.
#[utoipa::path(
    patch,
    path = "/codes/{id}/disable",
    params(("id" = i64, Path, description = "The code id.")),
    responses(
        (status = 200, description = "Code disabled", body = CodeView),
        (status = 404, description = "Code not found", body = crate::error::ErrorBody),
        (status = 409, description = "Code already redeemed", body = crate::error::ErrorBody)
    ),
    tag = "Codes"
)]
pub async fn disable_code(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<CodeView>, ApiError> {
    Ok(Json(app_state.books.disable_code(id).await?.into()))
}

/// Put a disabled code back into circulation.
#[utoipa::path(
    patch,
    path = "/codes/{id}/enable",
    params(("id" = i64, Path, description = "The code id.")),
    responses(
        (status = 200, description = "Code enabled", body = CodeView),
        (status = 404, description = "Code not found", body = crate::error::ErrorBody),
        (status = 409, description = "Code is not disabled", body = crate::error::ErrorBody)
    ),
    tag = "Codes"
)]
pub async fn enable_code(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<CodeView>, ApiError> {
    Ok(Json(app_state.books.enable_code(id).await?.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_filter_parsing() {
        assert_eq!(job_filter(None).unwrap(), JobFilter::All);
        assert_eq!(job_filter(Some("all")).unwrap(), JobFilter::All);
        assert_eq!(
            job_filter(Some("failed")).unwrap(),
            JobFilter::Only(JobState::Failed)
        );
        assert_eq!(job_filter(Some("stuck")).unwrap_err().status_code(), 400);
    }
}
