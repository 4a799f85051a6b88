//! services/api/src/web/rest.rs
//!
//! Contains the health endpoint and the master definition of the OpenAPI
//! document.

use crate::web::{assignments, books, codes, redemptions};
use axum::response::Json;
use serde::{Deserialize, Serialize};
use utoipa::{OpenApi, ToSchema};

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        books::create_book,
        books::get_book,
        books::update_book,
        books::pause_book,
        books::archive_book,
        books::reactivate_book,
        codes::generate_codes,
        codes::get_job,
        codes::list_jobs,
        codes::job_stats,
        codes::list_codes,
        codes::get_code,
        codes::retry_job,
        codes::cancel_job,
        codes::disable_code,
        codes::enable_code,
        assignments::assign_random,
        assignments::assign_specific,
        assignments::unassign,
        assignments::list_user_assignments,
        redemptions::lock_coupon,
        redemptions::release_lock,
        redemptions::redeem_coupon,
        redemptions::list_redemptions,
    ),
    components(
        schemas(
            HealthResponse,
            crate::error::ErrorBody,
            books::BookView,
            books::CreateBookRequest,
            books::CreateBookResponse,
            books::UpdateBookRequest,
            codes::GenerateCodesRequest,
            codes::JobAcceptedResponse,
            codes::JobOutcomeView,
            codes::JobView,
            codes::JobListResponse,
            codes::JobStatsResponse,
            codes::CodeView,
            codes::CodeListResponse,
            assignments::RandomAssignmentRequest,
            assignments::SpecificAssignmentRequest,
            assignments::UserView,
            assignments::AssignmentView,
            assignments::AssignmentsResponse,
            assignments::UserAssignmentView,
            assignments::UserAssignmentsResponse,
            redemptions::LockResponse,
            redemptions::ReleaseResponse,
            redemptions::RedemptionResponse,
            redemptions::RedemptionView,
            redemptions::RedemptionListResponse,
        )
    ),
    tags(
        (name = "Books", description = "Coupon book lifecycle."),
        (name = "Codes", description = "Background code generation and code overrides."),
        (name = "Assignments", description = "Handing codes out to users."),
        (name = "Redemptions", description = "Two-phase lock and redeem."),
        (name = "Health", description = "Liveness probe.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// Health
//=========================================================================================

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = HealthResponse)),
    tag = "Health"
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}
