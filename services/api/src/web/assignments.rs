//! services/api/src/web/assignments.rs
//!
//! Handlers for assigning codes to users and undoing assignments.

use crate::error::ApiError;
use crate::web::state::AppState;
use crate::web::coupon_status_filter;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use coupon_book_core::domain::{AssignmentDetail, CodeFilter, CouponAssignment, User};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};

//=========================================================================================
// Payloads
//=========================================================================================

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RandomAssignmentRequest {
    pub book_id: i64,
    pub user_id: i64,
    /// Defaults to one code.
    pub quantity: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SpecificAssignmentRequest {
    pub code: String,
    pub user_id: i64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UserView {
    pub id: i64,
    pub name: String,
    pub email: String,
}

impl From<User> for UserView {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            name: user.name,
            email: user.email,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AssignmentView {
    pub id: i64,
    pub coupon_id: i64,
    pub user_id: i64,
    pub assigned_at: DateTime<Utc>,
}

impl From<CouponAssignment> for AssignmentView {
    fn from(a: CouponAssignment) -> Self {
        Self {
            id: a.id,
            coupon_id: a.coupon_id,
            user_id: a.user_id,
            assigned_at: a.assigned_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AssignmentsResponse {
    pub user: UserView,
    pub assignments: Vec<AssignmentView>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct UserAssignmentParams {
    pub book_id: Option<i64>,
    /// Status of the assigned code, e.g. `ASSIGNED` or `REDEEMED`.
    pub status: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UserAssignmentView {
    pub assignment_id: i64,
    pub assigned_at: DateTime<Utc>,
    pub coupon_id: i64,
    pub code: String,
    pub status: String,
    pub book_id: i64,
    pub book_name: String,
    pub used_at: Option<DateTime<Utc>>,
}

impl From<AssignmentDetail> for UserAssignmentView {
    fn from(detail: AssignmentDetail) -> Self {
        Self {
            assignment_id: detail.assignment.id,
            assigned_at: detail.assignment.assigned_at,
            coupon_id: detail.code.id,
            code: detail.code.code,
            status: detail.code.status.to_string(),
            book_id: detail.code.book_id,
            book_name: detail.book_name,
            used_at: detail.code.used_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UserAssignmentsResponse {
    pub user: UserView,
    pub assignments: Vec<UserAssignmentView>,
    pub total: usize,
}

//=========================================================================================
// Handlers
//=========================================================================================

/// Assign random available codes of a book to a user.
#[utoipa::path(
    post,
    path = "/assignments/random",
    request_body = RandomAssignmentRequest,
    responses(
        (status = 201, description = "Codes assigned", body = AssignmentsResponse),
        (status = 400, description = "Not enough available codes", body = crate::error::ErrorBody),
        (status = 403, description = "Per-user assignment limit reached", body = crate::error::ErrorBody),
        (status = 404, description = "Book or user not found", body = crate::error::ErrorBody),
        (status = 409, description = "Book is not open", body = crate::error::ErrorBody)
    ),
    tag = "Assignments"
)]
pub async fn assign_random(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<RandomAssignmentRequest>,
) -> Result<(StatusCode, Json<AssignmentsResponse>), ApiError> {
    let (user, assignments) = app_state
        .assignments
        .assign_random(payload.book_id, payload.user_id, payload.quantity.unwrap_or(1))
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(AssignmentsResponse {
            user: user.into(),
            assignments: assignments.into_iter().map(AssignmentView::from).collect(),
        }),
    ))
}

/// Assign one specific available code to a user.
#[utoipa::path(
    post,
    path = "/assignments/specific",
    request_body = SpecificAssignmentRequest,
    responses(
        (status = 201, description = "Code assigned", body = AssignmentsResponse),
        (status = 403, description = "Per-user assignment limit reached", body = crate::error::ErrorBody),
        (status = 404, description = "Code not available or user not found", body = crate::error::ErrorBody),
        (status = 409, description = "Book is not open", body = crate::error::ErrorBody)
    ),
    tag = "Assignments"
)]
pub async fn assign_specific(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<SpecificAssignmentRequest>,
) -> Result<(StatusCode, Json<AssignmentsResponse>), ApiError> {
    let (user, assignment) = app_state
        .assignments
        .assign_specific(&payload.code, payload.user_id)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(AssignmentsResponse {
            user: user.into(),
            assignments: vec![assignment.into()],
        }),
    ))
}

/// Undo an assignment and return its code to the pool.
#[utoipa::path(
    delete,
    path = "/assignments/{id}",
    params(("id" = i64, Path, description = "The assignment id.")),
    responses(
        (status = 204, description = "Assignment removed"),
        (status = 400, description = "Code is no longer assigned", body = crate::error::ErrorBody),
        (status = 404, description = "Assignment not found", body = crate::error::ErrorBody)
    ),
    tag = "Assignments"
)]
pub async fn unassign(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    app_state.assignments.unassign(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// List a user's live assignments, newest first.
#[utoipa::path(
    get,
    path = "/assignments/user/{user_id}",
    params(("user_id" = i64, Path, description = "The user id."), UserAssignmentParams),
    responses(
        (status = 200, description = "Assignments listed", body = UserAssignmentsResponse),
        (status = 400, description = "Unknown status", body = crate::error::ErrorBody),
        (status = 404, description = "User not found", body = crate::error::ErrorBody)
    ),
    tag = "Assignments"
)]
pub async fn list_user_assignments(
    State(app_state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
    Query(params): Query<UserAssignmentParams>,
) -> Result<Json<UserAssignmentsResponse>, ApiError> {
    let filter = CodeFilter {
        book_id: params.book_id,
        status: coupon_status_filter(params.status.as_deref())?,
    };
    let (user, assignments) = app_state.assignments.for_user(user_id, filter).await?;
    Ok(Json(UserAssignmentsResponse {
        user: user.into(),
        total: assignments.len(),
        assignments: assignments.into_iter().map(UserAssignmentView::from).collect(),
    }))
}
