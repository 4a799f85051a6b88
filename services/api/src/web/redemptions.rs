//! services/api/src/web/redemptions.rs
//!
//! Handlers for the lock and redeem endpoints.

use crate::error::ApiError;
use crate::web::page;
use crate::web::state::AppState;
use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use chrono::{DateTime, Utc};
use coupon_book_core::domain::{
    CouponStatus, LockEntry, RedemptionDetail, RedemptionFilter, RedemptionSummary, Release,
};
use coupon_book_core::ports::PortError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

//=========================================================================================
// Payloads
//=========================================================================================

/// Returned after a coupon has been locked for its assigned user.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LockResponse {
    pub message: String,
    pub locked: bool,
    /// Present this token to release the lock or to redeem.
    pub token: Uuid,
    pub coupon_id: i64,
    pub code: String,
    pub book_id: i64,
    pub book_name: String,
    pub user_id: i64,
    pub user_name: String,
    pub user_email: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Lock lifetime in seconds.
    pub expires_in: u64,
}

impl LockResponse {
    fn from_entry(entry: LockEntry, expires_in: u64) -> Self {
        Self {
            message: "Coupon locked successfully".to_string(),
            locked: true,
            token: entry.token,
            coupon_id: entry.coupon_id,
            code: entry.code,
            book_id: entry.book_id,
            book_name: entry.book_name,
            user_id: entry.user_id,
            user_name: entry.user_name,
            user_email: entry.user_email,
            locked_at: entry.locked_at,
            expires_at: entry.expires_at,
            expires_in,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ReleaseParams {
    /// Token returned when the lock was acquired.
    pub token: Option<Uuid>,
    /// Admin override: release whoever holds the lock.
    pub force: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ReleaseResponse {
    pub message: String,
    pub released: bool,
    pub code: String,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct RedeemParams {
    /// When given, it must match the token of the current lock.
    pub token: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RedemptionResponse {
    pub message: String,
    pub redemption_id: i64,
    pub coupon_code: String,
    pub book_name: String,
    pub user_id: i64,
    pub user_name: String,
    pub user_email: String,
    pub status: String,
    pub redeemed_at: DateTime<Utc>,
}

impl From<RedemptionSummary> for RedemptionResponse {
    fn from(summary: RedemptionSummary) -> Self {
        Self {
            message: "Coupon redeemed successfully".to_string(),
            redemption_id: summary.redemption_id,
            coupon_code: summary.coupon_code,
            book_name: summary.book_name,
            user_id: summary.user_id,
            user_name: summary.user_name,
            user_email: summary.user_email,
            status: summary.status.to_string(),
            redeemed_at: summary.redeemed_at,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct RedemptionListParams {
    pub user_id: Option<i64>,
    pub book_id: Option<i64>,
    /// Defaults to 20, at most 100.
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RedemptionView {
    pub id: i64,
    pub coupon_id: i64,
    pub coupon_code: String,
    pub book_id: i64,
    pub book_name: String,
    pub assignment_id: Option<i64>,
    pub user_id: Option<i64>,
    pub user_name: Option<String>,
    pub user_email: Option<String>,
    pub status: String,
    pub redeemed_at: DateTime<Utc>,
}

impl From<RedemptionDetail> for RedemptionView {
    fn from(detail: RedemptionDetail) -> Self {
        let (user_id, user_name, user_email) = match detail.user {
            Some(user) => (Some(user.id), Some(user.name), Some(user.email)),
            None => (None, None, None),
        };
        Self {
            id: detail.redemption.id,
            coupon_id: detail.redemption.coupon_id,
            coupon_code: detail.coupon_code,
            book_id: detail.book_id,
            book_name: detail.book_name,
            assignment_id: detail.redemption.assignment_id,
            user_id,
            user_name,
            user_email,
            status: CouponStatus::Redeemed.to_string(),
            redeemed_at: detail.redemption.redeemed_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RedemptionListResponse {
    pub data: Vec<RedemptionView>,
    pub limit: i64,
    pub offset: i64,
    pub total: i64,
}

//=========================================================================================
// Handlers
//=========================================================================================

/// Lock a coupon for redemption by its assigned user.
#[utoipa::path(
    post,
    path = "/lock/{code}",
    params(("code" = String, Path, description = "The coupon code.")),
    responses(
        (status = 200, description = "Coupon locked", body = LockResponse),
        (status = 400, description = "Coupon is not in a lockable state", body = crate::error::ErrorBody),
        (status = 403, description = "Redemption limit reached", body = crate::error::ErrorBody),
        (status = 404, description = "Coupon, user or book not found", body = crate::error::ErrorBody),
        (status = 409, description = "Already locked by someone else", body = crate::error::ErrorBody)
    ),
    tag = "Redemptions"
)]
pub async fn lock_coupon(
    State(app_state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<LockResponse>, ApiError> {
    let entry = app_state.redemptions.lock(&code).await?;
    let expires_in = app_state.redemptions.lock_ttl().as_secs();
    Ok(Json(LockResponse::from_entry(entry, expires_in)))
}

/// Release a lock, either as its holder (`token`) or as an admin (`force=true`).
#[utoipa::path(
    delete,
    path = "/lock/{code}",
    params(("code" = String, Path, description = "The coupon code."), ReleaseParams),
    responses(
        (status = 200, description = "Lock released", body = ReleaseResponse),
        (status = 400, description = "Neither token nor force given", body = crate::error::ErrorBody),
        (status = 404, description = "No active lock", body = crate::error::ErrorBody),
        (status = 409, description = "Token does not match the lock", body = crate::error::ErrorBody)
    ),
    tag = "Redemptions"
)]
pub async fn release_lock(
    State(app_state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Query(params): Query<ReleaseParams>,
) -> Result<Json<ReleaseResponse>, ApiError> {
    let release = match (params.force.unwrap_or(false), params.token) {
        (true, _) => Release::Force,
        (false, Some(token)) => Release::Token(token),
        (false, None) => {
            return Err(PortError::Validation(
                "A lock token or force=true is required".to_string(),
            )
            .into())
        }
    };
    app_state.redemptions.release(&code, release).await?;
    Ok(Json(ReleaseResponse {
        message: "Coupon lock released successfully".to_string(),
        released: true,
        code: coupon_book_core::pattern::normalize_code(&code),
    }))
}

/// Redeem a locked coupon.
#[utoipa::path(
    post,
    path = "/redeem/{code}",
    params(("code" = String, Path, description = "The coupon code."), RedeemParams),
    responses(
        (status = 200, description = "Coupon redeemed", body = RedemptionResponse),
        (status = 400, description = "Not locked, lock expired, or wrong status", body = crate::error::ErrorBody),
        (status = 403, description = "Redemption limit reached", body = crate::error::ErrorBody),
        (status = 404, description = "Coupon, assignment or book not found", body = crate::error::ErrorBody),
        (status = 409, description = "Token does not match the lock", body = crate::error::ErrorBody)
    ),
    tag = "Redemptions"
)]
pub async fn redeem_coupon(
    State(app_state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Query(params): Query<RedeemParams>,
) -> Result<Json<RedemptionResponse>, ApiError> {
    let summary = app_state.redemptions.redeem(&code, params.token).await?;
    Ok(Json(summary.into()))
}

/// List redemptions, newest first.
#[utoipa::path(
    get,
    path = "/redemptions",
    params(RedemptionListParams),
    responses((status = 200, description = "Redemptions listed", body = RedemptionListResponse)),
    tag = "Redemptions"
)]
pub async fn list_redemptions(
    State(app_state): State<Arc<AppState>>,
    Query(params): Query<RedemptionListParams>,
) -> Result<Json<RedemptionListResponse>, ApiError> {
    let page = page(params.limit, params.offset);
    let filter = RedemptionFilter {
        user_id: params.user_id,
        book_id: params.book_id,
    };
    let redemptions = app_state.redemptions.history(filter, page).await?;
    Ok(Json(RedemptionListResponse {
        data: redemptions.items.into_iter().map(RedemptionView::from).collect(),
        limit: page.limit,
        offset: page.offset,
        total: redemptions.total,
    }))
}
