pub mod assignments;
pub mod books;
pub mod codes;
pub mod redemptions;
pub mod rest;
pub mod state;

use crate::error::redact_error_details;
use axum::{
    middleware::map_response_with_state,
    routing::{delete, get, patch, post},
    Router,
};
use coupon_book_core::domain::{CouponStatus, Page};
use coupon_book_core::ports::PortError;
use state::AppState;
use std::str::FromStr;
use std::sync::Arc;

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

/// Page bounds from the `limit` and `offset` query parameters.
pub(crate) fn page(limit: Option<i64>, offset: Option<i64>) -> Page {
    Page {
        limit: limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
        offset: offset.unwrap_or(0).max(0),
    }
}

/// Parses an optional `status` query parameter, ignoring case.
pub(crate) fn coupon_status_filter(raw: Option<&str>) -> Result<Option<CouponStatus>, PortError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => CouponStatus::from_str(&raw.to_uppercase())
            .map(Some)
            .map_err(|_| PortError::Validation(format!("Unknown coupon status: {}", raw))),
    }
}

/// Builds the REST router over the shared state. Layers (CORS, tracing,
/// Swagger UI) are added by the binary.
pub fn router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(rest::health))
        .route("/books", post(books::create_book))
        .route(
            "/books/{id}",
            get(books::get_book).patch(books::update_book),
        )
        .route("/books/{id}/pause", post(books::pause_book))
        .route("/books/{id}/archive", post(books::archive_book))
        .route("/books/{id}/reactivate", post(books::reactivate_book))
        .route("/codes", get(codes::list_codes))
        .route("/codes/generate", post(codes::generate_codes))
        .route("/codes/jobs", get(codes::list_jobs))
        .route("/codes/jobs/stats", get(codes::job_stats))
        .route(
            "/codes/job/{job_id}",
            get(codes::get_job).delete(codes::cancel_job),
        )
        .route("/codes/job/{job_id}/retry", post(codes::retry_job))
        .route("/codes/{id}", get(codes::get_code))
        .route("/codes/{id}/disable", patch(codes::disable_code))
        .route("/codes/{id}/enable", patch(codes::enable_code))
        .route("/assignments/random", post(assignments::assign_random))
        .route("/assignments/specific", post(assignments::assign_specific))
        .route("/assignments/{id}", delete(assignments::unassign))
        .route(
            "/assignments/user/{user_id}",
            get(assignments::list_user_assignments),
        )
        .route(
            "/lock/{code}",
            post(redemptions::lock_coupon).delete(redemptions::release_lock),
        )
        .route("/redeem/{code}", post(redemptions::redeem_coupon))
        .route("/redemptions", get(redemptions::list_redemptions))
        .layer(map_response_with_state(app_state.clone(), redact_error_details))
        .with_state(app_state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_bounds_are_clamped() {
        assert_eq!(page(None, None), Page { limit: 20, offset: 0 });
        assert_eq!(page(Some(500), Some(-3)), Page { limit: 100, offset: 0 });
        assert_eq!(page(Some(0), Some(40)), Page { limit: 1, offset: 40 });
    }

    #[test]
    fn status_filter_ignores_case() {
        assert_eq!(coupon_status_filter(None).unwrap(), None);
        assert_eq!(
            coupon_status_filter(Some("assigned")).unwrap(),
            Some(CouponStatus::Assigned)
        );
        assert_eq!(coupon_status_filter(Some("lost")).unwrap_err().status_code(), 400);
    }
}
