//! services/api/src/web/books.rs
//!
//! Handlers for the coupon book lifecycle.

use crate::error::ApiError;
use crate::web::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use coupon_book_core::domain::{BookUpdate, CouponBook, NewBook};
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

//=========================================================================================
// Payloads
//=========================================================================================

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BookView {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub code_pattern: Option<String>,
    pub total_codes: Option<i64>,
    pub allow_multiple_redemptions_per_user: bool,
    pub per_user_max_assigned_codes: Option<i64>,
    pub per_user_max_redemptions: Option<i64>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl From<CouponBook> for BookView {
    fn from(book: CouponBook) -> Self {
        Self {
            id: book.id,
            name: book.name,
            description: book.description,
            code_pattern: book.code_pattern,
            total_codes: book.total_codes,
            allow_multiple_redemptions_per_user: book.allow_multiple_redemptions_per_user,
            per_user_max_assigned_codes: book.per_user_max_assigned_codes,
            per_user_max_redemptions: book.per_user_max_redemptions,
            start_at: book.start_at,
            end_at: book.end_at,
            status: book.status.to_string(),
            created_at: book.created_at,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct CreateBookRequest {
    pub name: String,
    pub description: Option<String>,
    pub code_pattern: Option<String>,
    pub total_codes: Option<i64>,
    #[serde(default)]
    pub allow_multiple_redemptions_per_user: bool,
    pub per_user_max_assigned_codes: Option<i64>,
    pub per_user_max_redemptions: Option<i64>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    /// When set, a generation job for this many codes is enqueued right away.
    pub initial_codes: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateBookResponse {
    pub book: BookView,
    pub job_id: Option<Uuid>,
}

/// Keeps "absent" apart from an explicit `null`: a missing field stays `None`
/// through `#[serde(default)]`, `null` becomes `Some(None)`.
fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

/// Omitted fields are left as they are. Sending `null` clears an optional field.
#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateBookRequest {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<String>)]
    pub description: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<String>)]
    pub code_pattern: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<i64>)]
    pub total_codes: Option<Option<i64>>,
    pub allow_multiple_redemptions_per_user: Option<bool>,
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<i64>)]
    pub per_user_max_assigned_codes: Option<Option<i64>>,
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<i64>)]
    pub per_user_max_redemptions: Option<Option<i64>>,
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<String>, format = DateTime)]
    pub start_at: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<String>, format = DateTime)]
    pub end_at: Option<Option<DateTime<Utc>>>,
}

impl From<UpdateBookRequest> for BookUpdate {
    fn from(req: UpdateBookRequest) -> Self {
        BookUpdate {
            name: req.name,
            description: req.description,
            code_pattern: req.code_pattern,
            total_codes: req.total_codes,
            allow_multiple_redemptions_per_user: req.allow_multiple_redemptions_per_user,
            per_user_max_assigned_codes: req.per_user_max_assigned_codes,
            per_user_max_redemptions: req.per_user_max_redemptions,
            start_at: req.start_at,
            end_at: req.end_at,
        }
    }
}

//=========================================================================================
// Handlers
//=========================================================================================

/// Create a coupon book, optionally enqueueing its first codes.
#[utoipa::path(
    post,
    path = "/books",
    request_body = CreateBookRequest,
    responses(
        (status = 201, description = "Book created", body = CreateBookResponse),
        (status = 400, description = "Invalid book", body = crate::error::ErrorBody),
        (status = 409, description = "Initial codes exceed the book capacity", body = crate::error::ErrorBody)
    ),
    tag = "Books"
)]
pub async fn create_book(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<CreateBookRequest>,
) -> Result<(StatusCode, Json<CreateBookResponse>), ApiError> {
    let initial_codes = payload.initial_codes;
    let new_book = NewBook {
        name: payload.name,
        description: payload.description,
        code_pattern: payload.code_pattern,
        total_codes: payload.total_codes,
        allow_multiple_redemptions_per_user: payload.allow_multiple_redemptions_per_user,
        per_user_max_assigned_codes: payload.per_user_max_assigned_codes,
        per_user_max_redemptions: payload.per_user_max_redemptions,
        start_at: payload.start_at,
        end_at: payload.end_at,
    };
    let (book, job) = app_state.books.create(new_book, initial_codes).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateBookResponse {
            book: book.into(),
            job_id: job.map(|j| j.id),
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/books/{id}",
    params(("id" = i64, Path, description = "The book id.")),
    responses(
        (status = 200, description = "Book found", body = BookView),
        (status = 404, description = "Book not found", body = crate::error::ErrorBody)
    ),
    tag = "Books"
)]
pub async fn get_book(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<BookView>, ApiError> {
    Ok(Json(app_state.books.get(id).await?.into()))
}

/// Update a book's fields. Archived books cannot be modified.
#[utoipa::path(
    patch,
    path = "/books/{id}",
    params(("id" = i64, Path, description = "The book id.")),
    request_body = UpdateBookRequest,
    responses(
        (status = 200, description = "Book updated", body = BookView),
        (status = 404, description = "Book not found", body = crate::error::ErrorBody),
        (status = 409, description = "Book is archived", body = crate::error::ErrorBody)
    ),
    tag = "Books"
)]
pub async fn update_book(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateBookRequest>,
) -> Result<Json<BookView>, ApiError> {
    Ok(Json(app_state.books.update(id, payload.into()).await?.into()))
}

#[utoipa::path(
    post,
    path = "/books/{id}/pause",
    params(("id" = i64, Path, description = "The book id.")),
    responses(
        (status = 200, description = "Book paused", body = BookView),
        (status = 404, description = "Book not found", body = crate::error::ErrorBody),
        (status = 409, description = "Book is archived", body = crate::error::ErrorBody)
    ),
    tag = "Books"
)]
pub async fn pause_book(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<BookView>, ApiError> {
    Ok(Json(app_state.books.pause(id).await?.into()))
}

#[utoipa::path(
    post,
    path = "/books/{id}/archive",
    params(("id" = i64, Path, description = "The book id.")),
    responses(
        (status = 200, description = "Book archived", body = BookView),
        (status = 404, description = "Book not found", body = crate::error::ErrorBody),
        (status = 409, description = "Book is already archived", body = crate::error::ErrorBody)
    ),
    tag = "Books"
)]
pub async fn archive_book(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<BookView>, ApiError> {
    Ok(Json(app_state.books.archive(id).await?.into()))
}

#[utoipa::path(
    post,
    path = "/books/{id}/reactivate",
    params(("id" = i64, Path, description = "The book id.")),
    responses(
        (status = 200, description = "Book reactivated", body = BookView),
        (status = 404, description = "Book not found", body = crate::error::ErrorBody),
        (status = 409, description = "Book is archived", body = crate::error::ErrorBody)
    ),
    tag = "Books"
)]
pub async fn reactivate_book(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<BookView>, ApiError> {
    Ok(Json(app_state.books.reactivate(id).await?.into()))
}
