//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `CouponStore` port from the `core` crate. It handles all interactions
//! with the PostgreSQL database using `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coupon_book_core::domain::{
    AssignmentDetail, BookStatus, BookUpdate, CodeFilter, CouponAssignment, CouponBook,
    CouponCode, CouponRedemption, CouponStatus, NewBook, Page, Paged, RedemptionCommit,
    RedemptionDetail, RedemptionFilter, User,
};
use coupon_book_core::eligibility::ensure_assignment_fits;
use coupon_book_core::ports::{CouponStore, PortError, PortResult};
use sqlx::{FromRow, PgConnection, PgPool};
use std::collections::HashSet;
use std::str::FromStr;
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `CouponStore` port.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Creates a new `PgStore`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

/// Like `unexpected`, but surfaces unique violations as `Duplicate`.
fn write_error(e: sqlx::Error) -> PortError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.is_unique_violation() {
            return PortError::Duplicate(db_err.message().to_string());
        }
    }
    unexpected(e)
}

fn coupon_status(raw: &str) -> PortResult<CouponStatus> {
    CouponStatus::from_str(raw).map_err(PortError::Unexpected)
}

/// Splits a partial-update field into "was it sent" and its new value.
fn split<T>(field: Option<Option<T>>) -> (bool, Option<T>) {
    match field {
        Some(value) => (true, value),
        None => (false, None),
    }
}

/// Re-counts the user's live assignments in a book inside the caller's
/// transaction. The user row is locked first so concurrent assignments for
/// the same user queue up behind each other.
async fn ensure_cap_in_tx(
    conn: &mut PgConnection,
    book_id: i64,
    user_id: i64,
    quantity: i64,
    per_user_cap: Option<i64>,
) -> PortResult<()> {
    if per_user_cap.is_none() {
        return Ok(());
    }
    sqlx::query("SELECT id FROM users WHERE id = $1 FOR UPDATE")
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(unexpected)?;
    let current: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM coupon_assignments a \
         JOIN coupon_codes c ON c.id = a.coupon_id \
         WHERE a.user_id = $1 AND c.book_id = $2 AND a.deleted_at IS NULL",
    )
    .bind(user_id)
    .bind(book_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(unexpected)?;
    ensure_assignment_fits(current, quantity, per_user_cap)
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

const BOOK_COLUMNS: &str = "id, name, description, code_pattern, total_codes, \
    allow_multiple_redemptions_per_user, per_user_max_assigned_codes, \
    per_user_max_redemptions, start_at, end_at, status, created_at";

const CODE_COLUMNS: &str = "id, book_id, code, status, assigned_at, used_at, created_at";

const ASSIGNMENT_COLUMNS: &str = "id, coupon_id, user_id, assigned_at";

#[derive(FromRow)]
struct BookRecord {
    id: i64,
    name: String,
    description: Option<String>,
    code_pattern: Option<String>,
    total_codes: Option<i64>,
    allow_multiple_redemptions_per_user: bool,
    per_user_max_assigned_codes: Option<i64>,
    per_user_max_redemptions: Option<i64>,
    start_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
    status: String,
    created_at: DateTime<Utc>,
}
impl BookRecord {
    fn to_domain(self) -> PortResult<CouponBook> {
        Ok(CouponBook {
            id: self.id,
            name: self.name,
            description: self.description,
            code_pattern: self.code_pattern,
            total_codes: self.total_codes,
            allow_multiple_redemptions_per_user: self.allow_multiple_redemptions_per_user,
            per_user_max_assigned_codes: self.per_user_max_assigned_codes,
            per_user_max_redemptions: self.per_user_max_redemptions,
            start_at: self.start_at,
            end_at: self.end_at,
            status: BookStatus::from_str(&self.status).map_err(PortError::Unexpected)?,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct CodeRecord {
    id: i64,
    book_id: i64,
    code: String,
    status: String,
    assigned_at: Option<DateTime<Utc>>,
    used_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}
impl CodeRecord {
    fn to_domain(self) -> PortResult<CouponCode> {
        Ok(CouponCode {
            id: self.id,
            book_id: self.book_id,
            code: self.code,
            status: coupon_status(&self.status)?,
            assigned_at: self.assigned_at,
            used_at: self.used_at,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct AssignmentRecord {
    id: i64,
    coupon_id: i64,
    user_id: i64,
    assigned_at: DateTime<Utc>,
}
impl AssignmentRecord {
    fn to_domain(self) -> CouponAssignment {
        CouponAssignment {
            id: self.id,
            coupon_id: self.coupon_id,
            user_id: self.user_id,
            assigned_at: self.assigned_at,
        }
    }
}

#[derive(FromRow)]
struct RedemptionRecord {
    id: i64,
    coupon_id: i64,
    assignment_id: Option<i64>,
    redeemed_at: DateTime<Utc>,
}
impl RedemptionRecord {
    fn to_domain(self) -> CouponRedemption {
        CouponRedemption {
            id: self.id,
            coupon_id: self.coupon_id,
            assignment_id: self.assignment_id,
            redeemed_at: self.redeemed_at,
        }
    }
}

#[derive(FromRow)]
struct UserAssignmentRecord {
    id: i64,
    coupon_id: i64,
    user_id: i64,
    assigned_at: DateTime<Utc>,
    book_id: i64,
    code: String,
    status: String,
    code_assigned_at: Option<DateTime<Utc>>,
    used_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    book_name: String,
}
impl UserAssignmentRecord {
    fn to_domain(self) -> PortResult<AssignmentDetail> {
        Ok(AssignmentDetail {
            assignment: CouponAssignment {
                id: self.id,
                coupon_id: self.coupon_id,
                user_id: self.user_id,
                assigned_at: self.assigned_at,
            },
            code: CouponCode {
                id: self.coupon_id,
                book_id: self.book_id,
                code: self.code,
                status: coupon_status(&self.status)?,
                assigned_at: self.code_assigned_at,
                used_at: self.used_at,
                created_at: self.created_at,
            },
            book_name: self.book_name,
        })
    }
}

#[derive(FromRow)]
struct RedemptionDetailRecord {
    id: i64,
    coupon_id: i64,
    assignment_id: Option<i64>,
    redeemed_at: DateTime<Utc>,
    code: String,
    book_id: i64,
    book_name: String,
    user_id: Option<i64>,
    user_email: Option<String>,
    user_name: Option<String>,
    user_is_active: Option<bool>,
    user_last_login_at: Option<DateTime<Utc>>,
}
impl RedemptionDetailRecord {
    fn to_domain(self) -> RedemptionDetail {
        let user = match (self.user_id, self.user_email, self.user_name) {
            (Some(id), Some(email), Some(name)) => Some(User {
                id,
                email,
                name,
                is_active: self.user_is_active.unwrap_or(true),
                last_login_at: self.user_last_login_at,
            }),
            _ => None,
        };
        RedemptionDetail {
            redemption: CouponRedemption {
                id: self.id,
                coupon_id: self.coupon_id,
                assignment_id: self.assignment_id,
                redeemed_at: self.redeemed_at,
            },
            coupon_code: self.code,
            book_id: self.book_id,
            book_name: self.book_name,
            user,
        }
    }
}

const REDEMPTION_FROM: &str = "FROM coupon_redemptions r \
    JOIN coupon_codes c ON c.id = r.coupon_id \
    JOIN coupon_books b ON b.id = c.book_id \
    LEFT JOIN coupon_assignments a ON a.id = r.assignment_id \
    LEFT JOIN users u ON u.id = a.user_id \
    WHERE r.deleted_at IS NULL \
      AND ($1::bigint IS NULL OR a.user_id = $1) \
      AND ($2::bigint IS NULL OR c.book_id = $2)";

const CODE_FILTER: &str = "WHERE deleted_at IS NULL \
    AND ($1::bigint IS NULL OR book_id = $1) \
    AND ($2::text IS NULL OR status = $2)";

#[derive(FromRow)]
struct UserRecord {
    id: i64,
    email: String,
    name: String,
    is_active: bool,
    last_login_at: Option<DateTime<Utc>>,
}
impl UserRecord {
    fn to_domain(self) -> User {
        User {
            id: self.id,
            email: self.email,
            name: self.name,
            is_active: self.is_active,
            last_login_at: self.last_login_at,
        }
    }
}

//=========================================================================================
// `CouponStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl CouponStore for PgStore {
    // --- Books ---

    async fn get_book(&self, book_id: i64) -> PortResult<Option<CouponBook>> {
        let query = format!(
            "SELECT {} FROM coupon_books WHERE id = $1 AND deleted_at IS NULL",
            BOOK_COLUMNS
        );
        sqlx::query_as::<_, BookRecord>(&query)
            .bind(book_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?
            .map(BookRecord::to_domain)
            .transpose()
    }

    async fn create_book(&self, book: NewBook) -> PortResult<CouponBook> {
        let query = format!(
            "INSERT INTO coupon_books (name, description, code_pattern, total_codes, \
             allow_multiple_redemptions_per_user, per_user_max_assigned_codes, \
             per_user_max_redemptions, start_at, end_at, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'ACTIVE') RETURNING {}",
            BOOK_COLUMNS
        );
        sqlx::query_as::<_, BookRecord>(&query)
            .bind(book.name)
            .bind(book.description)
            .bind(book.code_pattern)
            .bind(book.total_codes)
            .bind(book.allow_multiple_redemptions_per_user)
            .bind(book.per_user_max_assigned_codes)
            .bind(book.per_user_max_redemptions)
            .bind(book.start_at)
            .bind(book.end_at)
            .fetch_one(&self.pool)
            .await
            .map_err(write_error)?
            .to_domain()
    }

    async fn update_book(&self, book_id: i64, update: BookUpdate) -> PortResult<CouponBook> {
        // Each optional column takes a "sent" flag plus a value, so NULL can be written.
        let query = format!(
            "UPDATE coupon_books SET \
             name = COALESCE($2, name), \
             description = CASE WHEN $3 THEN $4 ELSE description END, \
             code_pattern = CASE WHEN $5 THEN $6 ELSE code_pattern END, \
             total_codes = CASE WHEN $7 THEN $8 ELSE total_codes END, \
             allow_multiple_redemptions_per_user = COALESCE($9, allow_multiple_redemptions_per_user), \
             per_user_max_assigned_codes = CASE WHEN $10 THEN $11 ELSE per_user_max_assigned_codes END, \
             per_user_max_redemptions = CASE WHEN $12 THEN $13 ELSE per_user_max_redemptions END, \
             start_at = CASE WHEN $14 THEN $15 ELSE start_at END, \
             end_at = CASE WHEN $16 THEN $17 ELSE end_at END, \
             updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL RETURNING {}",
            BOOK_COLUMNS
        );
        let (set_description, description) = split(update.description);
        let (set_pattern, code_pattern) = split(update.code_pattern);
        let (set_total, total_codes) = split(update.total_codes);
        let (set_assigned_cap, assigned_cap) = split(update.per_user_max_assigned_codes);
        let (set_redemption_cap, redemption_cap) = split(update.per_user_max_redemptions);
        let (set_start, start_at) = split(update.start_at);
        let (set_end, end_at) = split(update.end_at);
        sqlx::query_as::<_, BookRecord>(&query)
            .bind(book_id)
            .bind(update.name)
            .bind(set_description)
            .bind(description)
            .bind(set_pattern)
            .bind(code_pattern)
            .bind(set_total)
            .bind(total_codes)
            .bind(update.allow_multiple_redemptions_per_user)
            .bind(set_assigned_cap)
            .bind(assigned_cap)
            .bind(set_redemption_cap)
            .bind(redemption_cap)
            .bind(set_start)
            .bind(start_at)
            .bind(set_end)
            .bind(end_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(write_error)?
            .ok_or_else(|| PortError::NotFound(format!("Book {} not found", book_id)))?
            .to_domain()
    }

    async fn set_book_status(&self, book_id: i64, status: BookStatus) -> PortResult<CouponBook> {
        let query = format!(
            "UPDATE coupon_books SET status = $2, updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL RETURNING {}",
            BOOK_COLUMNS
        );
        sqlx::query_as::<_, BookRecord>(&query)
            .bind(book_id)
            .bind(status.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?
            .ok_or_else(|| PortError::NotFound(format!("Book {} not found", book_id)))?
            .to_domain()
    }

    // --- Users ---

    async fn get_user(&self, user_id: i64) -> PortResult<Option<User>> {
        let record = sqlx::query_as::<_, UserRecord>(
            "SELECT id, email, name, is_active, last_login_at FROM users \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(record.map(UserRecord::to_domain))
    }

    // --- Codes ---

    async fn get_code(&self, coupon_id: i64) -> PortResult<Option<CouponCode>> {
        let query = format!(
            "SELECT {} FROM coupon_codes WHERE id = $1 AND deleted_at IS NULL",
            CODE_COLUMNS
        );
        sqlx::query_as::<_, CodeRecord>(&query)
            .bind(coupon_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?
            .map(CodeRecord::to_domain)
            .transpose()
    }

    async fn find_code(&self, code: &str) -> PortResult<Option<CouponCode>> {
        let query = format!(
            "SELECT {} FROM coupon_codes WHERE code = $1 AND deleted_at IS NULL",
            CODE_COLUMNS
        );
        sqlx::query_as::<_, CodeRecord>(&query)
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?
            .map(CodeRecord::to_domain)
            .transpose()
    }

    async fn set_code_status(&self, coupon_id: i64, status: CouponStatus) -> PortResult<CouponCode> {
        let query = format!(
            "UPDATE coupon_codes SET status = $2, updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL RETURNING {}",
            CODE_COLUMNS
        );
        sqlx::query_as::<_, CodeRecord>(&query)
            .bind(coupon_id)
            .bind(status.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?
            .ok_or_else(|| PortError::NotFound(format!("Coupon {} not found", coupon_id)))?
            .to_domain()
    }

    async fn list_codes(&self, filter: CodeFilter, page: Page) -> PortResult<Paged<CouponCode>> {
        let status = filter.status.map(|s| s.as_str());
        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM coupon_codes {}", CODE_FILTER))
            .bind(filter.book_id)
            .bind(status)
            .fetch_one(&self.pool)
            .await
            .map_err(unexpected)?;
        let query = format!(
            "SELECT {} FROM coupon_codes {} ORDER BY created_at DESC, id DESC LIMIT $3 OFFSET $4",
            CODE_COLUMNS, CODE_FILTER
        );
        let items = sqlx::query_as::<_, CodeRecord>(&query)
            .bind(filter.book_id)
            .bind(status)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await
            .map_err(unexpected)?
            .into_iter()
            .map(CodeRecord::to_domain)
            .collect::<PortResult<Vec<_>>>()?;
        Ok(Paged { items, total })
    }

    async fn count_codes(&self, book_id: i64) -> PortResult<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM coupon_codes WHERE book_id = $1 AND deleted_at IS NULL",
        )
        .bind(book_id)
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)
    }

    async fn count_available_codes(&self, book_id: i64) -> PortResult<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM coupon_codes \
             WHERE book_id = $1 AND status = 'AVAILABLE' AND deleted_at IS NULL",
        )
        .bind(book_id)
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)
    }

    async fn existing_codes(&self, book_id: i64, candidates: &[String]) -> PortResult<HashSet<String>> {
        let found = sqlx::query_scalar::<_, String>(
            "SELECT code FROM coupon_codes WHERE book_id = $1 AND code = ANY($2)",
        )
        .bind(book_id)
        .bind(candidates)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(found.into_iter().collect())
    }

    async fn insert_codes(&self, book_id: i64, codes: &[String], job_id: Uuid) -> PortResult<u64> {
        // A single statement, so the batch lands completely or not at all.
        let result = sqlx::query(
            "INSERT INTO coupon_codes (book_id, code, status, generation_job_id) \
             SELECT $1, UNNEST($2::text[]), 'AVAILABLE', $3",
        )
        .bind(book_id)
        .bind(codes)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(write_error)?;
        Ok(result.rows_affected())
    }

    async fn insert_code(&self, book_id: i64, code: &str, job_id: Uuid) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO coupon_codes (book_id, code, status, generation_job_id) \
             VALUES ($1, $2, 'AVAILABLE', $3)",
        )
        .bind(book_id)
        .bind(code)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(write_error)?;
        Ok(())
    }

    async fn count_job_codes(&self, job_id: Uuid) -> PortResult<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM coupon_codes WHERE generation_job_id = $1",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)
    }

    // --- Assignments ---

    async fn get_assignment(&self, assignment_id: i64) -> PortResult<Option<CouponAssignment>> {
        let query = format!(
            "SELECT {} FROM coupon_assignments WHERE id = $1 AND deleted_at IS NULL",
            ASSIGNMENT_COLUMNS
        );
        let record = sqlx::query_as::<_, AssignmentRecord>(&query)
            .bind(assignment_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(record.map(AssignmentRecord::to_domain))
    }

    async fn active_assignment(&self, coupon_id: i64) -> PortResult<Option<CouponAssignment>> {
        let query = format!(
            "SELECT {} FROM coupon_assignments WHERE coupon_id = $1 AND deleted_at IS NULL \
             ORDER BY assigned_at DESC LIMIT 1",
            ASSIGNMENT_COLUMNS
        );
        let record = sqlx::query_as::<_, AssignmentRecord>(&query)
            .bind(coupon_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(record.map(AssignmentRecord::to_domain))
    }

    async fn active_assignment_for_user(
        &self,
        coupon_id: i64,
        user_id: i64,
    ) -> PortResult<Option<CouponAssignment>> {
        let query = format!(
            "SELECT {} FROM coupon_assignments \
             WHERE coupon_id = $1 AND user_id = $2 AND deleted_at IS NULL",
            ASSIGNMENT_COLUMNS
        );
        let record = sqlx::query_as::<_, AssignmentRecord>(&query)
            .bind(coupon_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(record.map(AssignmentRecord::to_domain))
    }

    async fn count_user_assignments_in_book(&self, user_id: i64, book_id: i64) -> PortResult<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM coupon_assignments a \
             JOIN coupon_codes c ON c.id = a.coupon_id \
             WHERE a.user_id = $1 AND c.book_id = $2 AND a.deleted_at IS NULL",
        )
        .bind(user_id)
        .bind(book_id)
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)
    }

    async fn user_assignments(
        &self,
        user_id: i64,
        filter: CodeFilter,
    ) -> PortResult<Vec<AssignmentDetail>> {
        sqlx::query_as::<_, UserAssignmentRecord>(
            "SELECT a.id, a.coupon_id, a.user_id, a.assigned_at, c.book_id, c.code, c.status, \
               c.assigned_at AS code_assigned_at, c.used_at, c.created_at, b.name AS book_name \
             FROM coupon_assignments a \
             JOIN coupon_codes c ON c.id = a.coupon_id \
             JOIN coupon_books b ON b.id = c.book_id \
             WHERE a.user_id = $1 AND a.deleted_at IS NULL \
               AND ($2::bigint IS NULL OR c.book_id = $2) \
               AND ($3::text IS NULL OR c.status = $3) \
             ORDER BY a.assigned_at DESC, a.id DESC",
        )
        .bind(user_id)
        .bind(filter.book_id)
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?
        .into_iter()
        .map(UserAssignmentRecord::to_domain)
        .collect()
    }

    async fn assign_random(
        &self,
        book_id: i64,
        user_id: i64,
        quantity: i64,
        per_user_cap: Option<i64>,
        now: DateTime<Utc>,
    ) -> PortResult<Vec<CouponAssignment>> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;
        ensure_cap_in_tx(&mut *tx, book_id, user_id, quantity, per_user_cap).await?;

        let picked: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM coupon_codes \
             WHERE book_id = $1 AND status = 'AVAILABLE' AND deleted_at IS NULL \
             ORDER BY random() LIMIT $2 FOR UPDATE SKIP LOCKED",
        )
        .bind(book_id)
        .bind(quantity)
        .fetch_all(&mut *tx)
        .await
        .map_err(unexpected)?;

        if (picked.len() as i64) < quantity {
            return Err(PortError::Validation(format!(
                "Not enough available coupons after lock. Found {}, needed {}",
                picked.len(),
                quantity
            )));
        }

        sqlx::query(
            "UPDATE coupon_codes SET status = 'ASSIGNED', assigned_at = $2, updated_at = NOW() \
             WHERE id = ANY($1)",
        )
        .bind(&picked)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(unexpected)?;

        let query = format!(
            "INSERT INTO coupon_assignments (coupon_id, user_id, assigned_at) \
             SELECT UNNEST($1::bigint[]), $2, $3 RETURNING {}",
            ASSIGNMENT_COLUMNS
        );
        let records = sqlx::query_as::<_, AssignmentRecord>(&query)
            .bind(&picked)
            .bind(user_id)
            .bind(now)
            .fetch_all(&mut *tx)
            .await
            .map_err(write_error)?;

        tx.commit().await.map_err(unexpected)?;
        Ok(records.into_iter().map(AssignmentRecord::to_domain).collect())
    }

    async fn assign_code(
        &self,
        coupon_id: i64,
        user_id: i64,
        per_user_cap: Option<i64>,
        now: DateTime<Utc>,
    ) -> PortResult<CouponAssignment> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;

        let row: Option<(String, i64)> = sqlx::query_as(
            "SELECT status, book_id FROM coupon_codes \
             WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
        )
        .bind(coupon_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(unexpected)?;
        let (status, book_id) =
            row.ok_or_else(|| PortError::NotFound(format!("Coupon {} not found", coupon_id)))?;
        if coupon_status(&status)? != CouponStatus::Available {
            return Err(PortError::Conflict("Coupon is no longer available".to_string()));
        }
        ensure_cap_in_tx(&mut *tx, book_id, user_id, 1, per_user_cap).await?;

        sqlx::query(
            "UPDATE coupon_codes SET status = 'ASSIGNED', assigned_at = $2, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(coupon_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(unexpected)?;

        let query = format!(
            "INSERT INTO coupon_assignments (coupon_id, user_id, assigned_at) \
             VALUES ($1, $2, $3) RETURNING {}",
            ASSIGNMENT_COLUMNS
        );
        let record = sqlx::query_as::<_, AssignmentRecord>(&query)
            .bind(coupon_id)
            .bind(user_id)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(write_error)?;

        tx.commit().await.map_err(unexpected)?;
        Ok(record.to_domain())
    }

    async fn unassign(&self, assignment_id: i64, now: DateTime<Utc>) -> PortResult<()> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;

        let coupon_id: Option<i64> = sqlx::query_scalar(
            "UPDATE coupon_assignments SET deleted_at = $2, updated_at = NOW() \
             WHERE id = $1 AND deleted_at IS NULL RETURNING coupon_id",
        )
        .bind(assignment_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(unexpected)?;
        let coupon_id =
            coupon_id.ok_or_else(|| PortError::NotFound("Assignment not found".to_string()))?;

        sqlx::query(
            "UPDATE coupon_codes SET status = 'AVAILABLE', assigned_at = NULL, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(coupon_id)
        .execute(&mut *tx)
        .await
        .map_err(unexpected)?;

        tx.commit().await.map_err(unexpected)
    }

    // --- Redemptions ---

    async fn count_user_redemptions(&self, coupon_id: i64, user_id: i64) -> PortResult<i64> {
        // Soft-deleted assignments still count: a redemption is never undone.
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM coupon_redemptions r \
             JOIN coupon_assignments a ON a.id = r.assignment_id \
             WHERE r.coupon_id = $1 AND a.user_id = $2 AND r.deleted_at IS NULL",
        )
        .bind(coupon_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)
    }

    async fn commit_redemption(&self, commit: RedemptionCommit) -> PortResult<CouponRedemption> {
        // Dropping `tx` on any early return rolls everything back.
        let mut tx = self.pool.begin().await.map_err(unexpected)?;

        let status: Option<String> = sqlx::query_scalar(
            "SELECT status FROM coupon_codes WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
        )
        .bind(commit.coupon_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(unexpected)?;
        let status = coupon_status(
            &status.ok_or_else(|| PortError::NotFound("Coupon not found".to_string()))?,
        )?;
        if !commit.allowed_statuses.contains(&status) {
            return Err(PortError::Validation(format!(
                "Coupon is not available for redemption. Current status: {}",
                status
            )));
        }

        let redemption = sqlx::query_as::<_, RedemptionRecord>(
            "INSERT INTO coupon_redemptions (coupon_id, assignment_id, redeemed_at) \
             VALUES ($1, $2, $3) RETURNING id, coupon_id, assignment_id, redeemed_at",
        )
        .bind(commit.coupon_id)
        .bind(commit.assignment_id)
        .bind(commit.redeemed_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(unexpected)?;

        sqlx::query(
            "UPDATE coupon_codes SET status = 'REDEEMED', used_at = $2, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(commit.coupon_id)
        .bind(commit.redeemed_at)
        .execute(&mut *tx)
        .await
        .map_err(unexpected)?;

        tx.commit().await.map_err(unexpected)?;
        Ok(redemption.to_domain())
    }

    async fn list_redemptions(
        &self,
        filter: RedemptionFilter,
        page: Page,
    ) -> PortResult<Paged<RedemptionDetail>> {
        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) {}", REDEMPTION_FROM))
            .bind(filter.user_id)
            .bind(filter.book_id)
            .fetch_one(&self.pool)
            .await
            .map_err(unexpected)?;
        let query = format!(
            "SELECT r.id, r.coupon_id, r.assignment_id, r.redeemed_at, c.code, c.book_id, \
               b.name AS book_name, u.id AS user_id, u.email AS user_email, u.name AS user_name, \
               u.is_active AS user_is_active, u.last_login_at AS user_last_login_at \
             {} ORDER BY r.redeemed_at DESC, r.id DESC LIMIT $3 OFFSET $4",
            REDEMPTION_FROM
        );
        let items = sqlx::query_as::<_, RedemptionDetailRecord>(&query)
            .bind(filter.user_id)
            .bind(filter.book_id)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await
            .map_err(unexpected)?
            .into_iter()
            .map(RedemptionDetailRecord::to_domain)
            .collect();
        Ok(Paged { items, total })
    }
}
