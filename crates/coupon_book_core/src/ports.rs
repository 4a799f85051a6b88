//! crates/coupon_book_core/src/ports.rs
//!
//! Defines the service contracts (traits) the core logic depends on.
//! These traits form the boundary of the hexagonal architecture, keeping the
//! core independent of the concrete relational store, cache and job queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{
    AssignmentDetail, BookStatus, BookUpdate, CodeFilter, CouponAssignment, CouponBook,
    CouponCode, CouponRedemption, CouponStatus, GenerationJob, GenerationOutcome,
    GenerationRequest, JobCounts, JobFilter, JobOptions, JobState, NewBook, Page, Paged,
    RedemptionCommit, RedemptionDetail, RedemptionFilter, User,
};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// The error type shared by every core operation and every port.
///
/// Each variant maps onto one HTTP status used by the boundary layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    /// A unique constraint rejected a write.
    #[error("Duplicate value: {0}")]
    Duplicate(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

impl PortError {
    pub fn status_code(&self) -> u16 {
        match self {
            PortError::Validation(_) => 400,
            PortError::Forbidden(_) => 403,
            PortError::NotFound(_) => 404,
            PortError::Conflict(_) | PortError::Duplicate(_) => 409,
            PortError::Unexpected(_) => 500,
        }
    }

    /// Stable label rendered as the `error` field of response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            PortError::Validation(_) => "validation",
            PortError::Forbidden(_) => "forbidden",
            PortError::NotFound(_) => "not_found",
            PortError::Conflict(_) | PortError::Duplicate(_) => "conflict",
            PortError::Unexpected(_) => "internal",
        }
    }
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Durable Store
//=========================================================================================

/// The relational store. Reads never return soft-deleted rows.
#[async_trait]
pub trait CouponStore: Send + Sync {
    // --- Books ---
    async fn get_book(&self, book_id: i64) -> PortResult<Option<CouponBook>>;

    async fn create_book(&self, book: NewBook) -> PortResult<CouponBook>;

    async fn update_book(&self, book_id: i64, update: BookUpdate) -> PortResult<CouponBook>;

    async fn set_book_status(&self, book_id: i64, status: BookStatus) -> PortResult<CouponBook>;

    // --- Users ---
    async fn get_user(&self, user_id: i64) -> PortResult<Option<User>>;

    // --- Codes ---
    async fn get_code(&self, coupon_id: i64) -> PortResult<Option<CouponCode>>;

    /// Looks a code up by its normalized string.
    async fn find_code(&self, code: &str) -> PortResult<Option<CouponCode>>;

    async fn set_code_status(&self, coupon_id: i64, status: CouponStatus) -> PortResult<CouponCode>;

    /// Newest codes first.
    async fn list_codes(&self, filter: CodeFilter, page: Page) -> PortResult<Paged<CouponCode>>;

    async fn count_codes(&self, book_id: i64) -> PortResult<i64>;

    async fn count_available_codes(&self, book_id: i64) -> PortResult<i64>;

    /// Returns the subset of `candidates` already stored for this book.
    async fn existing_codes(&self, book_id: i64, candidates: &[String]) -> PortResult<HashSet<String>>;

    /// Inserts all codes as `Available`, or none of them, attributed to the
    /// generation job that produced them.
    /// Fails with `PortError::Duplicate` when any code already exists.
    async fn insert_codes(&self, book_id: i64, codes: &[String], job_id: Uuid) -> PortResult<u64>;

    async fn insert_code(&self, book_id: i64, code: &str, job_id: Uuid) -> PortResult<()>;

    /// Codes inserted so far by one generation job, over all of its attempts.
    async fn count_job_codes(&self, job_id: Uuid) -> PortResult<i64>;

    // --- Assignments ---
    async fn get_assignment(&self, assignment_id: i64) -> PortResult<Option<CouponAssignment>>;

    /// The single non-deleted assignment of a coupon, if any.
    async fn active_assignment(&self, coupon_id: i64) -> PortResult<Option<CouponAssignment>>;

    async fn active_assignment_for_user(
        &self,
        coupon_id: i64,
        user_id: i64,
    ) -> PortResult<Option<CouponAssignment>>;

    async fn count_user_assignments_in_book(&self, user_id: i64, book_id: i64) -> PortResult<i64>;

    /// Live assignments of a user, newest first, narrowed by their codes.
    async fn user_assignments(
        &self,
        user_id: i64,
        filter: CodeFilter,
    ) -> PortResult<Vec<AssignmentDetail>>;

    /// Picks `quantity` random available codes under row locks, flips them to
    /// `Assigned` and records the assignments, all in one transaction.
    ///
    /// With a `per_user_cap`, the user's assignments in the book are counted
    /// again inside the transaction and `PortError::Forbidden` is returned
    /// when the new codes would exceed it.
    async fn assign_random(
        &self,
        book_id: i64,
        user_id: i64,
        quantity: i64,
        per_user_cap: Option<i64>,
        now: DateTime<Utc>,
    ) -> PortResult<Vec<CouponAssignment>>;

    /// Assigns one specific available code in a transaction, with the same
    /// cap re-check as `assign_random`.
    async fn assign_code(
        &self,
        coupon_id: i64,
        user_id: i64,
        per_user_cap: Option<i64>,
        now: DateTime<Utc>,
    ) -> PortResult<CouponAssignment>;

    /// Soft-deletes the assignment and resets its coupon to `Available`.
    async fn unassign(&self, assignment_id: i64, now: DateTime<Utc>) -> PortResult<()>;

    // --- Redemptions ---
    async fn count_user_redemptions(&self, coupon_id: i64, user_id: i64) -> PortResult<i64>;

    /// Inserts the redemption record and flips the coupon to `Redeemed` inside
    /// one transaction, holding a row lock on the coupon.
    async fn commit_redemption(&self, commit: RedemptionCommit) -> PortResult<CouponRedemption>;

    /// Newest redemptions first.
    async fn list_redemptions(
        &self,
        filter: RedemptionFilter,
        page: Page,
    ) -> PortResult<Paged<RedemptionDetail>>;
}

//=========================================================================================
// Ephemeral Lock Cache
//=========================================================================================

#[async_trait]
pub trait LockCache: Send + Sync {
    async fn get(&self, key: &str) -> PortResult<Option<String>>;

    /// Atomic set-if-not-exists with expiry. Returns `false` when the key is taken.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> PortResult<bool>;

    async fn delete(&self, key: &str) -> PortResult<bool>;

    /// Deletes the key only if it still holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> PortResult<bool>;
}

//=========================================================================================
// Durable Job Queue
//=========================================================================================

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(
        &self,
        request: GenerationRequest,
        options: JobOptions,
    ) -> PortResult<GenerationJob>;

    async fn get_job(&self, job_id: Uuid) -> PortResult<Option<GenerationJob>>;

    async fn list_jobs(
        &self,
        filter: JobFilter,
        limit: usize,
        offset: usize,
    ) -> PortResult<Vec<GenerationJob>>;

    async fn job_counts(&self) -> PortResult<JobCounts>;

    /// Moves the next due job to `Active` and hands it to the caller.
    ///
    /// `Active` jobs whose worker has not reported for longer than the
    /// queue's stall timeout are recovered first: they go back to `Waiting`
    /// while attempts remain, otherwise to `Failed`.
    async fn claim_next(&self) -> PortResult<Option<GenerationJob>>;

    /// Records progress and the running count of generated codes. Also
    /// serves as the worker's heartbeat.
    async fn report_progress(&self, job_id: Uuid, progress: u8, generated: u32) -> PortResult<()>;

    async fn complete(&self, job_id: Uuid, outcome: GenerationOutcome) -> PortResult<()>;

    /// Records a failed attempt; returns the state the job ends up in
    /// (`Delayed` while attempts remain, otherwise `Failed`).
    async fn fail(&self, job_id: Uuid, reason: &str) -> PortResult<JobState>;

    /// Re-queues a `Failed` job with a fresh attempt budget.
    async fn retry(&self, job_id: Uuid) -> PortResult<GenerationJob>;

    /// Removes a job that has not started yet.
    async fn remove(&self, job_id: Uuid) -> PortResult<()>;
}

/// Receives fractional progress (0-100) and the generated count from a running job.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, progress: u8, generated: u32) -> PortResult<()>;
}

//=========================================================================================
// Clock
//=========================================================================================

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
