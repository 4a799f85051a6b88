//! crates/coupon_book_core/src/domain.rs
//!
//! Defines the pure, core data structures for the coupon-book system.
//! These structs are independent of any database, cache or queue format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

//=========================================================================================
// Status Enums
//=========================================================================================

/// Lifecycle status of a coupon book. `Archived` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookStatus {
    Active,
    Paused,
    Archived,
}

impl BookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookStatus::Active => "ACTIVE",
            BookStatus::Paused => "PAUSED",
            BookStatus::Archived => "ARCHIVED",
        }
    }
}

impl FromStr for BookStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(BookStatus::Active),
            "PAUSED" => Ok(BookStatus::Paused),
            "ARCHIVED" => Ok(BookStatus::Archived),
            other => Err(format!("unknown book status '{}'", other)),
        }
    }
}

impl fmt::Display for BookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single coupon code.
///
/// `TempLocked` is accepted as a redeemable status but is never written by the
/// lock operation, which only touches the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CouponStatus {
    Available,
    Assigned,
    TempLocked,
    Redeemed,
    Disabled,
    Expired,
}

impl CouponStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CouponStatus::Available => "AVAILABLE",
            CouponStatus::Assigned => "ASSIGNED",
            CouponStatus::TempLocked => "TEMP_LOCKED",
            CouponStatus::Redeemed => "REDEEMED",
            CouponStatus::Disabled => "DISABLED",
            CouponStatus::Expired => "EXPIRED",
        }
    }
}

impl FromStr for CouponStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AVAILABLE" => Ok(CouponStatus::Available),
            "ASSIGNED" => Ok(CouponStatus::Assigned),
            "TEMP_LOCKED" => Ok(CouponStatus::TempLocked),
            "REDEEMED" => Ok(CouponStatus::Redeemed),
            "DISABLED" => Ok(CouponStatus::Disabled),
            "EXPIRED" => Ok(CouponStatus::Expired),
            other => Err(format!("unknown coupon status '{}'", other)),
        }
    }
}

impl fmt::Display for CouponStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//=========================================================================================
// Durable Entities
//=========================================================================================

/// A coupon campaign definition with its policy limits and validity window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouponBook {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub code_pattern: Option<String>,
    /// `None` means the book accepts an unbounded number of codes.
    pub total_codes: Option<i64>,
    pub allow_multiple_redemptions_per_user: bool,
    pub per_user_max_assigned_codes: Option<i64>,
    pub per_user_max_redemptions: Option<i64>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub status: BookStatus,
    pub created_at: DateTime<Utc>,
}

/// Fields accepted when an admin creates a book. New books always start `Active`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewBook {
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
}

/// A partial update of a book. The outer `None` leaves a field untouched;
/// `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default)]
pub struct BookUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub code_pattern: Option<Option<String>>,
    pub total_codes: Option<Option<i64>>,
    pub allow_multiple_redemptions_per_user: Option<bool>,
    pub per_user_max_assigned_codes: Option<Option<i64>>,
    pub per_user_max_redemptions: Option<Option<i64>>,
    pub start_at: Option<Option<DateTime<Utc>>>,
    pub end_at: Option<Option<DateTime<Utc>>>,
}

impl BookUpdate {
    /// Applies the update onto an existing book in place.
    pub fn apply_to(&self, book: &mut CouponBook) {
        if let Some(name) = &self.name {
            book.name = name.clone();
        }
        if let Some(description) = &self.description {
            book.description = description.clone();
        }
        if let Some(pattern) = &self.code_pattern {
            book.code_pattern = pattern.clone();
        }
        if let Some(total) = self.total_codes {
            book.total_codes = total;
        }
        if let Some(flag) = self.allow_multiple_redemptions_per_user {
            book.allow_multiple_redemptions_per_user = flag;
        }
        if let Some(cap) = self.per_user_max_assigned_codes {
            book.per_user_max_assigned_codes = cap;
        }
        if let Some(cap) = self.per_user_max_redemptions {
            book.per_user_max_redemptions = cap;
        }
        if let Some(start) = self.start_at {
            book.start_at = start;
        }
        if let Some(end) = self.end_at {
            book.end_at = end;
        }
    }
}

/// A single redeemable code belonging to exactly one book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouponCode {
    pub id: i64,
    pub book_id: i64,
    pub code: String,
    pub status: CouponStatus,
    pub assigned_at: Option<DateTime<Utc>>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Binds a code to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouponAssignment {
    pub id: i64,
    pub coupon_id: i64,
    pub user_id: i64,
    pub assigned_at: DateTime<Utc>,
}

/// Immutable audit record of a successful redemption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouponRedemption {
    pub id: i64,
    pub coupon_id: i64,
    pub assignment_id: Option<i64>,
    pub redeemed_at: DateTime<Utc>,
}

/// A redemption joined with its code, book and (when still known) user.
#[derive(Debug, Clone)]
pub struct RedemptionDetail {
    pub redemption: CouponRedemption,
    pub coupon_code: String,
    pub book_id: i64,
    pub book_name: String,
    pub user: Option<User>,
}

/// A live assignment joined with its code and book name.
#[derive(Debug, Clone)]
pub struct AssignmentDetail {
    pub assignment: CouponAssignment,
    pub code: CouponCode,
    pub book_name: String,
}

// Represents a user account - the credential hash never leaves the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub is_active: bool,
    pub last_login_at: Option<DateTime<Utc>>,
}

/// Everything the store needs to commit one redemption atomically.
#[derive(Debug, Clone)]
pub struct RedemptionCommit {
    pub coupon_id: i64,
    pub assignment_id: i64,
    /// The coupon row must still be in one of these statuses once row-locked.
    pub allowed_statuses: Vec<CouponStatus>,
    pub redeemed_at: DateTime<Utc>,
}

//=========================================================================================
// Listings
//=========================================================================================

/// Narrows a code listing. Unset fields match everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeFilter {
    pub book_id: Option<i64>,
    pub status: Option<CouponStatus>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedemptionFilter {
    pub user_id: Option<i64>,
    pub book_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

/// One page of rows plus the number of rows matching the filter.
#[derive(Debug, Clone)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: i64,
}

//=========================================================================================
// Ephemeral Lock Entry (cache-resident)
//=========================================================================================

/// Snapshot stored in the cache while a coupon is reserved for redemption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockEntry {
    /// Caller-bound token; releasing the lock requires presenting it.
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
}

impl LockEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whole minutes left before expiry, rounded up.
    pub fn minutes_left(&self, now: DateTime<Utc>) -> i64 {
        let secs = (self.expires_at - now).num_seconds().max(0);
        (secs + 59) / 60
    }
}

/// How a caller proves it may release a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Only the holder of this token may release.
    Token(Uuid),
    /// Admin override: release regardless of holder.
    Force,
}

/// Returned to the caller after a successful redemption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedemptionSummary {
    pub redemption_id: i64,
    pub coupon_code: String,
    pub book_name: String,
    pub user_id: i64,
    pub user_name: String,
    pub user_email: String,
    pub status: CouponStatus,
    pub redeemed_at: DateTime<Utc>,
}

//=========================================================================================
// Generation Jobs (queue-resident)
//=========================================================================================

/// Payload of a code-generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub book_id: i64,
    pub quantity: u32,
    pub pattern: String,
    pub batch_size: u32,
}

/// Queue options attached to a job at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Lower values are processed first.
    pub priority: i32,
    pub delay_ms: u64,
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 5,
            delay_ms: 0,
            attempts: 3,
            backoff_ms: 2_000,
        }
    }
}

impl JobOptions {
    /// Exponential backoff before the next attempt, given how many attempts
    /// have already been made (1-based).
    pub fn backoff_after(&self, attempts_made: u32) -> u64 {
        let exponent = attempts_made.saturating_sub(1).min(20);
        self.backoff_ms.saturating_mul(1u64 << exponent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "delayed" => Ok(JobState::Delayed),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state '{}'", other)),
        }
    }
}

/// What a finished generation job reports back through its job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutcome {
    pub generated_count: u32,
    pub requested_count: u32,
    pub book_id: i64,
    pub pattern: String,
}

/// The queue's own record of a generation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: Uuid,
    pub request: GenerationRequest,
    pub options: JobOptions,
    pub state: JobState,
    pub progress: u8,
    /// Codes inserted so far, across every attempt.
    pub generated: u32,
    pub attempts_made: u32,
    pub result: Option<GenerationOutcome>,
    pub failed_reason: Option<String>,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Number of jobs the queue holds in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn of(&self, state: JobState) -> u64 {
        match state {
            JobState::Waiting => self.waiting,
            JobState::Delayed => self.delayed,
            JobState::Active => self.active,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
        }
    }

    pub fn add(&mut self, state: JobState, count: u64) {
        match state {
            JobState::Waiting => self.waiting += count,
            JobState::Delayed => self.delayed += count,
            JobState::Active => self.active += count,
            JobState::Completed => self.completed += count,
            JobState::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.waiting + self.delayed + self.active + self.completed + self.failed
    }
}

/// Which jobs a listing should return. `All` yields a few jobs of each state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFilter {
    All,
    Only(JobState),
}

/// Completed jobs kept by the queue's retention policy.
pub const KEEP_COMPLETED_JOBS: usize = 10;
/// Failed jobs kept by the queue's retention policy.
pub const KEEP_FAILED_JOBS: usize = 5;
/// Jobs of each state returned by an unfiltered listing.
pub const ALL_JOBS_PER_STATE: usize = 5;
/// Seconds an `Active` job may go without a progress report before it is reclaimed.
pub const DEFAULT_STALL_TIMEOUT_SECS: u64 = 60;
/// Reason recorded on a job whose worker stopped reporting and ran out of attempts.
pub const STALLED_REASON: &str = "Job stalled more than allowable limit";
