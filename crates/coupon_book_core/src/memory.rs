//! crates/coupon_book_core/src/memory.rs
//!
//! In-process implementations of every port. They keep the same contracts as
//! the Postgres and Redis adapters (unique codes, all-or-nothing commits,
//! expiring cache keys, queue retention) and back the test suites.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{
    AssignmentDetail, BookStatus, BookUpdate, CodeFilter, CouponAssignment, CouponBook,
    CouponCode, CouponRedemption, CouponStatus, GenerationJob, GenerationOutcome,
    GenerationRequest, JobCounts, JobFilter, JobOptions, JobState, NewBook, Page, Paged,
    RedemptionCommit, RedemptionDetail, RedemptionFilter, User, ALL_JOBS_PER_STATE,
    DEFAULT_STALL_TIMEOUT_SECS, KEEP_COMPLETED_JOBS, KEEP_FAILED_JOBS, STALLED_REASON,
};
use crate::eligibility::ensure_assignment_fits;
use crate::ports::{
    Clock, CouponStore, JobQueue, LockCache, PortError, PortResult, ProgressSink, SystemClock,
};

//=========================================================================================
// Clock
//=========================================================================================

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(start),
        }
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// An `Active` book with no limits, handy as a starting point.
pub fn sample_book(id: i64) -> CouponBook {
    CouponBook {
        id,
        name: format!("Book {}", id),
        description: None,
        code_pattern: None,
        total_codes: None,
        allow_multiple_redemptions_per_user: false,
        per_user_max_assigned_codes: None,
        per_user_max_redemptions: None,
        start_at: None,
        end_at: None,
        status: BookStatus::Active,
        created_at: Utc::now(),
    }
}

//=========================================================================================
// Store
//=========================================================================================

#[derive(Clone, Default)]
struct StoreState {
    next_id: i64,
    books: BTreeMap<i64, CouponBook>,
    users: BTreeMap<i64, User>,
    codes: BTreeMap<i64, CouponCode>,
    /// Assignment plus its soft-delete timestamp.
    assignments: BTreeMap<i64, (CouponAssignment, Option<DateTime<Utc>>)>,
    redemptions: Vec<CouponRedemption>,
    /// Generation job that inserted each code.
    code_jobs: HashMap<i64, Uuid>,
    bulk_sizes: Vec<usize>,
}

impl StoreState {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn code_taken(&self, code: &str) -> bool {
        self.codes.values().any(|c| c.code == code)
    }

    fn push_code(&mut self, book_id: i64, code: &str, status: CouponStatus) -> CouponCode {
        let id = self.id();
        let row = CouponCode {
            id,
            book_id,
            code: code.to_string(),
            status,
            assigned_at: None,
            used_at: None,
            created_at: Utc::now(),
        };
        self.codes.insert(id, row.clone());
        row
    }

    fn push_assignment(&mut self, coupon_id: i64, user_id: i64, now: DateTime<Utc>) -> CouponAssignment {
        let id = self.id();
        let assignment = CouponAssignment {
            id,
            coupon_id,
            user_id,
            assigned_at: now,
        };
        self.assignments.insert(id, (assignment.clone(), None));
        if let Some(code) = self.codes.get_mut(&coupon_id) {
            code.status = CouponStatus::Assigned;
            code.assigned_at = Some(now);
        }
        assignment
    }

    fn live_assignments(&self) -> impl Iterator<Item = &CouponAssignment> {
        self.assignments
            .values()
            .filter(|(_, deleted)| deleted.is_none())
            .map(|(a, _)| a)
    }

    fn assignments_in_book(&self, user_id: i64, book_id: i64) -> i64 {
        self.live_assignments()
            .filter(|a| a.user_id == user_id)
            .filter(|a| self.codes.get(&a.coupon_id).map(|c| c.book_id) == Some(book_id))
            .count() as i64
    }
}

fn page_of<T>(rows: Vec<T>, page: Page) -> Paged<T> {
    let total = rows.len() as i64;
    let items = rows
        .into_iter()
        .skip(page.offset.max(0) as usize)
        .take(page.limit.max(0) as usize)
        .collect();
    Paged { items, total }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    fail_next_commit: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next redemption commit fail between its two writes.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub async fn seed_book(&self, mut book: CouponBook) -> CouponBook {
        let mut state = self.state.lock().await;
        book.id = state.id();
        state.books.insert(book.id, book.clone());
        book
    }

    pub async fn seed_user(&self, email: &str, name: &str) -> User {
        let mut state = self.state.lock().await;
        let user = User {
            id: state.id(),
            email: email.to_string(),
            name: name.to_string(),
            is_active: true,
            last_login_at: None,
        };
        state.users.insert(user.id, user.clone());
        user
    }

    pub async fn seed_code(&self, book_id: i64, code: &str) -> CouponCode {
        self.state
            .lock()
            .await
            .push_code(book_id, code, CouponStatus::Available)
    }

    pub async fn seed_assigned_code(
        &self,
        book_id: i64,
        code: &str,
        user_id: i64,
    ) -> (CouponCode, CouponAssignment) {
        let mut state = self.state.lock().await;
        let row = state.push_code(book_id, code, CouponStatus::Available);
        let assignment = state.push_assignment(row.id, user_id, Utc::now());
        let row = state.codes[&row.id].clone();
        (row, assignment)
    }

    pub async fn seed_redemption(&self, coupon_id: i64, assignment_id: i64) -> CouponRedemption {
        let mut state = self.state.lock().await;
        let redemption = CouponRedemption {
            id: state.id(),
            coupon_id,
            assignment_id: Some(assignment_id),
            redeemed_at: Utc::now(),
        };
        state.redemptions.push(redemption.clone());
        redemption
    }

    pub async fn force_code_status(&self, coupon_id: i64, status: CouponStatus) {
        if let Some(code) = self.state.lock().await.codes.get_mut(&coupon_id) {
            code.status = status;
        }
    }

    pub async fn redemption_count(&self) -> usize {
        self.state.lock().await.redemptions.len()
    }

    pub async fn codes_of_book(&self, book_id: i64) -> Vec<CouponCode> {
        self.state
            .lock()
            .await
            .codes
            .values()
            .filter(|c| c.book_id == book_id)
            .cloned()
            .collect()
    }

    pub async fn total_code_count(&self) -> usize {
        self.state.lock().await.codes.len()
    }

    /// Sizes of every bulk insert attempted so far.
    pub async fn bulk_insert_sizes(&self) -> Vec<usize> {
        self.state.lock().await.bulk_sizes.clone()
    }
}

#[async_trait]
impl CouponStore for MemoryStore {
    async fn get_book(&self, book_id: i64) -> PortResult<Option<CouponBook>> {
        Ok(self.state.lock().await.books.get(&book_id).cloned())
    }

    async fn create_book(&self, book: NewBook) -> PortResult<CouponBook> {
        let mut state = self.state.lock().await;
        let created = CouponBook {
            id: state.id(),
            name: book.name,
            description: book.description,
            code_pattern: book.code_pattern,
            total_codes: book.total_codes,
            allow_multiple_redemptions_per_user: book.allow_multiple_redemptions_per_user,
            per_user_max_assigned_codes: book.per_user_max_assigned_codes,
            per_user_max_redemptions: book.per_user_max_redemptions,
            start_at: book.start_at,
            end_at: book.end_at,
            status: BookStatus::Active,
            created_at: Utc::now(),
        };
        state.books.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update_book(&self, book_id: i64, update: BookUpdate) -> PortResult<CouponBook> {
        let mut state = self.state.lock().await;
        let book = state
            .books
            .get_mut(&book_id)
            .ok_or_else(|| PortError::NotFound(format!("Book {} not found", book_id)))?;
        update.apply_to(book);
        Ok(book.clone())
    }

    async fn set_book_status(&self, book_id: i64, status: BookStatus) -> PortResult<CouponBook> {
        let mut state = self.state.lock().await;
        let book = state
            .books
            .get_mut(&book_id)
            .ok_or_else(|| PortError::NotFound(format!("Book {} not found", book_id)))?;
        book.status = status;
        Ok(book.clone())
    }

    async fn get_user(&self, user_id: i64) -> PortResult<Option<User>> {
        Ok(self.state.lock().await.users.get(&user_id).cloned())
    }

    async fn get_code(&self, coupon_id: i64) -> PortResult<Option<CouponCode>> {
        Ok(self.state.lock().await.codes.get(&coupon_id).cloned())
    }

    async fn find_code(&self, code: &str) -> PortResult<Option<CouponCode>> {
        Ok(self
            .state
            .lock()
            .await
            .codes
            .values()
            .find(|c| c.code == code)
            .cloned())
    }

    async fn set_code_status(&self, coupon_id: i64, status: CouponStatus) -> PortResult<CouponCode> {
        let mut state = self.state.lock().await;
        let code = state
            .codes
            .get_mut(&coupon_id)
            .ok_or_else(|| PortError::NotFound(format!("Coupon {} not found", coupon_id)))?;
        code.status = status;
        Ok(code.clone())
    }

    async fn list_codes(&self, filter: CodeFilter, page: Page) -> PortResult<Paged<CouponCode>> {
        let state = self.state.lock().await;
        let rows: Vec<CouponCode> = state
            .codes
            .values()
            .rev()
            .filter(|c| filter.book_id.map_or(true, |id| c.book_id == id))
            .filter(|c| filter.status.map_or(true, |s| c.status == s))
            .cloned()
            .collect();
        Ok(page_of(rows, page))
    }

    async fn count_codes(&self, book_id: i64) -> PortResult<i64> {
        let state = self.state.lock().await;
        Ok(state.codes.values().filter(|c| c.book_id == book_id).count() as i64)
    }

    async fn count_available_codes(&self, book_id: i64) -> PortResult<i64> {
        let state = self.state.lock().await;
        Ok(state
            .codes
            .values()
            .filter(|c| c.book_id == book_id && c.status == CouponStatus::Available)
            .count() as i64)
    }

    async fn existing_codes(&self, book_id: i64, candidates: &[String]) -> PortResult<HashSet<String>> {
        let state = self.state.lock().await;
        let wanted: HashSet<&str> = candidates.iter().map(String::as_str).collect();
        Ok(state
            .codes
            .values()
            .filter(|c| c.book_id == book_id && wanted.contains(c.code.as_str()))
            .map(|c| c.code.clone())
            .collect())
    }

    async fn insert_codes(&self, book_id: i64, codes: &[String], job_id: Uuid) -> PortResult<u64> {
        let mut state = self.state.lock().await;
        state.bulk_sizes.push(codes.len());
        let mut batch = HashSet::new();
        for code in codes {
            if state.code_taken(code) || !batch.insert(code.as_str()) {
                return Err(PortError::Duplicate(code.clone()));
            }
        }
        for code in codes {
            let row = state.push_code(book_id, code, CouponStatus::Available);
            state.code_jobs.insert(row.id, job_id);
        }
        Ok(codes.len() as u64)
    }

    async fn insert_code(&self, book_id: i64, code: &str, job_id: Uuid) -> PortResult<()> {
        let mut state = self.state.lock().await;
        if state.code_taken(code) {
            return Err(PortError::Duplicate(code.to_string()));
        }
        let row = state.push_code(book_id, code, CouponStatus::Available);
        state.code_jobs.insert(row.id, job_id);
        Ok(())
    }

    async fn count_job_codes(&self, job_id: Uuid) -> PortResult<i64> {
        let state = self.state.lock().await;
        Ok(state.code_jobs.values().filter(|id| **id == job_id).count() as i64)
    }

    async fn get_assignment(&self, assignment_id: i64) -> PortResult<Option<CouponAssignment>> {
        let state = self.state.lock().await;
        Ok(state
            .assignments
            .get(&assignment_id)
            .filter(|(_, deleted)| deleted.is_none())
            .map(|(a, _)| a.clone()))
    }

    async fn active_assignment(&self, coupon_id: i64) -> PortResult<Option<CouponAssignment>> {
        let state = self.state.lock().await;
        let found = state
            .live_assignments()
            .find(|a| a.coupon_id == coupon_id)
            .cloned();
        Ok(found)
    }

    async fn active_assignment_for_user(
        &self,
        coupon_id: i64,
        user_id: i64,
    ) -> PortResult<Option<CouponAssignment>> {
        let state = self.state.lock().await;
        let found = state
            .live_assignments()
            .find(|a| a.coupon_id == coupon_id && a.user_id == user_id)
            .cloned();
        Ok(found)
    }

    async fn count_user_assignments_in_book(&self, user_id: i64, book_id: i64) -> PortResult<i64> {
        let state = self.state.lock().await;
        Ok(state.assignments_in_book(user_id, book_id))
    }

    async fn user_assignments(
        &self,
        user_id: i64,
        filter: CodeFilter,
    ) -> PortResult<Vec<AssignmentDetail>> {
        let state = self.state.lock().await;
        let mut rows: Vec<AssignmentDetail> = state
            .live_assignments()
            .filter(|a| a.user_id == user_id)
            .filter_map(|a| {
                let code = state.codes.get(&a.coupon_id)?;
                Some(AssignmentDetail {
                    assignment: a.clone(),
                    code: code.clone(),
                    book_name: state
                        .books
                        .get(&code.book_id)
                        .map(|b| b.name.clone())
                        .unwrap_or_default(),
                })
            })
            .filter(|d| filter.book_id.map_or(true, |id| d.code.book_id == id))
            .filter(|d| filter.status.map_or(true, |s| d.code.status == s))
            .collect();
        rows.sort_by(|a, b| {
            (b.assignment.assigned_at, b.assignment.id).cmp(&(a.assignment.assigned_at, a.assignment.id))
        });
        Ok(rows)
    }

    async fn assign_random(
        &self,
        book_id: i64,
        user_id: i64,
        quantity: i64,
        per_user_cap: Option<i64>,
        now: DateTime<Utc>,
    ) -> PortResult<Vec<CouponAssignment>> {
        let mut state = self.state.lock().await;
        ensure_assignment_fits(state.assignments_in_book(user_id, book_id), quantity, per_user_cap)?;
        let mut pool: Vec<i64> = state
            .codes
            .values()
            .filter(|c| c.book_id == book_id && c.status == CouponStatus::Available)
            .map(|c| c.id)
            .collect();
        if (pool.len() as i64) < quantity {
            return Err(PortError::Validation(format!(
                "Not enough available coupons after lock. Found {}, needed {}",
                pool.len(),
                quantity
            )));
        }
        pool.shuffle(&mut rand::thread_rng());
        Ok(pool
            .into_iter()
            .take(quantity as usize)
            .map(|coupon_id| state.push_assignment(coupon_id, user_id, now))
            .collect())
    }

    async fn assign_code(
        &self,
        coupon_id: i64,
        user_id: i64,
        per_user_cap: Option<i64>,
        now: DateTime<Utc>,
    ) -> PortResult<CouponAssignment> {
        let mut state = self.state.lock().await;
        let book_id = match state.codes.get(&coupon_id) {
            Some(code) if code.status == CouponStatus::Available => code.book_id,
            Some(_) => {
                return Err(PortError::Conflict(
                    "Coupon is no longer available".to_string(),
                ))
            }
            None => return Err(PortError::NotFound(format!("Coupon {} not found", coupon_id))),
        };
        ensure_assignment_fits(state.assignments_in_book(user_id, book_id), 1, per_user_cap)?;
        Ok(state.push_assignment(coupon_id, user_id, now))
    }

    async fn unassign(&self, assignment_id: i64, now: DateTime<Utc>) -> PortResult<()> {
        let mut state = self.state.lock().await;
        let coupon_id = match state.assignments.get_mut(&assignment_id) {
            Some((assignment, deleted @ None)) => {
                *deleted = Some(now);
                assignment.coupon_id
            }
            _ => return Err(PortError::NotFound("Assignment not found".to_string())),
        };
        if let Some(code) = state.codes.get_mut(&coupon_id) {
            code.status = CouponStatus::Available;
            code.assigned_at = None;
        }
        Ok(())
    }

    async fn count_user_redemptions(&self, coupon_id: i64, user_id: i64) -> PortResult<i64> {
        let state = self.state.lock().await;
        Ok(state
            .redemptions
            .iter()
            .filter(|r| r.coupon_id == coupon_id)
            .filter(|r| {
                r.assignment_id
                    .and_then(|id| state.assignments.get(&id))
                    .map_or(false, |(a, _)| a.user_id == user_id)
            })
            .count() as i64)
    }

    async fn commit_redemption(&self, commit: RedemptionCommit) -> PortResult<CouponRedemption> {
        let mut state = self.state.lock().await;

        // Work on a copy so a failure part-way leaves nothing behind.
        let mut tx = state.clone();
        let status = tx
            .codes
            .get(&commit.coupon_id)
            .map(|c| c.status)
            .ok_or_else(|| PortError::NotFound("Coupon not found".to_string()))?;
        if !commit.allowed_statuses.contains(&status) {
            return Err(PortError::Validation(format!(
                "Coupon is not available for redemption. Current status: {}",
                status
            )));
        }

        let redemption = CouponRedemption {
            id: tx.id(),
            coupon_id: commit.coupon_id,
            assignment_id: Some(commit.assignment_id),
            redeemed_at: commit.redeemed_at,
        };
        tx.redemptions.push(redemption.clone());

        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(PortError::Unexpected(
                "simulated failure while updating coupon status".to_string(),
            ));
        }

        if let Some(code) = tx.codes.get_mut(&commit.coupon_id) {
            code.status = CouponStatus::Redeemed;
            code.used_at = Some(commit.redeemed_at);
        }
        *state = tx;
        Ok(redemption)
    }

    async fn list_redemptions(
        &self,
        filter: RedemptionFilter,
        page: Page,
    ) -> PortResult<Paged<RedemptionDetail>> {
        let state = self.state.lock().await;
        let mut rows: Vec<RedemptionDetail> = state
            .redemptions
            .iter()
            .filter_map(|r| {
                let code = state.codes.get(&r.coupon_id)?;
                let user = r
                    .assignment_id
                    .and_then(|id| state.assignments.get(&id))
                    .and_then(|(a, _)| state.users.get(&a.user_id))
                    .cloned();
                Some(RedemptionDetail {
                    redemption: r.clone(),
                    coupon_code: code.code.clone(),
                    book_id: code.book_id,
                    book_name: state
                        .books
                        .get(&code.book_id)
                        .map(|b| b.name.clone())
                        .unwrap_or_default(),
                    user,
                })
            })
            .filter(|d| filter.book_id.map_or(true, |id| d.book_id == id))
            .filter(|d| {
                filter
                    .user_id
                    .map_or(true, |id| d.user.as_ref().map(|u| u.id) == Some(id))
            })
            .collect();
        rows.sort_by(|a, b| {
            (b.redemption.redeemed_at, b.redemption.id).cmp(&(a.redemption.redeemed_at, a.redemption.id))
        });
        Ok(page_of(rows, page))
    }
}

//=========================================================================================
// Lock Cache
//=========================================================================================

/// An expiring key-value map driven by the given clock.
pub struct MemoryLockCache {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl MemoryLockCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn contains(&self, key: &str) -> bool {
        matches!(self.get(key).await, Ok(Some(_)))
    }

    fn purge(&self, entries: &mut HashMap<String, (String, DateTime<Utc>)>) {
        let now = self.clock.now();
        entries.retain(|_, (_, expires)| *expires > now);
    }
}

#[async_trait]
impl LockCache for MemoryLockCache {
    async fn get(&self, key: &str) -> PortResult<Option<String>> {
        let mut entries = self.entries.lock().await;
        self.purge(&mut entries);
        Ok(entries.get(key).map(|(value, _)| value.clone()))
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> PortResult<bool> {
        let mut entries = self.entries.lock().await;
        self.purge(&mut entries);
        if entries.contains_key(key) {
            return Ok(false);
        }
        let expires = self.clock.now() + ChronoDuration::milliseconds(ttl.as_millis() as i64);
        entries.insert(key.to_string(), (value.to_string(), expires));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> PortResult<bool> {
        Ok(self.entries.lock().await.remove(key).is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> PortResult<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((value, _)) if value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

//=========================================================================================
// Job Queue
//=========================================================================================

pub struct MemoryJobQueue {
    clock: Arc<dyn Clock>,
    stall_timeout: Duration,
    jobs: Mutex<Vec<GenerationJob>>,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            stall_timeout: Duration::from_secs(DEFAULT_STALL_TIMEOUT_SECS),
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// How long an `Active` job may go without a progress report.
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    fn recover_stalled(&self, jobs: &mut Vec<GenerationJob>, now: DateTime<Utc>) {
        let cutoff = now - ChronoDuration::milliseconds(self.stall_timeout.as_millis() as i64);
        let mut failed = false;
        for job in jobs
            .iter_mut()
            .filter(|j| j.state == JobState::Active && j.processed_at.map_or(true, |at| at < cutoff))
        {
            if job.attempts_made < job.options.attempts {
                job.state = JobState::Waiting;
                job.run_at = now;
            } else {
                job.state = JobState::Failed;
                job.failed_reason = Some(STALLED_REASON.to_string());
                job.finished_at = Some(now);
                failed = true;
            }
        }
        if failed {
            Self::prune(jobs, JobState::Failed, KEEP_FAILED_JOBS);
        }
    }

    fn prune(jobs: &mut Vec<GenerationJob>, state: JobState, keep: usize) {
        let mut finished: Vec<(DateTime<Utc>, usize, Uuid)> = jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.state == state)
            .map(|(i, j)| (j.finished_at.unwrap_or(j.created_at), i, j.id))
            .collect();
        finished.sort();
        finished.reverse();
        let dropped: HashSet<Uuid> = finished.into_iter().skip(keep).map(|(_, _, id)| id).collect();
        jobs.retain(|j| !dropped.contains(&j.id));
    }
}

fn job_mut<'a>(jobs: &'a mut [GenerationJob], job_id: Uuid) -> PortResult<&'a mut GenerationJob> {
    jobs.iter_mut()
        .find(|j| j.id == job_id)
        .ok_or_else(|| PortError::NotFound("Job not found".to_string()))
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, request: GenerationRequest, options: JobOptions) -> PortResult<GenerationJob> {
        let now = self.clock.now();
        let job = GenerationJob {
            id: Uuid::new_v4(),
            request,
            options,
            state: if options.delay_ms > 0 {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            progress: 0,
            generated: 0,
            attempts_made: 0,
            result: None,
            failed_reason: None,
            run_at: now + ChronoDuration::milliseconds(options.delay_ms as i64),
            created_at: now,
            processed_at: None,
            finished_at: None,
        };
        self.jobs.lock().await.push(job.clone());
        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> PortResult<Option<GenerationJob>> {
        Ok(self.jobs.lock().await.iter().find(|j| j.id == job_id).cloned())
    }

    async fn list_jobs(&self, filter: JobFilter, limit: usize, offset: usize) -> PortResult<Vec<GenerationJob>> {
        let snapshot: Vec<GenerationJob> = self.jobs.lock().await.iter().rev().cloned().collect();
        let newest_first = |state: JobState| {
            snapshot
                .iter()
                .filter(move |j| j.state == state)
                .cloned()
                .collect::<Vec<_>>()
                .into_iter()
        };
        Ok(match filter {
            JobFilter::All => [
                JobState::Waiting,
                JobState::Delayed,
                JobState::Active,
                JobState::Completed,
                JobState::Failed,
            ]
            .into_iter()
            .flat_map(|state| newest_first(state).take(ALL_JOBS_PER_STATE).collect::<Vec<_>>())
            .collect(),
            JobFilter::Only(state) => newest_first(state).skip(offset).take(limit).collect(),
        })
    }

    async fn job_counts(&self) -> PortResult<JobCounts> {
        let jobs = self.jobs.lock().await;
        let mut counts = JobCounts::default();
        for job in jobs.iter() {
            counts.add(job.state, 1);
        }
        Ok(counts)
    }

    async fn claim_next(&self) -> PortResult<Option<GenerationJob>> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock().await;
        self.recover_stalled(&mut jobs, now);
        let next = jobs
            .iter_mut()
            .enumerate()
            .filter(|(_, j)| matches!(j.state, JobState::Waiting | JobState::Delayed) && j.run_at <= now)
            .min_by_key(|(i, j)| (j.options.priority, *i))
            .map(|(_, j)| j);
        Ok(next.map(|job| {
            job.state = JobState::Active;
            job.attempts_made += 1;
            job.processed_at = Some(now);
            job.clone()
        }))
    }

    async fn report_progress(&self, job_id: Uuid, progress: u8, generated: u32) -> PortResult<()> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock().await;
        let job = job_mut(&mut jobs, job_id)?;
        job.progress = progress.min(100);
        job.generated = generated;
        job.processed_at = Some(now);
        Ok(())
    }

    async fn complete(&self, job_id: Uuid, outcome: GenerationOutcome) -> PortResult<()> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock().await;
        let job = job_mut(&mut jobs, job_id)?;
        job.state = JobState::Completed;
        job.progress = 100;
        job.result = Some(outcome);
        job.finished_at = Some(now);
        Self::prune(&mut jobs, JobState::Completed, KEEP_COMPLETED_JOBS);
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, reason: &str) -> PortResult<JobState> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock().await;
        let job = job_mut(&mut jobs, job_id)?;
        job.failed_reason = Some(reason.to_string());
        let state = if job.attempts_made < job.options.attempts {
            job.state = JobState::Delayed;
            job.run_at = now
                + ChronoDuration::milliseconds(job.options.backoff_after(job.attempts_made) as i64);
            JobState::Delayed
        } else {
            job.state = JobState::Failed;
            job.finished_at = Some(now);
            JobState::Failed
        };
        if state == JobState::Failed {
            Self::prune(&mut jobs, JobState::Failed, KEEP_FAILED_JOBS);
        }
        Ok(state)
    }

    async fn retry(&self, job_id: Uuid) -> PortResult<GenerationJob> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock().await;
        let job = job_mut(&mut jobs, job_id)?;
        if job.state != JobState::Failed {
            return Err(PortError::Conflict("Only failed jobs can be retried".to_string()));
        }
        job.state = JobState::Waiting;
        job.attempts_made = 0;
        job.failed_reason = None;
        job.finished_at = None;
        job.run_at = now;
        Ok(job.clone())
    }

    async fn remove(&self, job_id: Uuid) -> PortResult<()> {
        let mut jobs = self.jobs.lock().await;
        let job = job_mut(&mut jobs, job_id)?;
        if !matches!(job.state, JobState::Waiting | JobState::Delayed) {
            return Err(PortError::Conflict(
                "Only waiting or delayed jobs can be removed".to_string(),
            ));
        }
        jobs.retain(|j| j.id != job_id);
        Ok(())
    }
}

//=========================================================================================
// Progress
//=========================================================================================

/// Remembers every progress report.
#[derive(Default)]
pub struct RecordingProgress {
    reports: Mutex<Vec<(u8, u32)>>,
}

impl RecordingProgress {
    pub async fn reports(&self) -> Vec<u8> {
        self.reports.lock().await.iter().map(|(p, _)| *p).collect()
    }

    pub async fn last_generated(&self) -> Option<u32> {
        self.reports.lock().await.last().map(|(_, g)| *g)
    }
}

#[async_trait]
impl ProgressSink for RecordingProgress {
    async fn report(&self, progress: u8, generated: u32) -> PortResult<()> {
        self.reports.lock().await.push((progress, generated));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> GenerationRequest {
        GenerationRequest {
            book_id: 1,
            quantity: 10,
            pattern: "##".to_string(),
            batch_size: 10,
        }
    }

    #[tokio::test]
    async fn failed_jobs_back_off_exponentially_then_fail() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let queue = MemoryJobQueue::with_clock(clock.clone());
        let job = queue.enqueue(request(), JobOptions::default()).await.unwrap();

        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.attempts_made, 1);
        assert_eq!(queue.fail(job.id, "boom").await.unwrap(), JobState::Delayed);

        // Not due for another two seconds.
        assert!(queue.claim_next().await.unwrap().is_none());
        clock.advance(ChronoDuration::milliseconds(2_000));
        queue.claim_next().await.unwrap().unwrap();
        assert_eq!(queue.fail(job.id, "boom").await.unwrap(), JobState::Delayed);

        clock.advance(ChronoDuration::milliseconds(3_999));
        assert!(queue.claim_next().await.unwrap().is_none());
        clock.advance(ChronoDuration::milliseconds(1));
        queue.claim_next().await.unwrap().unwrap();
        assert_eq!(queue.fail(job.id, "boom").await.unwrap(), JobState::Failed);

        let stored = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.failed_reason.as_deref(), Some("boom"));

        let retried = queue.retry(job.id).await.unwrap();
        assert_eq!(retried.state, JobState::Waiting);
        assert_eq!(retried.attempts_made, 0);
    }

    #[tokio::test]
    async fn priority_orders_claims_and_removal_is_limited() {
        let queue = MemoryJobQueue::new();
        let low = queue.enqueue(request(), JobOptions::default()).await.unwrap();
        let high = queue
            .enqueue(
                request(),
                JobOptions {
                    priority: 1,
                    ..JobOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(queue.claim_next().await.unwrap().unwrap().id, high.id);
        assert_eq!(queue.remove(high.id).await.unwrap_err().status_code(), 409);
        queue.remove(low.id).await.unwrap();
        assert!(queue.get_job(low.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completed_history_is_bounded() {
        let queue = MemoryJobQueue::new();
        for _ in 0..(KEEP_COMPLETED_JOBS + 3) {
            let job = queue.enqueue(request(), JobOptions::default()).await.unwrap();
            queue.claim_next().await.unwrap();
            queue
                .complete(
                    job.id,
                    GenerationOutcome {
                        generated_count: 10,
                        requested_count: 10,
                        book_id: 1,
                        pattern: "1-##".to_string(),
                    },
                )
                .await
                .unwrap();
        }
        let completed = queue
            .list_jobs(JobFilter::Only(JobState::Completed), 100, 0)
            .await
            .unwrap();
        assert_eq!(completed.len(), KEEP_COMPLETED_JOBS);
    }

    #[tokio::test]
    async fn silent_active_job_goes_back_to_waiting() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let queue = MemoryJobQueue::with_clock(clock.clone()).with_stall_timeout(Duration::from_secs(30));
        let job = queue.enqueue(request(), JobOptions::default()).await.unwrap();
        queue.claim_next().await.unwrap().unwrap();

        clock.advance(ChronoDuration::seconds(20));
        queue.report_progress(job.id, 50, 5).await.unwrap();
        clock.advance(ChronoDuration::seconds(20));
        // The heartbeat keeps it active.
        assert!(queue.claim_next().await.unwrap().is_none());

        clock.advance(ChronoDuration::seconds(11));
        let reclaimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(reclaimed.id, job.id);
        assert_eq!(reclaimed.state, JobState::Active);
        assert_eq!(reclaimed.attempts_made, 2);
        assert_eq!(reclaimed.generated, 5);
    }

    #[tokio::test]
    async fn silent_job_without_attempts_left_fails() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let queue = MemoryJobQueue::with_clock(clock.clone()).with_stall_timeout(Duration::from_secs(30));
        let job = queue
            .enqueue(
                request(),
                JobOptions {
                    attempts: 1,
                    ..JobOptions::default()
                },
            )
            .await
            .unwrap();
        queue.claim_next().await.unwrap().unwrap();

        clock.advance(ChronoDuration::seconds(31));
        assert!(queue.claim_next().await.unwrap().is_none());
        let stored = queue.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.failed_reason.as_deref(), Some(STALLED_REASON));
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn counts_jobs_per_state() {
        let queue = MemoryJobQueue::new();
        let done = queue.enqueue(request(), JobOptions::default()).await.unwrap();
        queue.claim_next().await.unwrap();
        queue
            .complete(
                done.id,
                GenerationOutcome {
                    generated_count: 10,
                    requested_count: 10,
                    book_id: 1,
                    pattern: "1-##".to_string(),
                },
            )
            .await
            .unwrap();
        queue.enqueue(request(), JobOptions::default()).await.unwrap();
        queue.enqueue(request(), JobOptions::default()).await.unwrap();
        queue.claim_next().await.unwrap();

        let counts = queue.job_counts().await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.active, 1);
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.total(), 3);
    }

    #[tokio::test]
    async fn listings_filter_and_page() {
        let store = MemoryStore::new();
        let book = store.seed_book(sample_book(0)).await;
        let other = store.seed_book(sample_book(0)).await;
        let user = store.seed_user("u@example.com", "U").await;
        for i in 0..5 {
            store.seed_code(book.id, &format!("A{}", i)).await;
        }
        store.seed_code(other.id, "B0").await;
        let (code, assignment) = store.seed_assigned_code(book.id, "A5", user.id).await;
        store.seed_redemption(code.id, assignment.id).await;

        let page = store
            .list_codes(
                CodeFilter {
                    book_id: Some(book.id),
                    status: None,
                },
                Page { limit: 2, offset: 0 },
            )
            .await
            .unwrap();
        assert_eq!(page.total, 6);
        assert_eq!(page.items[0].code, "A5");

        let assigned = store
            .list_codes(
                CodeFilter {
                    book_id: None,
                    status: Some(CouponStatus::Assigned),
                },
                Page { limit: 10, offset: 0 },
            )
            .await
            .unwrap();
        assert_eq!(assigned.total, 1);

        let mine = store.user_assignments(user.id, CodeFilter::default()).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].book_name, book.name);

        let redeemed = store
            .list_redemptions(
                RedemptionFilter {
                    user_id: Some(user.id),
                    book_id: None,
                },
                Page { limit: 10, offset: 0 },
            )
            .await
            .unwrap();
        assert_eq!(redeemed.total, 1);
        assert_eq!(redeemed.items[0].coupon_code, "A5");
        let none = store
            .list_redemptions(
                RedemptionFilter {
                    user_id: None,
                    book_id: Some(other.id),
                },
                Page { limit: 10, offset: 0 },
            )
            .await
            .unwrap();
        assert_eq!(none.total, 0);
    }

    #[tokio::test]
    async fn live_assignment_lookups_skip_unassigned_rows() {
        let store = MemoryStore::new();
        let book = store.seed_book(sample_book(0)).await;
        let owner = store.seed_user("o@example.com", "O").await;
        let stranger = store.seed_user("s@example.com", "S").await;
        let (code, assignment) = store.seed_assigned_code(book.id, "LIVE-1", owner.id).await;

        let found = store.active_assignment(code.id).await.unwrap().unwrap();
        assert_eq!(found.id, assignment.id);
        assert!(store
            .active_assignment_for_user(code.id, owner.id)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .active_assignment_for_user(code.id, stranger.id)
            .await
            .unwrap()
            .is_none());

        store.unassign(assignment.id, Utc::now()).await.unwrap();
        assert!(store.active_assignment(code.id).await.unwrap().is_none());
        assert!(store
            .active_assignment_for_user(code.id, owner.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn cache_entries_expire_with_the_clock() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = MemoryLockCache::new(clock.clone());
        assert!(cache.set_if_absent("k", "v", Duration::from_secs(10)).await.unwrap());
        assert!(!cache.set_if_absent("k", "w", Duration::from_secs(10)).await.unwrap());
        assert!(!cache.compare_and_delete("k", "w").await.unwrap());

        clock.advance(ChronoDuration::seconds(10));
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.set_if_absent("k", "w", Duration::from_secs(10)).await.unwrap());
        assert!(cache.compare_and_delete("k", "w").await.unwrap());
    }
}
