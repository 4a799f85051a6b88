//! crates/coupon_book_core/src/redemption.rs
//!
//! The redemption protocol: a short-lived exclusive lock held in the cache,
//! followed by an irreversible transactional commit in the durable store.
//!
//! The cache lock is acquired with an atomic set-if-absent, carries a
//! caller-bound token, and is only ever removed with a compare-and-delete so a
//! caller can never drop somebody else's lock by accident.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::{
    CouponStatus, LockEntry, Page, Paged, RedemptionCommit, RedemptionDetail, RedemptionFilter,
    RedemptionSummary, Release,
};
use crate::eligibility::check_redemption_limit;
use crate::pattern::normalize_code;
use crate::ports::{Clock, CouponStore, LockCache, PortError, PortResult};

/// How long a redemption lock stays valid.
pub const LOCK_TTL: Duration = Duration::from_secs(180);

/// Cache key holding the lock of one code.
pub fn lock_key(code: &str) -> String {
    format!("coupon_lock:{}", code)
}

//=========================================================================================
// The Service
//=========================================================================================

/// Coordinates one coupon between `Assigned` and `Redeemed`.
#[derive(Clone)]
pub struct RedemptionService {
    store: Arc<dyn CouponStore>,
    cache: Arc<dyn LockCache>,
    clock: Arc<dyn Clock>,
    lock_ttl: Duration,
}

impl RedemptionService {
    pub fn new(
        store: Arc<dyn CouponStore>,
        cache: Arc<dyn LockCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            lock_ttl: LOCK_TTL,
        }
    }

    pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
        self.lock_ttl = lock_ttl;
        self
    }

    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    /// Reserves a coupon for its assigned user.
    ///
    /// A `Redeemed` coupon is lockable only when its book allows multiple
    /// redemptions per user.
    ///
    /// Preconditions are checked in order and any failure aborts without
    /// touching the cache: no live lock, the coupon exists, it is assigned
    /// (or redeemed under a multi-redemption book), it has an active
    /// assignment, user and book resolve, and the redemption policy allows
    /// one more use.
    pub async fn lock(&self, code: &str) -> PortResult<LockEntry> {
        let code = required_code(code)?;
        let key = lock_key(&code);
        let now = self.clock.now();

        if let Some((raw, holder)) = self.current_lock(&key).await? {
            if !holder.is_expired(now) {
                return Err(held_by(&holder, now));
            }
            self.discard(&key, &raw).await;
        }

        let coupon = self
            .store
            .find_code(&code)
            .await?
            .ok_or_else(|| PortError::NotFound("Coupon not found".to_string()))?;

        let book = self.store.get_book(coupon.book_id).await?;
        let multi = book
            .as_ref()
            .map_or(false, |b| b.allow_multiple_redemptions_per_user);
        match coupon.status {
            CouponStatus::Assigned => {}
            CouponStatus::Redeemed if multi => {}
            other => {
                return Err(PortError::Validation(format!(
                    "Coupon is not assigned. Current status: {}",
                    other
                )))
            }
        }

        let assignment = self
            .store
            .active_assignment(coupon.id)
            .await?
            .ok_or_else(|| {
                PortError::Validation("This coupon is not assigned to any user".to_string())
            })?;

        let user = self
            .store
            .get_user(assignment.user_id)
            .await?
            .ok_or_else(|| PortError::NotFound("Assigned user not found".to_string()))?;
        let book = book.ok_or_else(|| PortError::NotFound("Book not found".to_string()))?;

        check_redemption_limit(self.store.as_ref(), &book, coupon.id, user.id).await?;

        let entry = LockEntry {
            token: Uuid::new_v4(),
            coupon_id: coupon.id,
            code: coupon.code.clone(),
            book_id: book.id,
            book_name: book.name.clone(),
            user_id: user.id,
            user_name: user.name.clone(),
            user_email: user.email.clone(),
            locked_at: now,
            expires_at: now + chrono::Duration::seconds(self.lock_ttl.as_secs() as i64),
        };
        let raw = serde_json::to_string(&entry)
            .map_err(|e| PortError::Unexpected(format!("Failed to encode lock entry: {}", e)))?;

        if !self.cache.set_if_absent(&key, &raw, self.lock_ttl).await? {
            // Somebody else won the race between our absence check and the write.
            return Err(match self.current_lock(&key).await? {
                Some((_, holder)) => held_by(&holder, now),
                None => PortError::Conflict("The coupon is already locked".to_string()),
            });
        }

        info!(code = %entry.code, user_id = entry.user_id, expires_at = %entry.expires_at, "Coupon locked");
        Ok(entry)
    }

    /// Releases a lock. Only the token holder may release unless `Release::Force` is used.
    pub async fn release(&self, code: &str, release: Release) -> PortResult<()> {
        let code = required_code(code)?;
        let key = lock_key(&code);
        let now = self.clock.now();

        let (raw, entry) = match self.current_lock(&key).await? {
            Some((raw, entry)) if !entry.is_expired(now) => (raw, entry),
            Some((raw, _)) => {
                self.discard(&key, &raw).await;
                return Err(no_active_lock());
            }
            None => return Err(no_active_lock()),
        };

        match release {
            Release::Force => {
                self.cache.delete(&key).await?;
                warn!(code = %code, holder = entry.user_id, "Coupon lock force-released");
            }
            Release::Token(token) => {
                if token != entry.token {
                    return Err(PortError::Conflict(
                        "The coupon lock is held by another session".to_string(),
                    ));
                }
                if !self.cache.compare_and_delete(&key, &raw).await? {
                    return Err(PortError::Conflict(
                        "The coupon lock changed while it was being released".to_string(),
                    ));
                }
                info!(code = %code, "Coupon lock released");
            }
        }
        Ok(())
    }

    /// Redeems a locked coupon for the user recorded in the lock.
    ///
    /// Whatever the outcome, a valid lock is consumed: the caller has to lock
    /// again before retrying.
    pub async fn redeem(&self, code: &str, token: Option<Uuid>) -> PortResult<RedemptionSummary> {
        let code = required_code(code)?;
        let key = lock_key(&code);
        let now = self.clock.now();

        let (raw, entry) = self.current_lock(&key).await?.ok_or_else(|| {
            PortError::Validation("Coupon is not locked. Please lock it first.".to_string())
        })?;

        if entry.is_expired(now) {
            self.discard(&key, &raw).await;
            return Err(PortError::Validation(
                "Coupon lock has expired. Please lock the coupon again.".to_string(),
            ));
        }
        if let Some(token) = token {
            if token != entry.token {
                return Err(PortError::Conflict(
                    "The coupon is locked by another session".to_string(),
                ));
            }
        }

        let result = self.redeem_locked(&code, &entry, now).await;
        self.discard(&key, &raw).await;
        result
    }

    async fn redeem_locked(
        &self,
        code: &str,
        entry: &LockEntry,
        now: DateTime<Utc>,
    ) -> PortResult<RedemptionSummary> {
        let coupon = self
            .store
            .find_code(code)
            .await?
            .ok_or_else(|| PortError::NotFound("Coupon not found".to_string()))?;
        let assignment = self
            .store
            .active_assignment_for_user(coupon.id, entry.user_id)
            .await?
            .ok_or_else(|| {
                PortError::Validation("Coupon is not assigned to this user".to_string())
            })?;
        let book = self
            .store
            .get_book(coupon.book_id)
            .await?
            .ok_or_else(|| PortError::NotFound("Book not found".to_string()))?;
        let user = self
            .store
            .get_user(entry.user_id)
            .await?
            .ok_or_else(|| PortError::NotFound("Assigned user not found".to_string()))?;

        let mut allowed = vec![CouponStatus::Assigned, CouponStatus::TempLocked];
        if book.allow_multiple_redemptions_per_user && coupon.status == CouponStatus::Redeemed {
            allowed.push(CouponStatus::Redeemed);
        }
        if !allowed.contains(&coupon.status) {
            return Err(PortError::Validation(format!(
                "Coupon is not available for redemption. Current status: {}",
                coupon.status
            )));
        }

        // Re-counted here rather than trusting the count taken at lock time.
        check_redemption_limit(self.store.as_ref(), &book, coupon.id, user.id).await?;

        let redemption = self
            .store
            .commit_redemption(RedemptionCommit {
                coupon_id: coupon.id,
                assignment_id: assignment.id,
                allowed_statuses: allowed,
                redeemed_at: now,
            })
            .await
            .map_err(|e| {
                error!(code = %code, "Redemption commit failed: {}", e);
                e
            })?;

        info!(code = %code, user_id = user.id, redemption_id = redemption.id, "Coupon redeemed");
        Ok(RedemptionSummary {
            redemption_id: redemption.id,
            coupon_code: coupon.code,
            book_name: book.name,
            user_id: user.id,
            user_name: user.name,
            user_email: user.email,
            status: CouponStatus::Redeemed,
            redeemed_at: redemption.redeemed_at,
        })
    }

    /// Past redemptions, newest first.
    pub async fn history(
        &self,
        filter: RedemptionFilter,
        page: Page,
    ) -> PortResult<Paged<RedemptionDetail>> {
        self.store.list_redemptions(filter, page).await
    }

    async fn current_lock(&self, key: &str) -> PortResult<Option<(String, LockEntry)>> {
        let Some(raw) = self.cache.get(key).await? else {
            return Ok(None);
        };
        let entry: LockEntry = serde_json::from_str(&raw)
            .map_err(|e| PortError::Unexpected(format!("Corrupt lock entry for {}: {}", key, e)))?;
        Ok(Some((raw, entry)))
    }

    /// Drops a lock we have observed, leaving any newer lock alone.
    async fn discard(&self, key: &str, raw: &str) {
        if let Err(e) = self.cache.compare_and_delete(key, raw).await {
            error!(key = %key, "Failed to clear coupon lock: {}", e);
        }
    }
}

fn required_code(code: &str) -> PortResult<String> {
    let code = normalize_code(code);
    if code.is_empty() {
        return Err(PortError::Validation("code is required".to_string()));
    }
    Ok(code)
}

fn held_by(holder: &LockEntry, now: DateTime<Utc>) -> PortError {
    PortError::Conflict(format!(
        "The coupon is already locked by another user ({}) and expires in {} minutes",
        holder.user_name,
        holder.minutes_left(now)
    ))
}

fn no_active_lock() -> PortError {
    PortError::NotFound("No active lock found for this coupon".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{sample_book, ManualClock, MemoryLockCache, MemoryStore};

    struct Fixture {
        store: Arc<MemoryStore>,
        cache: Arc<MemoryLockCache>,
        clock: Arc<ManualClock>,
        service: Arc<RedemptionService>,
    }

    async fn fixture(configure: impl FnOnce(&mut crate::domain::CouponBook)) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = Arc::new(MemoryLockCache::new(clock.clone()));
        let service = Arc::new(RedemptionService::new(
            store.clone(),
            cache.clone(),
            clock.clone(),
        ));

        let mut book = sample_book(0);
        configure(&mut book);
        let book = store.seed_book(book).await;
        let user = store.seed_user("ana@example.com", "Ana").await;
        store.seed_assigned_code(book.id, "ABC123", user.id).await;

        Fixture {
            store,
            cache,
            clock,
            service,
        }
    }

    #[tokio::test]
    async fn lock_then_redeem_happy_path() {
        let fx = fixture(|_| {}).await;

        let entry = fx.service.lock("abc123").await.unwrap();
        assert_eq!(entry.code, "ABC123");
        assert_eq!((entry.expires_at - entry.locked_at).num_seconds(), 180);
        assert!(fx.cache.contains(&lock_key("ABC123")).await);

        let summary = fx.service.redeem("ABC123", Some(entry.token)).await.unwrap();
        assert_eq!(summary.coupon_code, "ABC123");
        assert_eq!(summary.user_name, "Ana");
        assert_eq!(summary.status, CouponStatus::Redeemed);

        let coupon = fx.store.find_code("ABC123").await.unwrap().unwrap();
        assert_eq!(coupon.status, CouponStatus::Redeemed);
        assert!(coupon.used_at.is_some());
        assert_eq!(fx.store.redemption_count().await, 1);
        assert!(!fx.cache.contains(&lock_key("ABC123")).await);
    }

    #[tokio::test]
    async fn second_redeem_is_rejected_without_a_lock() {
        let fx = fixture(|_| {}).await;
        fx.service.lock("ABC123").await.unwrap();
        fx.service.redeem("ABC123", None).await.unwrap();

        let err = fx.service.redeem("ABC123", None).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(fx.store.redemption_count().await, 1);

        // Re-locking is refused too: the coupon is no longer assigned.
        let err = fx.service.lock("ABC123").await.unwrap_err();
        assert_eq!(
            err,
            PortError::Validation("Coupon is not assigned. Current status: REDEEMED".to_string())
        );
    }

    #[tokio::test]
    async fn concurrent_locks_admit_exactly_one_holder() {
        let fx = fixture(|_| {}).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let service = fx.service.clone();
            handles.push(tokio::spawn(async move { service.lock("ABC123").await }));
        }

        let mut granted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => granted += 1,
                Err(e) => assert_eq!(e.status_code(), 409),
            }
        }
        assert_eq!(granted, 1);
    }

    #[tokio::test]
    async fn held_lock_reports_holder_and_minutes() {
        let fx = fixture(|_| {}).await;
        fx.service.lock("ABC123").await.unwrap();
        fx.clock.advance(chrono::Duration::seconds(30));

        let err = fx.service.lock("ABC123").await.unwrap_err();
        assert_eq!(
            err,
            PortError::Conflict(
                "The coupon is already locked by another user (Ana) and expires in 3 minutes"
                    .to_string()
            )
        );
    }

    #[tokio::test]
    async fn expired_lock_cannot_redeem_and_can_be_retaken() {
        let fx = fixture(|_| {}).await;
        fx.service.lock("ABC123").await.unwrap();
        fx.clock.advance(chrono::Duration::seconds(180));

        let err = fx.service.redeem("ABC123", None).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(fx.store.redemption_count().await, 0);

        let again = fx.service.lock("ABC123").await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn lock_just_before_expiry_still_redeems() {
        let fx = fixture(|_| {}).await;
        fx.service.lock("ABC123").await.unwrap();
        fx.clock.advance(chrono::Duration::seconds(179));

        assert!(fx.service.redeem("ABC123", None).await.is_ok());
    }

    #[tokio::test]
    async fn failed_commit_leaves_no_partial_state() {
        let fx = fixture(|_| {}).await;
        fx.service.lock("ABC123").await.unwrap();
        fx.store.fail_next_commit();

        let err = fx.service.redeem("ABC123", None).await.unwrap_err();
        assert_eq!(err.status_code(), 500);

        let coupon = fx.store.find_code("ABC123").await.unwrap().unwrap();
        assert_eq!(coupon.status, CouponStatus::Assigned);
        assert!(coupon.used_at.is_none());
        assert_eq!(fx.store.redemption_count().await, 0);
        assert!(!fx.cache.contains(&lock_key("ABC123")).await);
    }

    #[tokio::test]
    async fn redemption_cap_is_enforced_for_every_limit() {
        for cap in 0..=3i64 {
            let fx = fixture(|book| {
                book.allow_multiple_redemptions_per_user = true;
                book.per_user_max_redemptions = Some(cap);
            })
            .await;

            for _ in 0..cap {
                fx.service.lock("ABC123").await.unwrap();
                fx.service.redeem("ABC123", None).await.unwrap();
            }

            let err = fx.service.lock("ABC123").await.unwrap_err();
            assert_eq!(err.status_code(), 403, "cap {}", cap);
            assert_eq!(fx.store.redemption_count().await, cap as usize);
        }
    }

    #[tokio::test]
    async fn cap_reached_while_locked_rejects_the_redeem() {
        for cap in 1..=3i64 {
            let fx = fixture(|book| {
                book.allow_multiple_redemptions_per_user = true;
                book.per_user_max_redemptions = Some(cap);
            })
            .await;
            fx.service.lock("ABC123").await.unwrap();

            // Redemptions land through another path while the lock is held.
            let coupon = fx.store.find_code("ABC123").await.unwrap().unwrap();
            let assignment = fx.store.active_assignment(coupon.id).await.unwrap().unwrap();
            for _ in 0..cap {
                fx.store.seed_redemption(coupon.id, assignment.id).await;
            }

            let err = fx.service.redeem("ABC123", None).await.unwrap_err();
            assert_eq!(err.status_code(), 403, "cap {}", cap);
            assert_eq!(fx.store.redemption_count().await, cap as usize);
            assert!(!fx.cache.contains(&lock_key("ABC123")).await);
        }
    }

    #[tokio::test]
    async fn temp_locked_coupon_redeems() {
        let fx = fixture(|_| {}).await;
        fx.service.lock("ABC123").await.unwrap();
        let coupon = fx.store.find_code("ABC123").await.unwrap().unwrap();
        fx.store
            .force_code_status(coupon.id, CouponStatus::TempLocked)
            .await;

        let summary = fx.service.redeem("ABC123", None).await.unwrap();
        assert_eq!(summary.status, CouponStatus::Redeemed);
        let coupon = fx.store.find_code("ABC123").await.unwrap().unwrap();
        assert_eq!(coupon.status, CouponStatus::Redeemed);
        assert_eq!(fx.store.redemption_count().await, 1);
    }

    #[tokio::test]
    async fn history_lists_newest_first() {
        let fx = fixture(|book| book.allow_multiple_redemptions_per_user = true).await;
        for _ in 0..2 {
            fx.service.lock("ABC123").await.unwrap();
            fx.service.redeem("ABC123", None).await.unwrap();
            fx.clock.advance(chrono::Duration::seconds(5));
        }

        let page = fx
            .service
            .history(RedemptionFilter::default(), Page { limit: 1, offset: 0 })
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);
        let newest = &page.items[0];
        assert_eq!(newest.coupon_code, "ABC123");
        assert_eq!(newest.user.as_ref().map(|u| u.name.as_str()), Some("Ana"));

        let older = fx
            .service
            .history(RedemptionFilter::default(), Page { limit: 1, offset: 1 })
            .await
            .unwrap();
        assert!(older.items[0].redemption.redeemed_at < newest.redemption.redeemed_at);
    }

    #[tokio::test]
    async fn release_requires_the_holder_token() {
        let fx = fixture(|_| {}).await;
        let entry = fx.service.lock("ABC123").await.unwrap();

        let err = fx
            .service
            .release("ABC123", Release::Token(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
        assert!(fx.cache.contains(&lock_key("ABC123")).await);

        fx.service
            .release("ABC123", Release::Token(entry.token))
            .await
            .unwrap();
        assert!(!fx.cache.contains(&lock_key("ABC123")).await);

        let err = fx.service.release("ABC123", Release::Force).await.unwrap_err();
        assert_eq!(err, no_active_lock());
    }

    #[tokio::test]
    async fn force_release_drops_any_lock() {
        let fx = fixture(|_| {}).await;
        fx.service.lock("ABC123").await.unwrap();
        fx.service.release("ABC123", Release::Force).await.unwrap();
        assert!(fx.service.lock("ABC123").await.is_ok());
    }

    #[tokio::test]
    async fn redeem_with_foreign_token_keeps_the_lock() {
        let fx = fixture(|_| {}).await;
        fx.service.lock("ABC123").await.unwrap();

        let err = fx
            .service
            .redeem("ABC123", Some(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
        assert!(fx.cache.contains(&lock_key("ABC123")).await);
    }

    #[tokio::test]
    async fn redeemed_coupon_locks_only_on_multi_redemption_books() {
        let single = fixture(|_| {}).await;
        let coupon = single.store.find_code("ABC123").await.unwrap().unwrap();
        single
            .store
            .force_code_status(coupon.id, CouponStatus::Redeemed)
            .await;
        assert_eq!(single.service.lock("ABC123").await.unwrap_err().status_code(), 400);

        let multi = fixture(|book| book.allow_multiple_redemptions_per_user = true).await;
        let coupon = multi.store.find_code("ABC123").await.unwrap().unwrap();
        multi
            .store
            .force_code_status(coupon.id, CouponStatus::Redeemed)
            .await;
        let entry = multi.service.lock("ABC123").await.unwrap();
        assert_eq!(entry.coupon_id, coupon.id);
    }

    #[tokio::test]
    async fn lock_preconditions() {
        let fx = fixture(|_| {}).await;
        assert_eq!(
            fx.service.lock("NOPE").await.unwrap_err(),
            PortError::NotFound("Coupon not found".to_string())
        );
        assert_eq!(fx.service.lock("   ").await.unwrap_err().status_code(), 400);

        let book = fx.store.seed_book(sample_book(0)).await;
        fx.store.seed_code(book.id, "FREE-1").await;
        assert_eq!(
            fx.service.lock("FREE-1").await.unwrap_err(),
            PortError::Validation("Coupon is not assigned. Current status: AVAILABLE".to_string())
        );
    }
}
