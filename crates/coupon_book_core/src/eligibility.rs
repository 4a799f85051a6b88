//! crates/coupon_book_core/src/eligibility.rs
//!
//! Limit and window checks shared by the assignment and redemption flows.
//! Every check counts against the store at the moment it is called; nothing
//! is cached between the check and the commit that follows it.

use chrono::{DateTime, Utc};

use crate::domain::{BookStatus, CouponBook};
use crate::ports::{CouponStore, PortError, PortResult};

/// Fails unless the book is `Active` and `now` falls inside its validity window.
pub fn ensure_book_open(book: &CouponBook, now: DateTime<Utc>) -> PortResult<()> {
    if book.status != BookStatus::Active {
        return Err(PortError::Conflict("CouponBook is not ACTIVE".to_string()));
    }
    if let Some(start) = book.start_at {
        if now < start {
            return Err(PortError::Conflict("CouponBook not started yet".to_string()));
        }
    }
    if let Some(end) = book.end_at {
        if now > end {
            return Err(PortError::Conflict("CouponBook already ended".to_string()));
        }
    }
    Ok(())
}

/// Fails when `quantity` more assignments on top of `current` would exceed `cap`.
pub fn ensure_assignment_fits(current: i64, quantity: i64, cap: Option<i64>) -> PortResult<()> {
    match cap {
        Some(cap) if current + quantity > cap => Err(PortError::Forbidden(
            "Per-user assignment limit reached for this CouponBook".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Counts the user's active assignments within the book and checks that
/// `quantity` more still fit under the per-user assignment cap. Returns the
/// current count.
pub async fn check_assignment_limit(
    store: &dyn CouponStore,
    book: &CouponBook,
    user_id: i64,
    quantity: i64,
) -> PortResult<i64> {
    let current = store.count_user_assignments_in_book(user_id, book.id).await?;
    ensure_assignment_fits(current, quantity, book.per_user_max_assigned_codes)?;
    Ok(current)
}

/// Counts the user's prior redemptions of one coupon and compares them to the
/// book's redemption policy. Returns the current count.
pub async fn check_redemption_limit(
    store: &dyn CouponStore,
    book: &CouponBook,
    coupon_id: i64,
    user_id: i64,
) -> PortResult<i64> {
    let current = store.count_user_redemptions(coupon_id, user_id).await?;
    if !book.allow_multiple_redemptions_per_user {
        if current > 0 {
            return Err(PortError::Forbidden(
                "This coupon has already been redeemed".to_string(),
            ));
        }
    } else if let Some(cap) = book.per_user_max_redemptions {
        if current >= cap {
            return Err(PortError::Forbidden(format!(
                "Maximum redemptions limit reached for this coupon. Limit: {}, Current: {}",
                cap, current
            )));
        }
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{sample_book, MemoryStore};
    use chrono::Duration;

    #[test]
    fn open_window_rules() {
        let now = Utc::now();
        let mut book = sample_book(1);
        assert!(ensure_book_open(&book, now).is_ok());

        book.start_at = Some(now + Duration::hours(1));
        assert_eq!(
            ensure_book_open(&book, now),
            Err(PortError::Conflict("CouponBook not started yet".to_string()))
        );

        book.start_at = None;
        book.end_at = Some(now - Duration::seconds(1));
        assert_eq!(
            ensure_book_open(&book, now),
            Err(PortError::Conflict("CouponBook already ended".to_string()))
        );

        book.end_at = None;
        book.status = BookStatus::Paused;
        assert!(matches!(ensure_book_open(&book, now), Err(PortError::Conflict(_))));
    }

    #[tokio::test]
    async fn assignment_cap_is_enforced() {
        let store = MemoryStore::new();
        let mut book = sample_book(0);
        book.per_user_max_assigned_codes = Some(1);
        let book = store.seed_book(book).await;
        let user = store.seed_user("ana@example.com", "Ana").await;
        let code = store.seed_code(book.id, "A-1").await;

        assert_eq!(check_assignment_limit(&store, &book, user.id, 1).await, Ok(0));
        assert!(matches!(
            check_assignment_limit(&store, &book, user.id, 2).await,
            Err(PortError::Forbidden(_))
        ));
        store.assign_code(code.id, user.id, None, Utc::now()).await.unwrap();
        assert!(matches!(
            check_assignment_limit(&store, &book, user.id, 1).await,
            Err(PortError::Forbidden(_))
        ));
    }

    #[test]
    fn requested_quantity_counts_toward_cap() {
        assert!(ensure_assignment_fits(0, 3, None).is_ok());
        assert!(ensure_assignment_fits(1, 2, Some(3)).is_ok());
        assert_eq!(
            ensure_assignment_fits(1, 3, Some(3)),
            Err(PortError::Forbidden(
                "Per-user assignment limit reached for this CouponBook".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn single_redemption_policy_rejects_second_use() {
        let store = MemoryStore::new();
        let book = store.seed_book(sample_book(0)).await;
        let user = store.seed_user("ana@example.com", "Ana").await;
        let (code, assignment) = store.seed_assigned_code(book.id, "A-1", user.id).await;

        assert_eq!(check_redemption_limit(&store, &book, code.id, user.id).await, Ok(0));
        store.seed_redemption(code.id, assignment.id).await;
        assert_eq!(
            check_redemption_limit(&store, &book, code.id, user.id).await,
            Err(PortError::Forbidden("This coupon has already been redeemed".to_string()))
        );
    }

    #[tokio::test]
    async fn capped_multi_redemption_reports_limit_and_count() {
        let store = MemoryStore::new();
        let mut book = sample_book(0);
        book.allow_multiple_redemptions_per_user = true;
        book.per_user_max_redemptions = Some(2);
        let book = store.seed_book(book).await;
        let user = store.seed_user("ana@example.com", "Ana").await;
        let (code, assignment) = store.seed_assigned_code(book.id, "A-1", user.id).await;

        store.seed_redemption(code.id, assignment.id).await;
        assert_eq!(check_redemption_limit(&store, &book, code.id, user.id).await, Ok(1));
        store.seed_redemption(code.id, assignment.id).await;

        let err = check_redemption_limit(&store, &book, code.id, user.id)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);
        assert!(err.to_string().contains("Limit: 2, Current: 2"));
    }
}
