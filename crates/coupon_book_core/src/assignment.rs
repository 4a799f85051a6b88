//! crates/coupon_book_core/src/assignment.rs
//!
//! Binding codes to users, randomly or by code, and undoing it.

use std::sync::Arc;
use tracing::info;

use crate::domain::{AssignmentDetail, CodeFilter, CouponAssignment, CouponStatus, User};
use crate::eligibility::{check_assignment_limit, ensure_book_open};
use crate::pattern::normalize_code;
use crate::ports::{Clock, CouponStore, PortError, PortResult};

#[derive(Clone)]
pub struct AssignmentService {
    store: Arc<dyn CouponStore>,
    clock: Arc<dyn Clock>,
}

impl AssignmentService {
    pub fn new(store: Arc<dyn CouponStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Assigns `quantity` random available codes of a book to a user.
    pub async fn assign_random(
        &self,
        book_id: i64,
        user_id: i64,
        quantity: i64,
    ) -> PortResult<(User, Vec<CouponAssignment>)> {
        if quantity <= 0 {
            return Err(PortError::Validation(
                "Quantity must be greater than 0".to_string(),
            ));
        }
        let now = self.clock.now();
        let book = self
            .store
            .get_book(book_id)
            .await?
            .ok_or_else(|| PortError::NotFound("Book not found".to_string()))?;
        ensure_book_open(&book, now)?;
        check_assignment_limit(self.store.as_ref(), &book, user_id, quantity).await?;
        let user = self.user(user_id).await?;

        let available = self.store.count_available_codes(book_id).await?;
        if available < quantity {
            return Err(PortError::Validation(format!(
                "Not enough available coupons. Found {}, needed {}",
                available, quantity
            )));
        }

        let assignments = self
            .store
            .assign_random(book_id, user_id, quantity, book.per_user_max_assigned_codes, now)
            .await?;
        info!(book_id, user_id, assigned = assignments.len(), "Random coupons assigned");
        Ok((user, assignments))
    }

    /// Assigns one specific available code to a user.
    pub async fn assign_specific(
        &self,
        code: &str,
        user_id: i64,
    ) -> PortResult<(User, CouponAssignment)> {
        let code = normalize_code(code);
        let now = self.clock.now();
        let coupon = self
            .store
            .find_code(&code)
            .await?
            .filter(|c| c.status == CouponStatus::Available)
            .ok_or_else(|| PortError::NotFound("Coupon not found or not available".to_string()))?;
        let book = self
            .store
            .get_book(coupon.book_id)
            .await?
            .ok_or_else(|| PortError::NotFound("Book not found".to_string()))?;
        ensure_book_open(&book, now)?;
        check_assignment_limit(self.store.as_ref(), &book, user_id, 1).await?;
        let user = self.user(user_id).await?;

        let assignment = self
            .store
            .assign_code(coupon.id, user_id, book.per_user_max_assigned_codes, now)
            .await?;
        info!(code = %code, user_id, "Coupon assigned");
        Ok((user, assignment))
    }

    /// Soft-deletes an assignment and puts its code back into the pool.
    pub async fn unassign(&self, assignment_id: i64) -> PortResult<()> {
        let assignment = self
            .store
            .get_assignment(assignment_id)
            .await?
            .ok_or_else(|| PortError::NotFound("Assignment not found".to_string()))?;
        let coupon = self
            .store
            .get_code(assignment.coupon_id)
            .await?
            .ok_or_else(|| {
                PortError::Validation("Coupon code not found for this assignment".to_string())
            })?;
        if coupon.status != CouponStatus::Assigned {
            return Err(PortError::Validation(
                "Only assigned coupons can be unassigned".to_string(),
            ));
        }
        self.store.unassign(assignment_id, self.clock.now()).await?;
        info!(assignment_id, code = %coupon.code, "Coupon unassigned");
        Ok(())
    }

    /// Live assignments of a user, newest first.
    pub async fn for_user(
        &self,
        user_id: i64,
        filter: CodeFilter,
    ) -> PortResult<(User, Vec<AssignmentDetail>)> {
        let user = self.user(user_id).await?;
        let assignments = self.store.user_assignments(user_id, filter).await?;
        Ok((user, assignments))
    }

    async fn user(&self, user_id: i64) -> PortResult<User> {
        self.store
            .get_user(user_id)
            .await?
            .ok_or_else(|| PortError::NotFound("User not found".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{sample_book, ManualClock, MemoryStore};
    use chrono::Utc;

    async fn setup() -> (Arc<MemoryStore>, AssignmentService, i64, i64) {
        setup_with_cap(Some(3)).await
    }

    async fn setup_with_cap(cap: Option<i64>) -> (Arc<MemoryStore>, AssignmentService, i64, i64) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let service = AssignmentService::new(store.clone(), clock);
        let mut book = sample_book(0);
        book.per_user_max_assigned_codes = cap;
        let book = store.seed_book(book).await;
        for i in 0..5 {
            store.seed_code(book.id, &format!("R-{}", i)).await;
        }
        let user = store.seed_user("bo@example.com", "Bo").await;
        (store, service, book.id, user.id)
    }

    #[tokio::test]
    async fn random_assignment_flips_codes() {
        let (store, service, book_id, user_id) = setup().await;
        let (user, assignments) = service.assign_random(book_id, user_id, 2).await.unwrap();
        assert_eq!(user.name, "Bo");
        assert_eq!(assignments.len(), 2);
        for a in &assignments {
            let code = store.get_code(a.coupon_id).await.unwrap().unwrap();
            assert_eq!(code.status, CouponStatus::Assigned);
            assert!(code.assigned_at.is_some());
        }
        assert_eq!(store.count_available_codes(book_id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn random_assignment_checks_stock_and_caps() {
        let (_store, service, book_id, user_id) = setup_with_cap(None).await;
        let err = service.assign_random(book_id, user_id, 9).await.unwrap_err();
        assert_eq!(
            err,
            PortError::Validation("Not enough available coupons. Found 5, needed 9".to_string())
        );

        let (_store, service, book_id, user_id) = setup().await;
        service.assign_random(book_id, user_id, 3).await.unwrap();
        let err = service.assign_random(book_id, user_id, 1).await.unwrap_err();
        assert_eq!(err.status_code(), 403);

        assert_eq!(
            service.assign_random(book_id, 404, 1).await.unwrap_err(),
            PortError::NotFound("User not found".to_string())
        );
    }

    #[tokio::test]
    async fn random_quantity_must_fit_under_cap() {
        let (store, service, book_id, user_id) = setup_with_cap(Some(1)).await;
        let err = service.assign_random(book_id, user_id, 3).await.unwrap_err();
        assert_eq!(err.status_code(), 403);
        assert_eq!(store.count_user_assignments_in_book(user_id, book_id).await.unwrap(), 0);

        // The store re-checks the cap inside its own transaction.
        let err = store
            .assign_random(book_id, user_id, 3, Some(1), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);
        assert_eq!(store.count_available_codes(book_id).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn lists_user_assignments_by_status() {
        let (store, service, book_id, user_id) = setup().await;
        let (_, assigned) = service.assign_random(book_id, user_id, 2).await.unwrap();
        store
            .force_code_status(assigned[0].coupon_id, CouponStatus::Redeemed)
            .await;

        let (user, all) = service.for_user(user_id, CodeFilter::default()).await.unwrap();
        assert_eq!(user.id, user_id);
        assert_eq!(all.len(), 2);

        let (_, redeemed) = service
            .for_user(
                user_id,
                CodeFilter {
                    book_id: Some(book_id),
                    status: Some(CouponStatus::Redeemed),
                },
            )
            .await
            .unwrap();
        assert_eq!(redeemed.len(), 1);
        assert_eq!(redeemed[0].assignment.coupon_id, assigned[0].coupon_id);

        assert_eq!(
            service.for_user(404, CodeFilter::default()).await.unwrap_err(),
            PortError::NotFound("User not found".to_string())
        );
    }

    #[tokio::test]
    async fn specific_assignment_and_unassignment() {
        let (store, service, _book_id, user_id) = setup().await;
        let (_, assignment) = service.assign_specific(" r-1 ", user_id).await.unwrap();

        let err = service.assign_specific("R-1", user_id).await.unwrap_err();
        assert_eq!(err.status_code(), 404);

        service.unassign(assignment.id).await.unwrap();
        let code = store.find_code("R-1").await.unwrap().unwrap();
        assert_eq!(code.status, CouponStatus::Available);
        assert!(code.assigned_at.is_none());
        assert!(store.active_assignment(code.id).await.unwrap().is_none());

        assert_eq!(service.unassign(assignment.id).await.unwrap_err().status_code(), 404);
    }

    #[tokio::test]
    async fn paused_books_refuse_assignment() {
        let (store, service, book_id, user_id) = setup().await;
        store
            .set_book_status(book_id, crate::domain::BookStatus::Paused)
            .await
            .unwrap();
        let err = service.assign_random(book_id, user_id, 1).await.unwrap_err();
        assert_eq!(err, PortError::Conflict("CouponBook is not ACTIVE".to_string()));
    }
}
