//! crates/coupon_book_core/src/books.rs
//!
//! Book lifecycle (ACTIVE, PAUSED, ARCHIVED) and the manual code overrides.

use std::sync::Arc;
use tracing::info;

use crate::domain::{
    BookStatus, BookUpdate, CodeFilter, CouponBook, CouponCode, CouponStatus, GenerationJob,
    NewBook, Page, Paged,
};
use crate::generation::{GenerateCodes, GenerationService};
use crate::ports::{CouponStore, PortError, PortResult};

#[derive(Clone)]
pub struct BookService {
    store: Arc<dyn CouponStore>,
    generation: GenerationService,
}

impl BookService {
    pub fn new(store: Arc<dyn CouponStore>, generation: GenerationService) -> Self {
        Self { store, generation }
    }

    /// Creates an `Active` book. When `initial_codes` is set a generation job
    /// is enqueued for it through the regular admission checks.
    pub async fn create(
        &self,
        book: NewBook,
        initial_codes: Option<i64>,
    ) -> PortResult<(CouponBook, Option<GenerationJob>)> {
        if book.name.trim().is_empty() {
            return Err(PortError::Validation("name is required".to_string()));
        }
        validate_window(&book.start_at, &book.end_at)?;
        validate_limits(
            book.total_codes,
            book.per_user_max_assigned_codes,
            book.per_user_max_redemptions,
        )?;

        let created = self.store.create_book(book).await?;
        info!(book_id = created.id, name = %created.name, "Coupon book created");

        let job = match initial_codes {
            Some(quantity) => Some(
                self.generation
                    .enqueue(GenerateCodes {
                        book_id: created.id,
                        quantity,
                        pattern: None,
                    })
                    .await?,
            ),
            None => None,
        };
        Ok((created, job))
    }

    pub async fn get(&self, book_id: i64) -> PortResult<CouponBook> {
        self.store
            .get_book(book_id)
            .await?
            .ok_or_else(book_not_found)
    }

    pub async fn update(&self, book_id: i64, update: BookUpdate) -> PortResult<CouponBook> {
        let mut book = self.get(book_id).await?;
        if book.status == BookStatus::Archived {
            return Err(PortError::Conflict(
                "Archived books cannot be modified".to_string(),
            ));
        }
        update.apply_to(&mut book);
        validate_window(&book.start_at, &book.end_at)?;
        validate_limits(
            book.total_codes,
            book.per_user_max_assigned_codes,
            book.per_user_max_redemptions,
        )?;
        self.store.update_book(book_id, update).await
    }

    pub async fn pause(&self, book_id: i64) -> PortResult<CouponBook> {
        self.transition(book_id, BookStatus::Paused, "Archived books cannot be paused")
            .await
    }

    pub async fn reactivate(&self, book_id: i64) -> PortResult<CouponBook> {
        self.transition(book_id, BookStatus::Active, "Archived books cannot be reactivated")
            .await
    }

    pub async fn archive(&self, book_id: i64) -> PortResult<CouponBook> {
        self.transition(book_id, BookStatus::Archived, "Book is already archived")
            .await
    }

    async fn transition(
        &self,
        book_id: i64,
        target: BookStatus,
        archived_message: &str,
    ) -> PortResult<CouponBook> {
        let book = self.get(book_id).await?;
        if book.status == BookStatus::Archived {
            return Err(PortError::Conflict(archived_message.to_string()));
        }
        let updated = self.store.set_book_status(book_id, target).await?;
        info!(book_id, from = %book.status, to = %target, "Book status changed");
        Ok(updated)
    }

    /// Takes a code out of circulation. Redeemed codes stay as they are.
    pub async fn disable_code(&self, coupon_id: i64) -> PortResult<CouponCode> {
        let code = self.code(coupon_id).await?;
        if code.status == CouponStatus::Redeemed {
            return Err(PortError::Conflict(
                "Cannot disable a redeemed code".to_string(),
            ));
        }
        self.store
            .set_code_status(coupon_id, CouponStatus::Disabled)
            .await
    }

    pub async fn enable_code(&self, coupon_id: i64) -> PortResult<CouponCode> {
        let code = self.code(coupon_id).await?;
        if code.status != CouponStatus::Disabled {
            return Err(PortError::Conflict(
                "Only disabled codes can be re-enabled".to_string(),
            ));
        }
        self.store
            .set_code_status(coupon_id, CouponStatus::Available)
            .await
    }

    pub async fn codes(&self, filter: CodeFilter, page: Page) -> PortResult<Paged<CouponCode>> {
        self.store.list_codes(filter, page).await
    }

    pub async fn code(&self, coupon_id: i64) -> PortResult<CouponCode> {
        self.store
            .get_code(coupon_id)
            .await?
            .ok_or_else(|| PortError::NotFound("CouponCode not found".to_string()))
    }
}

fn book_not_found() -> PortError {
    PortError::NotFound("CouponBook not found".to_string())
}

fn validate_window(
    start: &Option<chrono::DateTime<chrono::Utc>>,
    end: &Option<chrono::DateTime<chrono::Utc>>,
) -> PortResult<()> {
    if let (Some(start), Some(end)) = (start, end) {
        if end < start {
            return Err(PortError::Validation(
                "end_at must not be before start_at".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_limits(
    total_codes: Option<i64>,
    per_user_max_assigned_codes: Option<i64>,
    per_user_max_redemptions: Option<i64>,
) -> PortResult<()> {
    for (field, value) in [
        ("total_codes", total_codes),
        ("per_user_max_assigned_codes", per_user_max_assigned_codes),
        ("per_user_max_redemptions", per_user_max_redemptions),
    ] {
        if matches!(value, Some(v) if v < 0) {
            return Err(PortError::Validation(format!("{} must not be negative", field)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobState;
    use crate::memory::{MemoryJobQueue, MemoryStore};

    fn service(store: Arc<MemoryStore>, queue: Arc<MemoryJobQueue>) -> BookService {
        BookService::new(store.clone(), GenerationService::new(store, queue))
    }

    fn new_book(name: &str) -> NewBook {
        NewBook {
            name: name.to_string(),
            total_codes: Some(50),
            ..NewBook::default()
        }
    }

    #[tokio::test]
    async fn archived_is_terminal() {
        let store = Arc::new(MemoryStore::new());
        let books = service(store, Arc::new(MemoryJobQueue::new()));
        let (book, job) = books.create(new_book("Spring"), None).await.unwrap();
        assert_eq!(book.status, BookStatus::Active);
        assert!(job.is_none());

        assert_eq!(books.pause(book.id).await.unwrap().status, BookStatus::Paused);
        assert_eq!(books.reactivate(book.id).await.unwrap().status, BookStatus::Active);
        assert_eq!(books.archive(book.id).await.unwrap().status, BookStatus::Archived);

        for err in [
            books.pause(book.id).await.unwrap_err(),
            books.reactivate(book.id).await.unwrap_err(),
            books.archive(book.id).await.unwrap_err(),
            books.update(book.id, BookUpdate::default()).await.unwrap_err(),
        ] {
            assert_eq!(err.status_code(), 409);
        }
    }

    #[tokio::test]
    async fn creation_can_enqueue_initial_codes() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let books = service(store, queue);

        let (book, job) = books.create(new_book("Summer"), Some(30)).await.unwrap();
        let job = job.unwrap();
        assert_eq!(job.request.book_id, book.id);
        assert_eq!(job.state, JobState::Waiting);

        let err = books.create(new_book("Autumn"), Some(80)).await.unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn update_applies_fields() {
        let store = Arc::new(MemoryStore::new());
        let books = service(store, Arc::new(MemoryJobQueue::new()));
        let (book, _) = books.create(new_book("Winter"), None).await.unwrap();

        let updated = books
            .update(
                book.id,
                BookUpdate {
                    name: Some("Winter Sale".to_string()),
                    per_user_max_redemptions: Some(Some(2)),
                    ..BookUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Winter Sale");
        assert_eq!(updated.per_user_max_redemptions, Some(2));
        assert_eq!(updated.total_codes, Some(50));
    }

    #[tokio::test]
    async fn update_can_clear_optional_fields() {
        let store = Arc::new(MemoryStore::new());
        let books = service(store.clone(), Arc::new(MemoryJobQueue::new()));
        let mut book = new_book("Clear");
        book.description = Some("limited".to_string());
        book.per_user_max_assigned_codes = Some(4);
        let (book, _) = books.create(book, None).await.unwrap();

        let updated = books
            .update(
                book.id,
                BookUpdate {
                    total_codes: Some(None),
                    description: Some(None),
                    ..BookUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.total_codes, None);
        assert_eq!(updated.description, None);
        assert_eq!(updated.per_user_max_assigned_codes, Some(4));
        assert_eq!(store.get_book(book.id).await.unwrap().unwrap().total_codes, None);
    }

    #[tokio::test]
    async fn negative_limits_are_rejected() {
        let store = Arc::new(MemoryStore::new());
        let books = service(store, Arc::new(MemoryJobQueue::new()));
        let mut bad = new_book("Bad");
        bad.per_user_max_assigned_codes = Some(-1);
        assert_eq!(
            books.create(bad, None).await.unwrap_err(),
            PortError::Validation("per_user_max_assigned_codes must not be negative".to_string())
        );

        let (book, _) = books.create(new_book("Good"), None).await.unwrap();
        let err = books
            .update(
                book.id,
                BookUpdate {
                    total_codes: Some(Some(-5)),
                    ..BookUpdate::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(books.get(book.id).await.unwrap().total_codes, Some(50));
    }

    #[tokio::test]
    async fn manual_code_overrides() {
        let store = Arc::new(MemoryStore::new());
        let books = service(store.clone(), Arc::new(MemoryJobQueue::new()));
        let (book, _) = books.create(new_book("Codes"), None).await.unwrap();
        let code = store.seed_code(book.id, "OVR-1").await;

        assert_eq!(books.enable_code(code.id).await.unwrap_err().status_code(), 409);
        assert_eq!(
            books.disable_code(code.id).await.unwrap().status,
            CouponStatus::Disabled
        );
        assert_eq!(
            books.enable_code(code.id).await.unwrap().status,
            CouponStatus::Available
        );

        store.force_code_status(code.id, CouponStatus::Redeemed).await;
        assert_eq!(books.disable_code(code.id).await.unwrap_err().status_code(), 409);
        assert_eq!(books.disable_code(9_999).await.unwrap_err().status_code(), 404);
    }
}
