//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use coupon_book_core::assignment::AssignmentService;
use coupon_book_core::books::BookService;
use coupon_book_core::generation::GenerationService;
use coupon_book_core::ports::{Clock, CouponStore, JobQueue, LockCache};
use coupon_book_core::redemption::RedemptionService;
use std::sync::Arc;
use std::time::Duration;

//=========================================================================================
// AppState (Shared Across All Requests)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub redemptions: RedemptionService,
    pub generation: GenerationService,
    pub books: BookService,
    pub assignments: AssignmentService,
    /// Drops `details` from error bodies.
    pub hide_error_details: bool,
}

impl AppState {
    /// Wires every core service onto the given ports.
    pub fn new(
        store: Arc<dyn CouponStore>,
        cache: Arc<dyn LockCache>,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
        lock_ttl: Duration,
    ) -> Self {
        let generation = GenerationService::new(store.clone(), queue);
        Self {
            redemptions: RedemptionService::new(store.clone(), cache, clock.clone())
                .with_lock_ttl(lock_ttl),
            books: BookService::new(store.clone(), generation.clone()),
            assignments: AssignmentService::new(store, clock),
            generation,
            hide_error_details: false,
        }
    }

    pub fn with_hidden_error_details(mut self, hide: bool) -> Self {
        self.hide_error_details = hide;
        self
    }
}
