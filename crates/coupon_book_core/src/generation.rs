//! crates/coupon_book_core/src/generation.rs
//!
//! Batch code generation: admission checks, job enqueueing, and the batch
//! loop executed by background workers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{
    BookStatus, CouponBook, GenerationJob, GenerationOutcome, GenerationRequest, JobCounts,
    JobFilter, JobOptions,
};
use crate::pattern::{collision_alternative, normalize_code, CodePattern, DEFAULT_PATTERN};
use crate::ports::{Clock, CouponStore, JobQueue, PortError, PortResult, ProgressSink};

/// Hard ceiling on rows generated and inserted per batch.
pub const MAX_BATCH_SIZE: u32 = 5_000;

/// Requests above this size jump ahead in the queue.
const LARGE_REQUEST: u32 = 10_000;

//=========================================================================================
// Admission
//=========================================================================================

/// Checks that `quantity` more codes may be generated for the book.
///
/// Runs before enqueueing and again when the job starts, since the book can
/// change in between.
pub async fn check_admission(
    store: &dyn CouponStore,
    book_id: i64,
    quantity: i64,
) -> PortResult<CouponBook> {
    let book = store
        .get_book(book_id)
        .await?
        .ok_or_else(|| PortError::NotFound("CouponBook not found".to_string()))?;

    if book.status == BookStatus::Archived {
        return Err(PortError::Conflict(
            "Cannot generate codes for archived book".to_string(),
        ));
    }

    if let Some(max) = book.total_codes {
        let existing = store.count_codes(book_id).await?;
        if existing + quantity > max {
            return Err(PortError::Conflict(format!(
                "Cannot generate {} codes. Maximum allowed: {}, existing: {}",
                quantity, max, existing
            )));
        }
    }
    Ok(book)
}

//=========================================================================================
// Enqueueing and Job Management
//=========================================================================================

/// A request to add codes to a book.
#[derive(Debug, Clone)]
pub struct GenerateCodes {
    pub book_id: i64,
    pub quantity: i64,
    pub pattern: Option<String>,
}

#[derive(Clone)]
pub struct GenerationService {
    store: Arc<dyn CouponStore>,
    queue: Arc<dyn JobQueue>,
}

impl GenerationService {
    pub fn new(store: Arc<dyn CouponStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self { store, queue }
    }

    /// Validates the request, runs admission and hands the job to the queue.
    pub async fn enqueue(&self, command: GenerateCodes) -> PortResult<GenerationJob> {
        if command.quantity <= 0 {
            return Err(PortError::Validation(
                "Quantity must be greater than 0".to_string(),
            ));
        }
        let quantity = u32::try_from(command.quantity)
            .map_err(|_| PortError::Validation("Quantity is too large".to_string()))?;

        let book = check_admission(self.store.as_ref(), command.book_id, command.quantity).await?;

        let pattern = command
            .pattern
            .filter(|p| !p.trim().is_empty())
            .or(book.code_pattern)
            .unwrap_or_else(|| DEFAULT_PATTERN.to_string());

        let request = GenerationRequest {
            book_id: book.id,
            quantity,
            pattern,
            batch_size: (quantity / 10).clamp(100, 1_000),
        };
        let options = JobOptions {
            priority: if quantity > LARGE_REQUEST { 1 } else { 5 },
            ..JobOptions::default()
        };

        let job = self.queue.enqueue(request, options).await?;
        info!(job_id = %job.id, book_id = book.id, quantity, "Code generation job enqueued");
        Ok(job)
    }

    pub async fn job(&self, job_id: Uuid) -> PortResult<GenerationJob> {
        self.queue
            .get_job(job_id)
            .await?
            .ok_or_else(|| PortError::NotFound("Job not found".to_string()))
    }

    pub async fn jobs(
        &self,
        filter: JobFilter,
        limit: usize,
        offset: usize,
    ) -> PortResult<Vec<GenerationJob>> {
        self.queue.list_jobs(filter, limit, offset).await
    }

    pub async fn counts(&self) -> PortResult<JobCounts> {
        self.queue.job_counts().await
    }

    pub async fn retry(&self, job_id: Uuid) -> PortResult<GenerationJob> {
        self.queue.retry(job_id).await
    }

    pub async fn cancel(&self, job_id: Uuid) -> PortResult<()> {
        self.queue.remove(job_id).await
    }
}

//=========================================================================================
// The Batch Loop
//=========================================================================================

#[derive(Debug, Clone, Copy)]
pub struct GeneratorSettings {
    pub max_batch_size: u32,
    /// Pause between batches to bound database pressure.
    pub batch_pause: Duration,
    /// Pause after a batch produced no usable candidates.
    pub retry_pause: Duration,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            max_batch_size: MAX_BATCH_SIZE,
            batch_pause: Duration::from_millis(50),
            retry_pause: Duration::from_millis(100),
        }
    }
}

/// Executes generation jobs. Correctness across concurrent jobs rests on the
/// store's unique constraint; in-memory deduplication only saves work.
#[derive(Clone)]
pub struct CodeGenerator {
    store: Arc<dyn CouponStore>,
    clock: Arc<dyn Clock>,
    settings: GeneratorSettings,
}

impl CodeGenerator {
    pub fn new(store: Arc<dyn CouponStore>, clock: Arc<dyn Clock>, settings: GeneratorSettings) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    /// Generates the codes of one job. Codes already inserted by earlier
    /// attempts of the same job count toward the quantity, so a rerun only
    /// produces the remainder.
    pub async fn run(
        &self,
        job_id: Uuid,
        request: &GenerationRequest,
        progress: &dyn ProgressSink,
    ) -> PortResult<GenerationOutcome> {
        let quantity = request.quantity;
        let done = u32::try_from(self.store.count_job_codes(job_id).await?)
            .unwrap_or(u32::MAX)
            .min(quantity);
        if done < quantity {
            check_admission(self.store.as_ref(), request.book_id, i64::from(quantity - done)).await?;
        }

        let pattern = CodePattern::for_book(&request.pattern, request.book_id);
        let batch_cap = request.batch_size.clamp(1, self.settings.max_batch_size.max(1));
        info!(
            job_id = %job_id,
            book_id = request.book_id,
            quantity,
            resumed_from = done,
            batch_cap,
            pattern = pattern.as_str(),
            "Starting code generation"
        );

        let mut total: u32 = done;
        let mut empty_rounds: u32 = 0;
        while total < quantity {
            let size = (quantity - total).min(batch_cap) as usize;
            let candidates = self.candidate_batch(&pattern, size, empty_rounds > 0);

            let existing = self.store.existing_codes(request.book_id, &candidates).await?;
            let fresh: Vec<String> = candidates
                .into_iter()
                .filter(|code| !existing.contains(code))
                .collect();

            if fresh.is_empty() {
                // The next round is built from fallback codes only.
                empty_rounds += 1;
                warn!(book_id = request.book_id, empty_rounds, "No unique codes in batch, retrying");
                tokio::time::sleep(self.settings.retry_pause).await;
                continue;
            }
            empty_rounds = 0;

            let inserted = self.insert_batch(request.book_id, job_id, &fresh).await?;
            total += inserted;
            progress.report(percent(total, quantity), total).await?;
            debug!(book_id = request.book_id, total, quantity, "Batch inserted");

            if total < quantity {
                tokio::time::sleep(self.settings.batch_pause).await;
            }
        }

        progress.report(100, total).await?;
        info!(book_id = request.book_id, generated = total, "Code generation finished");
        Ok(GenerationOutcome {
            generated_count: total,
            requested_count: quantity,
            book_id: request.book_id,
            pattern: pattern.as_str().to_string(),
        })
    }

    /// Builds `size` distinct normalized candidates, padding with fallback codes
    /// once `2 * size` expansions are exhausted.
    fn candidate_batch(&self, pattern: &CodePattern, size: usize, fallback_only: bool) -> Vec<String> {
        let mut rng = rand::thread_rng();
        let now = self.clock.now();
        let mut seen = HashSet::with_capacity(size);
        let mut codes = Vec::with_capacity(size);

        if !fallback_only {
            let max_attempts = size * 2;
            let mut attempts = 0;
            while codes.len() < size && attempts < max_attempts {
                let code = normalize_code(&pattern.expand(&mut rng));
                if seen.insert(code.clone()) {
                    codes.push(code);
                }
                attempts += 1;
            }
            if codes.len() < size {
                warn!(
                    pattern = pattern.as_str(),
                    unique = codes.len(),
                    wanted = size,
                    "Pattern too restrictive, padding batch with fallback codes"
                );
            }
        }

        while codes.len() < size {
            let code = normalize_code(&pattern.fallback(&mut rng, now));
            if seen.insert(code.clone()) {
                codes.push(code);
            }
        }
        codes
    }

    /// Bulk insert, falling back to row-by-row inserts when a unique
    /// constraint rejects the batch.
    async fn insert_batch(&self, book_id: i64, job_id: Uuid, codes: &[String]) -> PortResult<u32> {
        match self.store.insert_codes(book_id, codes, job_id).await {
            Ok(inserted) => return Ok(inserted as u32),
            Err(PortError::Duplicate(detail)) => {
                warn!(book_id, "Bulk insert hit a duplicate ({}), inserting one by one", detail);
            }
            Err(e) => return Err(e),
        }

        let mut inserted = 0;
        for code in codes {
            match self.store.insert_code(book_id, code, job_id).await {
                Ok(()) => inserted += 1,
                Err(PortError::Duplicate(_)) => {
                    let alternative =
                        normalize_code(&collision_alternative(code, &mut rand::thread_rng(), self.clock.now()));
                    match self.store.insert_code(book_id, &alternative, job_id).await {
                        Ok(()) => inserted += 1,
                        Err(PortError::Duplicate(_)) => {
                            warn!(book_id, code = %code, "Giving up on colliding code");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(inserted)
    }
}

fn percent(done: u32, total: u32) -> u8 {
    if total == 0 {
        return 100;
    }
    ((u64::from(done) * 100) / u64::from(total)).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobState;
    use crate::memory::{sample_book, ManualClock, MemoryJobQueue, MemoryStore, RecordingProgress};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Rejects the first report, then accepts everything.
    #[derive(Default)]
    struct FlakyProgress {
        failed: AtomicBool,
    }

    #[async_trait]
    impl ProgressSink for FlakyProgress {
        async fn report(&self, _progress: u8, _generated: u32) -> PortResult<()> {
            if self.failed.swap(true, Ordering::SeqCst) {
                Ok(())
            } else {
                Err(PortError::Unexpected("progress write failed".to_string()))
            }
        }
    }

    fn fast_settings(max_batch_size: u32) -> GeneratorSettings {
        GeneratorSettings {
            max_batch_size,
            batch_pause: Duration::from_millis(1),
            retry_pause: Duration::from_millis(1),
        }
    }

    fn generator(store: Arc<MemoryStore>, max_batch_size: u32) -> CodeGenerator {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        CodeGenerator::new(store, clock, fast_settings(max_batch_size))
    }

    fn request(book_id: i64, quantity: u32, pattern: &str, batch_size: u32) -> GenerationRequest {
        GenerationRequest {
            book_id,
            quantity,
            pattern: pattern.to_string(),
            batch_size,
        }
    }

    #[tokio::test]
    async fn generates_exactly_the_requested_unique_codes() {
        let store = Arc::new(MemoryStore::new());
        let book = store.seed_book(sample_book(0)).await;
        let progress = RecordingProgress::default();

        let outcome = generator(store.clone(), 5_000)
            .run(Uuid::new_v4(), &request(book.id, 500, "SALE-####$$", 120), &progress)
            .await
            .unwrap();

        assert_eq!(outcome.generated_count, 500);
        let codes = store.codes_of_book(book.id).await;
        assert_eq!(codes.len(), 500);
        let unique: HashSet<_> = codes.iter().map(|c| c.code.clone()).collect();
        assert_eq!(unique.len(), 500);
        assert!(codes.iter().all(|c| c.code == c.code.to_uppercase()));

        let reports = progress.reports().await;
        assert!(reports.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(reports.last(), Some(&100));
    }

    #[tokio::test]
    async fn restrictive_pattern_still_completes() {
        let store = Arc::new(MemoryStore::new());
        let book = store.seed_book(sample_book(0)).await;

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            generator(store.clone(), 5_000).run(Uuid::new_v4(), &request(book.id, 50, "#", 100), &RecordingProgress::default()),
        )
        .await
        .expect("generation must not hang")
        .unwrap();

        assert_eq!(outcome.generated_count, 50);
        assert_eq!(store.codes_of_book(book.id).await.len(), 50);
    }

    #[tokio::test]
    async fn repeated_jobs_on_an_exhausted_pattern_terminate() {
        let store = Arc::new(MemoryStore::new());
        let book = store.seed_book(sample_book(0)).await;
        let gen = generator(store.clone(), 5_000);

        for _ in 0..3 {
            tokio::time::timeout(
                Duration::from_secs(5),
                gen.run(Uuid::new_v4(), &request(book.id, 10, "#", 10), &RecordingProgress::default()),
            )
            .await
            .expect("generation must not hang")
            .unwrap();
        }
        assert_eq!(store.codes_of_book(book.id).await.len(), 30);
    }

    #[tokio::test]
    async fn collisions_with_other_books_fall_back_to_alternatives() {
        let store = Arc::new(MemoryStore::new());
        let book = store.seed_book(sample_book(0)).await;
        let other = store.seed_book(sample_book(0)).await;
        // Every possible expansion of the pattern already belongs to another book.
        for digit in 0..10 {
            store.seed_code(other.id, &format!("{}-{}", book.id, digit)).await;
        }

        let outcome = generator(store.clone(), 5_000)
            .run(Uuid::new_v4(), &request(book.id, 10, "#", 10), &RecordingProgress::default())
            .await
            .unwrap();

        assert_eq!(outcome.generated_count, 10);
        assert_eq!(store.codes_of_book(book.id).await.len(), 10);
        assert_eq!(store.codes_of_book(other.id).await.len(), 10);
        assert_eq!(store.total_code_count().await, 20);
    }

    #[tokio::test]
    async fn batch_size_is_clamped_to_the_ceiling() {
        let store = Arc::new(MemoryStore::new());
        let book = store.seed_book(sample_book(0)).await;

        generator(store.clone(), 40)
            .run(Uuid::new_v4(), &request(book.id, 100, "####$$$$", 10_000), &RecordingProgress::default())
            .await
            .unwrap();

        assert_eq!(store.bulk_insert_sizes().await, vec![40, 40, 20]);
    }

    #[tokio::test]
    async fn rerun_of_a_failed_job_generates_only_the_remainder() {
        let store = Arc::new(MemoryStore::new());
        let mut book = sample_book(0);
        book.total_codes = Some(100);
        let book = store.seed_book(book).await;
        let gen = generator(store.clone(), 40);
        let job_id = Uuid::new_v4();
        let job = request(book.id, 100, "####$$$$", 40);
        let progress = FlakyProgress::default();

        let err = gen.run(job_id, &job, &progress).await.unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert_eq!(store.codes_of_book(book.id).await.len(), 40);

        let outcome = gen.run(job_id, &job, &progress).await.unwrap();
        assert_eq!(outcome.generated_count, 100);
        assert_eq!(store.codes_of_book(book.id).await.len(), 100);
        assert_eq!(store.count_job_codes(job_id).await.unwrap(), 100);
        assert_eq!(store.bulk_insert_sizes().await, vec![40, 40, 20]);
    }

    #[tokio::test]
    async fn finished_job_rerun_inserts_nothing() {
        let store = Arc::new(MemoryStore::new());
        let book = store.seed_book(sample_book(0)).await;
        let gen = generator(store.clone(), 5_000);
        let job_id = Uuid::new_v4();
        let job = request(book.id, 10, "##$$", 10);

        gen.run(job_id, &job, &RecordingProgress::default()).await.unwrap();
        let progress = RecordingProgress::default();
        let outcome = gen.run(job_id, &job, &progress).await.unwrap();
        assert_eq!(outcome.generated_count, 10);
        assert_eq!(store.codes_of_book(book.id).await.len(), 10);
        assert_eq!(progress.reports().await, vec![100]);
        assert_eq!(progress.last_generated().await, Some(10));
    }

    #[tokio::test]
    async fn execution_rechecks_admission() {
        let store = Arc::new(MemoryStore::new());
        let book = store.seed_book(sample_book(0)).await;
        store.set_book_status(book.id, BookStatus::Archived).await.unwrap();

        let err = generator(store, 5_000)
            .run(Uuid::new_v4(), &request(book.id, 5, "##", 5), &RecordingProgress::default())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn enqueue_rejects_capacity_overflow() {
        let store = Arc::new(MemoryStore::new());
        let mut book = sample_book(0);
        book.total_codes = Some(100);
        let book = store.seed_book(book).await;
        for i in 0..90 {
            store.seed_code(book.id, &format!("EXISTING-{}", i)).await;
        }
        let service = GenerationService::new(store, Arc::new(MemoryJobQueue::new()));

        let err = service
            .enqueue(GenerateCodes {
                book_id: book.id,
                quantity: 20,
                pattern: None,
            })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PortError::Conflict(
                "Cannot generate 20 codes. Maximum allowed: 100, existing: 90".to_string()
            )
        );
    }

    #[tokio::test]
    async fn enqueue_validates_and_shapes_the_job() {
        let store = Arc::new(MemoryStore::new());
        let mut book = sample_book(0);
        book.code_pattern = Some("BOOK-###".to_string());
        let book = store.seed_book(book).await;
        let service = GenerationService::new(store.clone(), Arc::new(MemoryJobQueue::new()));

        let bad = service
            .enqueue(GenerateCodes {
                book_id: book.id,
                quantity: 0,
                pattern: None,
            })
            .await
            .unwrap_err();
        assert_eq!(bad.status_code(), 400);

        let missing = service
            .enqueue(GenerateCodes {
                book_id: 999,
                quantity: 5,
                pattern: None,
            })
            .await
            .unwrap_err();
        assert_eq!(missing.status_code(), 404);

        let job = service
            .enqueue(GenerateCodes {
                book_id: book.id,
                quantity: 20_000,
                pattern: None,
            })
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.request.pattern, "BOOK-###");
        assert_eq!(job.request.batch_size, 1_000);
        assert_eq!(job.options.priority, 1);
        assert_eq!(job.options.attempts, 3);

        let small = service
            .enqueue(GenerateCodes {
                book_id: book.id,
                quantity: 50,
                pattern: Some("X-##".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(small.request.batch_size, 100);
        assert_eq!(small.request.pattern, "X-##");
        assert_eq!(small.options.priority, 5);
        assert_eq!(service.job(small.id).await.unwrap().id, small.id);
    }

    #[test]
    fn progress_is_floored() {
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(2, 3), 66);
        assert_eq!(percent(3, 3), 100);
    }
}
