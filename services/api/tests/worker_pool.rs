//! services/api/tests/worker_pool.rs

use api_lib::worker::{process_job, WorkerPool};
use coupon_book_core::domain::{GenerationRequest, JobOptions, JobState};
use coupon_book_core::generation::{CodeGenerator, GenerateCodes, GenerationService, GeneratorSettings};
use coupon_book_core::memory::{sample_book, MemoryJobQueue, MemoryStore};
use coupon_book_core::ports::{JobQueue, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn generator(store: Arc<MemoryStore>) -> CodeGenerator {
    CodeGenerator::new(
        store,
        Arc::new(SystemClock),
        GeneratorSettings {
            max_batch_size: 100,
            batch_pause: Duration::ZERO,
            retry_pause: Duration::ZERO,
        },
    )
}

#[tokio::test]
async fn workers_drain_the_queue() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let book = store.seed_book(sample_book(0)).await;
    let service = GenerationService::new(store.clone(), queue.clone());

    let first = service
        .enqueue(GenerateCodes {
            book_id: book.id,
            quantity: 250,
            pattern: Some("POOL-####$$$$".to_string()),
        })
        .await
        .unwrap();
    let second = service
        .enqueue(GenerateCodes {
            book_id: book.id,
            quantity: 40,
            pattern: None,
        })
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::spawn(
        2,
        queue.clone(),
        generator(store.clone()),
        Duration::from_millis(10),
        shutdown.clone(),
    );

    let finished = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let a = queue.get_job(first.id).await.unwrap().unwrap();
            let b = queue.get_job(second.id).await.unwrap().unwrap();
            if a.state == JobState::Completed && b.state == JobState::Completed {
                return (a, b);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    shutdown.cancel();
    pool.join().await;

    let (a, b) = finished;
    assert_eq!(a.progress, 100);
    assert_eq!(a.result.unwrap().generated_count, 250);
    assert_eq!(b.result.unwrap().generated_count, 40);
    let codes = store.codes_of_book(book.id).await;
    assert_eq!(codes.len(), 290);
    assert_eq!(
        codes.iter().filter(|c| c.code.contains("-POOL-")).count(),
        250
    );
}

#[tokio::test]
async fn cancelled_pool_stops_idle_workers() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let shutdown = CancellationToken::new();
    let pool = WorkerPool::spawn(
        3,
        queue,
        generator(store),
        Duration::from_secs(60),
        shutdown.clone(),
    );

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), pool.join())
        .await
        .unwrap();
}

#[tokio::test]
async fn failing_job_is_retried_then_failed() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let generator = generator(store.clone());
    let request = GenerationRequest {
        book_id: 404,
        quantity: 10,
        pattern: "GONE-####".to_string(),
        batch_size: 100,
    };

    let retried = queue
        .enqueue(request.clone(), JobOptions::default())
        .await
        .unwrap();
    let claimed = queue.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.id, retried.id);
    process_job(queue.clone(), &generator, claimed).await;
    let job = queue.get_job(retried.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Delayed);
    assert_eq!(job.failed_reason.as_deref(), Some("CouponBook not found"));

    let single = queue
        .enqueue(
            request,
            JobOptions {
                attempts: 1,
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();
    let claimed = queue.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.id, single.id);
    process_job(queue.clone(), &generator, claimed).await;
    let job = queue.get_job(single.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.finished_at.is_some());
    assert_eq!(store.total_code_count().await, 0);
}
