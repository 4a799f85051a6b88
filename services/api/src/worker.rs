//! services/api/src/worker.rs
//!
//! The background worker pool that drains the code-generation queue.
//!
//! Each worker claims one job at a time, runs the batch loop and records the
//! outcome on the job. Cancelling the shutdown token stops workers from
//! claiming new jobs; jobs already running are finished before `join` returns.

use coupon_book_core::domain::{GenerationJob, JobState};
use coupon_book_core::generation::CodeGenerator;
use coupon_book_core::ports::{JobQueue, PortResult, ProgressSink};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `concurrency` workers sharing one queue.
    pub fn spawn(
        concurrency: usize,
        queue: Arc<dyn JobQueue>,
        generator: CodeGenerator,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let handles = (0..concurrency.max(1))
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    queue.clone(),
                    generator.clone(),
                    poll_interval,
                    shutdown.clone(),
                ))
            })
            .collect();
        info!(concurrency, "Code generation workers started");
        Self { handles }
    }

    /// Waits for every worker to stop. Cancel the shutdown token first.
    pub async fn join(self) {
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                error!("Worker task ended abnormally: {}", e);
            }
        }
        info!("Code generation workers stopped");
    }
}

async fn worker_loop(
    worker: usize,
    queue: Arc<dyn JobQueue>,
    generator: CodeGenerator,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            info!(worker, "Worker shutting down");
            return;
        }

        match queue.claim_next().await {
            Ok(Some(job)) => process_job(queue.clone(), &generator, job).await,
            Ok(None) => idle(&shutdown, poll_interval).await,
            Err(e) => {
                error!(worker, "Failed to claim a job: {}", e);
                idle(&shutdown, poll_interval).await;
            }
        }
    }
}

async fn idle(shutdown: &CancellationToken, poll_interval: Duration) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(poll_interval) => {}
    }
}

/// Runs one claimed job to completion and records the result on the queue.
pub async fn process_job(queue: Arc<dyn JobQueue>, generator: &CodeGenerator, job: GenerationJob) {
    info!(
        job_id = %job.id,
        book_id = job.request.book_id,
        quantity = job.request.quantity,
        attempt = job.attempts_made,
        "Processing code generation job"
    );
    let progress = QueueProgress {
        queue: queue.clone(),
        job_id: job.id,
    };

    match generator.run(job.id, &job.request, &progress).await {
        Ok(outcome) => {
            let generated = outcome.generated_count;
            match queue.complete(job.id, outcome).await {
                Ok(()) => info!(job_id = %job.id, generated, "Code generation job completed"),
                Err(e) => error!(job_id = %job.id, "Failed to record job completion: {}", e),
            }
        }
        Err(run_error) => match queue.fail(job.id, &run_error.to_string()).await {
            Ok(JobState::Delayed) => {
                warn!(job_id = %job.id, error = %run_error, "Code generation failed, retry scheduled")
            }
            Ok(_) => error!(job_id = %job.id, error = %run_error, "Code generation failed permanently"),
            Err(e) => error!(job_id = %job.id, "Failed to record job failure: {}", e),
        },
    }
}

/// Forwards generator progress to the job record.
struct QueueProgress {
    queue: Arc<dyn JobQueue>,
    job_id: Uuid,
}

#[async_trait::async_trait]
impl ProgressSink for QueueProgress {
    async fn report(&self, progress: u8, generated: u32) -> PortResult<()> {
        self.queue
            .report_progress(self.job_id, progress, generated)
            .await
    }
}
