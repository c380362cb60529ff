use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tracing::debug;

use crate::error::{JobError, QueueError};
use crate::events::EventBus;
use crate::metrics_consts::{ATTEMPT_DURATION, JOBS_COMPLETED, JOBS_FAILED, JOBS_RETRIED};
use crate::store::Store;
use crate::types::{Job, JobHandler, JobStatus};

/// Drive a single claimed job through one attempt: log the attempt row,
/// publish the running view, run the handler under its deadline, apply the
/// transactional success-or-failure transition, publish the outcome.
///
/// Errors returned here are queue/database errors; handler failures are
/// consumed by the retry-or-fail transition and never bubble out.
pub(crate) async fn execute(
    store: &Store,
    bus: &EventBus,
    job: Job,
    handler: JobHandler,
) -> Result<(), QueueError> {
    let attempt_log_id = store.log_attempt_start(&job).await?;

    // The claim already moved the row to running, so this snapshot is the
    // running view subscribers expect as the first of the two per-attempt
    // events.
    bus.publish_attempt(&job);

    let labels = [("type", job.job_type.clone())];
    let started = tokio::time::Instant::now();
    let outcome = run_handler(&job, handler).await;
    metrics::histogram!(ATTEMPT_DURATION, &labels).record(started.elapsed().as_secs_f64());

    match outcome {
        Ok(result) => {
            let updated = store.complete(job.id, attempt_log_id, &result).await?;
            metrics::counter!(JOBS_COMPLETED, &labels).increment(1);
            debug!(uid = %updated.uid, attempts = updated.attempts, "job completed");

            bus.publish_attempt(&updated);
            bus.publish_done(&updated);
        }
        Err(error) => {
            let updated = store.fail_or_requeue(&job, attempt_log_id, &error).await?;
            bus.publish_attempt(&updated);

            if updated.status == JobStatus::Failed {
                metrics::counter!(JOBS_FAILED, &labels).increment(1);
                debug!(uid = %updated.uid, error = %error, "job failed, attempts exhausted");
                bus.publish_done(&updated);
            } else {
                metrics::counter!(JOBS_RETRIED, &labels).increment(1);
                debug!(
                    uid = %updated.uid,
                    attempts = updated.attempts,
                    run_at = %updated.run_at,
                    error = %error,
                    "job requeued for retry"
                );
            }
        }
    }

    Ok(())
}

/// Run the handler, racing it against the per-attempt deadline when one is
/// set. Losing the race drops the handler future; that is cooperative
/// cancellation only, so work the handler spawned onto the runtime keeps
/// going. A panicking handler is folded into a normal failure.
async fn run_handler(job: &Job, handler: JobHandler) -> Result<Value, JobError> {
    // The executor only observes the panic payload, so asserting unwind
    // safety over the boxed handler future is fine.
    let fut = std::panic::AssertUnwindSafe(handler(job.clone())).catch_unwind();

    let outcome = if job.max_attempt_duration_ms > 0 {
        let deadline = Duration::from_millis(job.max_attempt_duration_ms as u64);
        match tokio::time::timeout(deadline, fut).await {
            Ok(outcome) => outcome,
            Err(_elapsed) => return Err(JobError::timed_out()),
        }
    } else {
        fut.await
    };

    match outcome {
        Ok(result) => result,
        Err(panic) => Err(JobError::from_panic(panic)),
    }
}
