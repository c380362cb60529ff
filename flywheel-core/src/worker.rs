use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, error};

use crate::error::QueueError;
use crate::executor;
use crate::manager::ManagerInner;
use crate::metrics_consts::{BUSY_WORKERS, CLAIM_ERRORS, JOBS_CLAIMED};

/// How many consecutive claim failures are logged before the worker goes
/// quiet about them. A successful iteration resets the counter.
pub(crate) const CLAIM_ERROR_LOG_LIMIT: u32 = 5;

/// A single long-running worker task: claim-or-sleep until shutdown. Never
/// returns an error; claim failures are logged (muted past the limit) and
/// backed off.
pub(crate) async fn run(
    inner: Arc<ManagerInner>,
    mut shutdown: watch::Receiver<bool>,
    worker_id: usize,
) {
    debug!(worker_id, "worker started");

    loop {
        if *shutdown.borrow() || shutdown.has_changed().is_err() {
            break;
        }

        match run_once(&inner).await {
            Ok(true) => {
                inner.claim_errors.store(0, Ordering::Relaxed);
            }
            Ok(false) => {
                inner.claim_errors.store(0, Ordering::Relaxed);
                idle(&inner, &mut shutdown).await;
            }
            Err(error) => {
                let errors = inner.claim_errors.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::counter!(CLAIM_ERRORS).increment(1);
                if errors < CLAIM_ERROR_LOG_LIMIT {
                    error!(worker_id, %error, "job claim failed");
                } else if errors == CLAIM_ERROR_LOG_LIMIT {
                    error!(
                        worker_id,
                        %error,
                        "job claim failed, muting further claim errors"
                    );
                }
                idle(&inner, &mut shutdown).await;
            }
        }
    }

    debug!(worker_id, "worker stopped");
}

/// One iteration. `Ok(true)` means a job was executed, `Ok(false)` that the
/// queue was empty.
async fn run_once(inner: &Arc<ManagerInner>) -> Result<bool, QueueError> {
    inner.ensure_initialized().await?;

    let Some(job) = inner.store.claim_next().await? else {
        return Ok(false);
    };

    metrics::counter!(JOBS_CLAIMED, &[("type", job.job_type.clone())]).increment(1);
    let handler = inner.resolve_handler(&job.job_type);

    let _active = ActiveGuard::new(&inner.active, job.id);
    executor::execute(&inner.store, &inner.bus, job, handler).await?;

    Ok(true)
}

async fn idle(inner: &Arc<ManagerInner>, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(inner.config.poll_interval()) => {}
        _ = shutdown.changed() => {}
    }
}

/// Membership in the active-job set for the duration of one execution,
/// released even if the execution path errors.
struct ActiveGuard<'a> {
    active: &'a Mutex<HashSet<i32>>,
    id: i32,
}

impl<'a> ActiveGuard<'a> {
    fn new(active: &'a Mutex<HashSet<i32>>, id: i32) -> Self {
        active.lock().unwrap().insert(id);
        metrics::gauge!(BUSY_WORKERS).increment(1.0);
        Self { active, id }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.lock().unwrap().remove(&self.id);
        metrics::gauge!(BUSY_WORKERS).decrement(1.0);
    }
}
