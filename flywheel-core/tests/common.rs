use std::sync::{Arc, Mutex};
use std::time::Duration;

use flywheel_core::{job_handler, Job, JobHandler, JobStatus, Manager, ManagerConfig};
use sqlx::PgPool;
use tokio::time::Instant;
use uuid::Uuid;

/// Manager tuned for tests: fast polling, no process signal hook.
#[allow(dead_code)]
pub fn test_manager(pool: PgPool) -> Manager {
    Manager::new(pool, test_config())
}

#[allow(dead_code)]
pub fn test_config() -> ManagerConfig {
    ManagerConfig {
        poll_interval_ms: 25,
        graceful_shutdown: false,
        ..Default::default()
    }
}

/// Handler that records every job id it sees and returns `{"hey": "ho"}`.
#[allow(dead_code)]
pub fn recording_handler() -> (JobHandler, Arc<Mutex<Vec<i32>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let captured = seen.clone();
    let handler = job_handler(move |job: Job| {
        let captured = captured.clone();
        async move {
            captured.lock().unwrap().push(job.id);
            Ok(serde_json::json!({ "hey": "ho" }))
        }
    });
    (handler, seen)
}

/// Poll until the job with `uid` reaches `status`, or panic after a few
/// seconds. Timestamps round-trip through PG with sub-ms jitter, so tests
/// assert windows, not instants.
#[allow(dead_code)]
pub async fn wait_for_status(manager: &Manager, uid: Uuid, status: JobStatus) -> Job {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(found) = manager
            .find(uid, false)
            .await
            .expect("failed to look up job")
        {
            if found.job.status == status {
                return found.job;
            }
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for job {uid} to reach {status}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until `check` passes, or panic after a few seconds.
#[allow(dead_code)]
pub async fn wait_until<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
