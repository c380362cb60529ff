use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use flywheel_core::{
    job_handler, AttemptStatus, EventCallback, Job, JobError, JobStatus, NewJob, QueueError,
};
use futures::FutureExt;
use sqlx::PgPool;

mod common;
use common::{recording_handler, test_manager, wait_for_status, wait_until};

fn counting_callback() -> (EventCallback, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let captured = count.clone();
    let callback: EventCallback = Arc::new(move |_job| {
        captured.fetch_add(1, Ordering::SeqCst);
    });
    (callback, count)
}

fn status_recorder() -> (EventCallback, Arc<Mutex<Vec<JobStatus>>>) {
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let captured = statuses.clone();
    let callback: EventCallback = Arc::new(move |job: &Job| {
        captured.lock().unwrap().push(job.status);
    });
    (callback, statuses)
}

#[sqlx::test(migrations = false)]
async fn test_happy_path(pool: PgPool) {
    let manager = test_manager(pool);
    let (handler, seen) = recording_handler();
    manager.set_handler("foo", handler);

    let job = manager
        .create(
            NewJob::new("foo")
                .payload(serde_json::json!({ "bar": "baz" }))
                .max_attempts(5),
        )
        .await
        .expect("failed to create job");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);

    manager.start(1).expect("failed to start manager");
    let done = wait_for_status(&manager, job.uid, JobStatus::Completed).await;
    manager.stop().await;

    assert_eq!(done.attempts, 1);
    assert_eq!(done.result, serde_json::json!({ "hey": "ho" }));
    assert_eq!(done.payload, serde_json::json!({ "bar": "baz" }));
    assert!(done.completed_at.is_some());
    assert_eq!(seen.lock().unwrap().as_slice(), &[job.id]);

    let found = manager
        .find(job.uid, true)
        .await
        .unwrap()
        .expect("job should exist");
    let attempts = found.attempts.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].attempt_number, 1);
    assert_eq!(attempts[0].status, Some(AttemptStatus::Success));
    assert!(attempts[0].completed_at.is_some());
    assert!(attempts[0].error_message.is_none());
}

#[sqlx::test(migrations = false)]
async fn test_successful_retry(pool: PgPool) {
    let manager = test_manager(pool);
    manager.set_handler(
        "flaky",
        job_handler(|job: Job| async move {
            if job.attempts <= 2 {
                Err(JobError::new("not yet"))
            } else {
                Ok(serde_json::json!({ "hey": "ho" }))
            }
        }),
    );

    let (attempt_cb, attempt_count) = counting_callback();
    let (done_cb, done_count) = counting_callback();
    let _attempt_sub = manager.on_attempt("flaky", attempt_cb);
    let _done_sub = manager.on_done("flaky", done_cb);

    let job = manager
        .create(
            NewJob::new("flaky")
                .max_attempts(3)
                .backoff_strategy(flywheel_core::BackoffStrategy::None),
        )
        .await
        .unwrap();

    manager.start(1).unwrap();
    let done = wait_for_status(&manager, job.uid, JobStatus::Completed).await;
    manager.stop().await;

    assert_eq!(done.attempts, 3);
    assert_eq!(done.result, serde_json::json!({ "hey": "ho" }));

    let attempts = manager
        .find(job.uid, true)
        .await
        .unwrap()
        .unwrap()
        .attempts
        .unwrap();
    let statuses: Vec<_> = attempts.iter().map(|a| a.status).collect();
    assert_eq!(
        statuses,
        vec![
            Some(AttemptStatus::Error),
            Some(AttemptStatus::Error),
            Some(AttemptStatus::Success)
        ]
    );
    assert_eq!(
        attempts.iter().map(|a| a.attempt_number).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(attempts[0].error_message.as_deref() == Some("not yet"));

    // Two events per attempt (running view + transition), one done.
    assert_eq!(attempt_count.load(Ordering::SeqCst), 6);
    assert_eq!(done_count.load(Ordering::SeqCst), 1);
}

#[sqlx::test(migrations = false)]
async fn test_exhausted_retries(pool: PgPool) {
    let manager = test_manager(pool);
    manager.set_handler(
        "doomed",
        job_handler(|_job: Job| async move {
            Err::<serde_json::Value, _>(JobError::new("always broken"))
        }),
    );

    let (done_cb, done_count) = counting_callback();
    let _sub = manager.on_done("doomed", done_cb);

    let job = manager
        .create(
            NewJob::new("doomed")
                .max_attempts(5)
                .backoff_strategy(flywheel_core::BackoffStrategy::None),
        )
        .await
        .unwrap();

    manager.start(1).unwrap();
    let failed = wait_for_status(&manager, job.uid, JobStatus::Failed).await;
    manager.stop().await;

    assert_eq!(failed.attempts, 5);
    assert!(failed.completed_at.is_some());

    let attempts = manager
        .find(job.uid, true)
        .await
        .unwrap()
        .unwrap()
        .attempts
        .unwrap();
    assert_eq!(attempts.len(), 5);
    assert!(attempts
        .iter()
        .all(|a| a.status == Some(AttemptStatus::Error)));
    assert!(attempts
        .iter()
        .all(|a| a.error_message.as_deref() == Some("always broken")));
    assert_eq!(done_count.load(Ordering::SeqCst), 1);
}

#[sqlx::test(migrations = false)]
async fn test_scheduled_run_waits_for_run_at(pool: PgPool) {
    let manager = test_manager(pool);
    let (handler, _seen) = recording_handler();
    manager.set_handler("later", handler);

    let job = manager
        .create(NewJob::new("later").run_at(Utc::now() + chrono::Duration::milliseconds(400)))
        .await
        .unwrap();

    manager.start(1).unwrap();

    // Well before run_at the job must still be pending.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let early = manager.find(job.uid, false).await.unwrap().unwrap();
    assert_eq!(early.job.status, JobStatus::Pending);

    let done = wait_for_status(&manager, job.uid, JobStatus::Completed).await;
    manager.stop().await;

    let waited = done.started_at.unwrap() - done.created_at;
    assert!(
        waited >= chrono::Duration::milliseconds(300),
        "job started after {waited} only"
    );
}

#[sqlx::test(migrations = false)]
async fn test_run_at_in_the_past_runs_immediately(pool: PgPool) {
    let manager = test_manager(pool);
    let (handler, _seen) = recording_handler();
    manager.set_handler("old", handler);

    let job = manager
        .create(NewJob::new("old").run_at(Utc::now() - chrono::Duration::minutes(5)))
        .await
        .unwrap();

    manager.start(1).unwrap();
    wait_for_status(&manager, job.uid, JobStatus::Completed).await;
    manager.stop().await;
}

#[sqlx::test(migrations = false)]
async fn test_per_attempt_timeout(pool: PgPool) {
    let manager = test_manager(pool);
    manager.set_handler(
        "slow",
        job_handler(|_job: Job| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(serde_json::json!({ "finished": true }))
        }),
    );

    let job = manager
        .create(
            NewJob::new("slow")
                .max_attempts(2)
                .max_attempt_duration_ms(150)
                .backoff_strategy(flywheel_core::BackoffStrategy::None),
        )
        .await
        .unwrap();

    manager.start(1).unwrap();
    let failed = wait_for_status(&manager, job.uid, JobStatus::Failed).await;
    manager.stop().await;

    assert_eq!(failed.attempts, 2);
    let attempts = manager
        .find(job.uid, true)
        .await
        .unwrap()
        .unwrap()
        .attempts
        .unwrap();
    assert_eq!(attempts.len(), 2);
    assert!(attempts
        .iter()
        .all(|a| a.error_message.as_deref() == Some("Execution timed out")));
}

#[sqlx::test(migrations = false)]
async fn test_concurrent_claim_exclusion(pool: PgPool) {
    let manager = test_manager(pool);
    let (handler, seen) = recording_handler();
    manager.set_handler("bulk", handler);

    let mut created = Vec::new();
    for _ in 0..12 {
        created.push(manager.create(NewJob::new("bulk")).await.unwrap().id);
    }

    manager.start(4).unwrap();
    wait_until("all jobs to execute", || seen.lock().unwrap().len() >= 12).await;
    manager.stop().await;

    // Every created id executed exactly once, no duplicates, no losses.
    let mut executed = seen.lock().unwrap().clone();
    executed.sort_unstable();
    created.sort_unstable();
    assert_eq!(executed, created);
}

#[sqlx::test(migrations = false)]
async fn test_noop_handler_when_nothing_matches(pool: PgPool) {
    let manager = test_manager(pool);

    let job = manager.create(NewJob::new("unrouted")).await.unwrap();
    manager.start(1).unwrap();
    let done = wait_for_status(&manager, job.uid, JobStatus::Completed).await;
    manager.stop().await;

    assert_eq!(done.result, serde_json::json!({ "noop": true }));
}

#[sqlx::test(migrations = false)]
async fn test_fallback_handler_catches_unrouted_types(pool: PgPool) {
    let manager = test_manager(pool);
    manager.set_fallback_handler(job_handler(|job: Job| async move {
        Ok(serde_json::json!({ "fell_back_from": job.job_type }))
    }));

    let job = manager.create(NewJob::new("mystery")).await.unwrap();
    manager.start(1).unwrap();
    let done = wait_for_status(&manager, job.uid, JobStatus::Completed).await;
    manager.stop().await;

    assert_eq!(
        done.result,
        serde_json::json!({ "fell_back_from": "mystery" })
    );
}

#[sqlx::test(migrations = false)]
async fn test_unserializable_result_completes_with_stub(pool: PgPool) {
    let manager = test_manager(pool);
    manager.set_handler(
        "weird",
        job_handler(|_job: Job| async move {
            // Maps with non-string keys cannot be represented as JSON.
            let mut value = std::collections::HashMap::new();
            value.insert(vec![1u8, 2], "unrepresentable");
            Ok(value)
        }),
    );

    let job = manager.create(NewJob::new("weird")).await.unwrap();
    manager.start(1).unwrap();
    let done = wait_for_status(&manager, job.uid, JobStatus::Completed).await;
    manager.stop().await;

    assert_eq!(
        done.result.get("message").and_then(serde_json::Value::as_str),
        Some("Unable to serialize completed job result")
    );
}

#[sqlx::test(migrations = false)]
async fn test_panicking_handler_is_a_normal_failure(pool: PgPool) {
    let manager = test_manager(pool);
    let crashy: flywheel_core::JobHandler =
        Arc::new(|_job| async move { panic!("handler bug") }.boxed());
    manager.set_handler("crashy", crashy);

    let job = manager
        .create(
            NewJob::new("crashy")
                .max_attempts(1)
                .backoff_strategy(flywheel_core::BackoffStrategy::None),
        )
        .await
        .unwrap();

    manager.start(1).unwrap();
    let failed = wait_for_status(&manager, job.uid, JobStatus::Failed).await;
    manager.stop().await;

    let attempts = manager
        .find(job.uid, true)
        .await
        .unwrap()
        .unwrap()
        .attempts
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("handler bug"));
    assert_eq!(failed.status, JobStatus::Failed);
}

#[sqlx::test(migrations = false)]
async fn test_attempt_events_carry_both_phases(pool: PgPool) {
    let manager = test_manager(pool);
    let (handler, _seen) = recording_handler();
    manager.set_handler("phased", handler);

    let (recorder, statuses) = status_recorder();
    let _sub = manager.on_attempt("phased", recorder);

    let job = manager.create(NewJob::new("phased")).await.unwrap();
    manager.start(1).unwrap();
    wait_for_status(&manager, job.uid, JobStatus::Completed).await;
    manager.stop().await;

    assert_eq!(
        statuses.lock().unwrap().as_slice(),
        &[JobStatus::Running, JobStatus::Completed]
    );
}

#[sqlx::test(migrations = false)]
async fn test_wildcard_subscription_and_unsubscribe(pool: PgPool) {
    let manager = test_manager(pool);
    let (handler, _seen) = recording_handler();
    manager.set_handler("a", handler.clone());
    manager.set_handler("b", handler);

    let (wild_cb, wild_count) = counting_callback();
    let sub = manager.on_done("*", wild_cb);

    let job_a = manager.create(NewJob::new("a")).await.unwrap();
    manager.start(1).unwrap();
    wait_for_status(&manager, job_a.uid, JobStatus::Completed).await;
    wait_until("wildcard done event", || {
        wild_count.load(Ordering::SeqCst) == 1
    })
    .await;

    sub.unsubscribe();
    let job_b = manager.create(NewJob::new("b")).await.unwrap();
    wait_for_status(&manager, job_b.uid, JobStatus::Completed).await;
    manager.stop().await;

    assert_eq!(wild_count.load(Ordering::SeqCst), 1);
}

#[sqlx::test(migrations = false)]
async fn test_duplicate_subscription_is_deduplicated(pool: PgPool) {
    let manager = test_manager(pool);
    let (handler, _seen) = recording_handler();
    manager.set_handler("dup", handler);

    let (callback, count) = counting_callback();
    let _first = manager.on_done("dup", callback.clone());
    let _second = manager.on_done("dup", callback);

    let job = manager.create(NewJob::new("dup")).await.unwrap();
    manager.start(1).unwrap();
    wait_for_status(&manager, job.uid, JobStatus::Completed).await;
    manager.stop().await;

    wait_until("deduped done event", || count.load(Ordering::SeqCst) >= 1).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[sqlx::test(migrations = false)]
async fn test_per_uid_callbacks(pool: PgPool) {
    let manager = test_manager(pool);
    let (handler, _seen) = recording_handler();
    manager.set_handler("mine", handler);

    let (done_cb, done_count) = counting_callback();
    let (attempt_cb, attempt_count) = counting_callback();
    let job = manager
        .create_with_callbacks(NewJob::new("mine"), Some(done_cb), Some(attempt_cb))
        .await
        .unwrap();

    // A job for the same type without callbacks must not trigger them.
    let other = manager.create(NewJob::new("mine")).await.unwrap();

    manager.start(1).unwrap();
    wait_for_status(&manager, job.uid, JobStatus::Completed).await;
    wait_for_status(&manager, other.uid, JobStatus::Completed).await;
    manager.stop().await;

    assert_eq!(done_count.load(Ordering::SeqCst), 1);
    // Running view plus completed view of the single attempt.
    assert_eq!(attempt_count.load(Ordering::SeqCst), 2);
}

#[sqlx::test(migrations = false)]
async fn test_stop_drains_in_flight_handlers(pool: PgPool) {
    let manager = test_manager(pool);
    let finished = Arc::new(AtomicUsize::new(0));
    let captured = finished.clone();
    manager.set_handler(
        "slowish",
        job_handler(move |_job: Job| {
            let captured = captured.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                captured.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::json!({}))
            }
        }),
    );

    let job = manager.create(NewJob::new("slowish")).await.unwrap();
    manager.start(1).unwrap();
    wait_until("job to become active", || manager.active_job_count() == 1).await;

    manager.stop().await;

    // stop() resolved only after the in-flight handler ran to completion.
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(manager.active_job_count(), 0);
    let done = manager.find(job.uid, false).await.unwrap().unwrap();
    assert_eq!(done.job.status, JobStatus::Completed);

    // Idempotent, and restarting after shutdown is refused.
    manager.stop().await;
    assert!(matches!(manager.start(1), Err(QueueError::ShuttingDown)));
}

#[sqlx::test(migrations = false)]
async fn test_create_validates_input(pool: PgPool) {
    let manager = test_manager(pool);

    let err = manager.create(NewJob::new("")).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidInput(_)));

    let err = manager
        .create(NewJob::new("x").max_attempts(0))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InvalidInput(_)));

    let err = manager
        .create(NewJob::new("x").max_attempt_duration_ms(-5))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InvalidInput(_)));
}

#[sqlx::test(migrations = false)]
async fn test_cleanup_expires_stuck_running_jobs(pool: PgPool) {
    let manager = test_manager(pool.clone());
    let job = manager.create(NewJob::new("stuck")).await.unwrap();

    // Simulate a worker that died hours ago while holding the row.
    sqlx::query("UPDATE \"job\" SET status = 'running', started_at = NOW() - INTERVAL '3 hours' WHERE id = $1")
        .bind(job.id)
        .execute(&pool)
        .await
        .unwrap();

    let expired = manager.cleanup().await.unwrap();
    assert_eq!(expired, 1);

    let found = manager.find(job.uid, true).await.unwrap().unwrap();
    assert_eq!(found.job.status, JobStatus::Expired);
    assert!(found.job.completed_at.is_some());
    // Attempt rows are untouched by expiry.
    assert!(found.attempts.unwrap().is_empty());

    // Expired rows are never claimed again.
    let (handler, seen) = recording_handler();
    manager.set_handler("stuck", handler);
    manager.start(1).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    manager.stop().await;
    assert!(seen.lock().unwrap().is_empty());
}

#[sqlx::test(migrations = false)]
async fn test_health_preview_aggregates_by_status(pool: PgPool) {
    let manager = test_manager(pool);
    let (handler, _seen) = recording_handler();
    manager.set_handler("done", handler);

    let done_job = manager.create(NewJob::new("done")).await.unwrap();
    manager
        .create(NewJob::new("waiting").run_at(Utc::now() + chrono::Duration::hours(1)))
        .await
        .unwrap();

    manager.start(1).unwrap();
    wait_for_status(&manager, done_job.uid, JobStatus::Completed).await;
    manager.stop().await;

    let rows = manager.health_preview(60).await.unwrap();
    let completed = rows
        .iter()
        .find(|r| r.status == JobStatus::Completed)
        .expect("completed bucket");
    assert_eq!(completed.count, 1);
    assert!(completed.avg_duration_seconds.is_some());

    let pending = rows
        .iter()
        .find(|r| r.status == JobStatus::Pending)
        .expect("pending bucket");
    assert_eq!(pending.count, 1);
    assert!(pending.avg_duration_seconds.is_none());
}

#[sqlx::test(migrations = false)]
async fn test_health_monitor_probes_on_interval(pool: PgPool) {
    use flywheel_core::{HealthCheckConfig, HealthMonitor};

    let (on_healthy, healthy_count) = counting_health_callback();
    let monitor = HealthMonitor::new(
        pool,
        HealthCheckConfig {
            interval_ms: 50,
            on_healthy: Some(on_healthy),
            on_unhealthy: None,
        },
    );
    assert!(monitor.last_status().is_none());

    monitor.start();
    wait_until("first probe", || monitor.last_status().is_some()).await;
    monitor.stop();

    let status = monitor.last_status().unwrap();
    assert!(status.healthy);
    assert!(status.server_version.is_some());
    // Entering the healthy state is one transition, steady state is quiet.
    let observed = healthy_count.load(Ordering::SeqCst);
    assert_eq!(observed, 1);
}

fn counting_health_callback() -> (flywheel_core::HealthCallback, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let captured = count.clone();
    let callback: flywheel_core::HealthCallback = Arc::new(move |_status| {
        captured.fetch_add(1, Ordering::SeqCst);
    });
    (callback, count)
}

#[sqlx::test(migrations = false)]
async fn test_check_db_health(pool: PgPool) {
    let manager = test_manager(pool);

    // Probing is disabled by default, so no status is recorded...
    assert!(manager.get_db_health().is_none());

    // ...but an explicit check still works.
    let status = manager.check_db_health().await;
    assert!(status.healthy);
    assert!(status.error.is_none());
    assert!(status.server_version.is_some());
}
