pub const JOBS_CREATED: &str = "flywheel_jobs_created";
pub const JOBS_CLAIMED: &str = "flywheel_jobs_claimed";
pub const JOBS_COMPLETED: &str = "flywheel_jobs_completed";
pub const JOBS_RETRIED: &str = "flywheel_jobs_retried";
pub const JOBS_FAILED: &str = "flywheel_jobs_failed";
pub const JOBS_EXPIRED: &str = "flywheel_jobs_expired";
pub const CLAIM_ERRORS: &str = "flywheel_claim_errors";
pub const BUSY_WORKERS: &str = "flywheel_busy_workers";
pub const ATTEMPT_DURATION: &str = "flywheel_attempt_duration_seconds";
