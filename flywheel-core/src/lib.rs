mod ops;

// We do this pattern (privately use a module, then re-export parts of it) so
// we can refactor or rename the internals without breaking the public API.

// Types
mod types;
pub use types::job_handler;
pub use types::noop_handler;
pub use types::AttemptStatus;
pub use types::BackoffStrategy;
pub use types::HandlerResult;
pub use types::Job;
pub use types::JobAttempt;
pub use types::JobHandler;
pub use types::JobStatus;
pub use types::NewJob;

// Errors
mod error;
// Failures reported by (or on behalf of) user handlers - drive retry-or-fail
pub use error::JobError;
// Errors about the queue itself - caller input, postgres/network errors, lifecycle misuse
pub use error::QueueError;

// Manager
mod manager;
pub use manager::FoundJob;
pub use manager::Manager;

// Store
mod store;
pub use store::Store;

// Retry policy
mod backoff;
pub use backoff::backoff_interval;

// Events
mod events;
pub use events::EventBus;
pub use events::EventCallback;
pub use events::EventChannel;
pub use events::SubscriptionHandle;
pub use events::WILDCARD_TOPIC;

// Schema
mod schema;
pub use schema::initialize;
pub use schema::uninstall;
pub use schema::TableNames;

// DB resilience
mod db_retry;
mod health;
pub use db_retry::with_retry;
pub use health::DbHealthStatus;
pub use health::HealthMonitor;

// Config
mod config;
pub use config::HealthCallback;
pub use config::HealthCheckConfig;
pub use config::ManagerConfig;
pub use config::PoolConfig;
pub use config::RetryConfig;
pub use config::DEFAULT_CONCURRENCY;
pub use config::DEFAULT_POLL_INTERVAL_MS;

// Listing / preview row types
pub use ops::janitor::HealthPreviewRow;
pub use ops::meta::JobFilter;

// Execution internals
mod executor;
mod metrics_consts;
mod worker;
