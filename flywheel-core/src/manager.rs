use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex, RwLock};

use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{ManagerConfig, DEFAULT_CONCURRENCY};
use crate::error::QueueError;
use crate::events::{EventBus, EventCallback, EventChannel, SubscriptionHandle};
use crate::health::{self, DbHealthStatus, HealthMonitor};
use crate::metrics_consts::{JOBS_CREATED, JOBS_EXPIRED};
use crate::ops::janitor::HealthPreviewRow;
use crate::ops::meta::JobFilter;
use crate::schema::{self, TableNames};
use crate::store::Store;
use crate::types::{noop_handler, Job, JobAttempt, JobHandler, NewJob};
use crate::worker;

/// A job looked up by uid, optionally with its attempt log.
#[derive(Debug, Clone)]
pub struct FoundJob {
    pub job: Job,
    pub attempts: Option<Vec<JobAttempt>>,
}

// Shared between the manager facade and its worker tasks. Workers touch
// nothing here except through the store, the bus, and the active set.
pub(crate) struct ManagerInner {
    pub(crate) store: Store,
    pub(crate) bus: EventBus,
    pub(crate) config: ManagerConfig,
    pub(crate) handlers: RwLock<HashMap<String, JobHandler>>,
    pub(crate) fallback: RwLock<Option<JobHandler>>,
    pub(crate) active: Mutex<HashSet<i32>>,
    pub(crate) claim_errors: AtomicU32,
    schema_ready: tokio::sync::OnceCell<()>,
}

impl ManagerInner {
    /// Create the schema on the first operation that needs it, exactly once
    /// per manager.
    pub(crate) async fn ensure_initialized(&self) -> Result<(), QueueError> {
        self.schema_ready
            .get_or_try_init(|| schema::initialize(self.store.pool(), self.store.tables(), false))
            .await?;
        Ok(())
    }

    /// Per-type handler, else the fallback, else noop.
    pub(crate) fn resolve_handler(&self, job_type: &str) -> JobHandler {
        if let Some(handler) = self.handlers.read().unwrap().get(job_type) {
            return handler.clone();
        }
        if let Some(fallback) = self.fallback.read().unwrap().as_ref() {
            return fallback.clone();
        }
        noop_handler()
    }
}

/// The facade owning the worker pool, handler registry, event bus, per-job
/// callbacks, optional DB resilience helpers, and graceful shutdown.
///
/// Construct inside a tokio runtime. The pool is shared, not owned: close
/// it after [`Manager::stop`]. Handler deadlines cancel only the wait, not
/// work the handler has spawned elsewhere.
pub struct Manager {
    inner: Arc<ManagerInner>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    signal_task: Mutex<Option<JoinHandle<()>>>,
    health: Option<Arc<HealthMonitor>>,
}

impl Manager {
    pub fn new(pool: PgPool, config: ManagerConfig) -> Self {
        let tables = TableNames::new(&config.table_prefix);
        let store = Store::new(pool.clone(), tables).with_retry(config.db_retry.clone());

        let health = config.db_health_check.clone().map(|health_config| {
            let monitor = Arc::new(HealthMonitor::new(pool, health_config));
            monitor.start();
            monitor
        });

        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(ManagerInner {
                store,
                bus: EventBus::new(),
                config,
                handlers: RwLock::new(HashMap::new()),
                fallback: RwLock::new(None),
                active: Mutex::new(HashSet::new()),
                claim_errors: AtomicU32::new(0),
                schema_ready: tokio::sync::OnceCell::new(),
            }),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
            signal_task: Mutex::new(None),
            health,
        }
    }

    /// Spawn `concurrency` workers (at least one). A no-op if workers are
    /// already running; an error once shutdown has begun.
    pub fn start(&self, concurrency: usize) -> Result<(), QueueError> {
        if *self.shutdown_tx.borrow() {
            return Err(QueueError::ShuttingDown);
        }

        let mut workers = self.workers.lock().unwrap();
        if !workers.is_empty() {
            return Ok(());
        }

        let concurrency = concurrency.max(1);
        for worker_id in 0..concurrency {
            let inner = self.inner.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            workers.push(tokio::spawn(worker::run(inner, shutdown_rx, worker_id)));
        }
        drop(workers);

        self.register_signal_handler();
        info!(concurrency, "job manager started");
        Ok(())
    }

    /// [`Manager::start`] with the default concurrency of 2.
    pub fn start_default(&self) -> Result<(), QueueError> {
        self.start(DEFAULT_CONCURRENCY)
    }

    /// Signal shutdown and wait for every worker to finish its in-flight
    /// handler. Handlers are not interrupted; a deadlocked handler blocks
    /// this call. Calling stop again after it completed is a no-op.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap();
            workers.drain(..).collect()
        };
        for handle in handles {
            if let Err(error) = handle.await {
                warn!(%error, "worker task ended abnormally");
            }
        }

        if let Some(task) = self.signal_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(health) = &self.health {
            health.stop();
        }
        info!("job manager stopped");
    }

    /// Durably record a job. The row is visible (and claimable) as soon as
    /// this returns.
    pub async fn create(&self, new: NewJob) -> Result<Job, QueueError> {
        self.inner.ensure_initialized().await?;
        let job = self.inner.store.insert(&new).await?;
        metrics::counter!(JOBS_CREATED, &[("type", job.job_type.clone())]).increment(1);
        Ok(job)
    }

    /// [`Manager::create`], registering per-uid callbacks before returning.
    pub async fn create_with_callbacks(
        &self,
        new: NewJob,
        on_done: Option<EventCallback>,
        on_attempt: Option<EventCallback>,
    ) -> Result<Job, QueueError> {
        let job = self.create(new).await?;
        if let Some(callback) = on_done {
            self.inner.bus.on_done_for(job.uid, callback);
        }
        if let Some(callback) = on_attempt {
            self.inner.bus.on_attempt_for(job.uid, callback);
        }
        Ok(job)
    }

    pub async fn find(&self, uid: Uuid, with_attempts: bool) -> Result<Option<FoundJob>, QueueError> {
        self.inner.ensure_initialized().await?;
        let Some(job) = self.inner.store.find(uid).await? else {
            return Ok(None);
        };
        let attempts = if with_attempts {
            Some(self.inner.store.fetch_attempts(job.id).await?)
        } else {
            None
        };
        Ok(Some(FoundJob { job, attempts }))
    }

    pub async fn fetch_all(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError> {
        self.inner.ensure_initialized().await?;
        self.inner.store.fetch_all(filter).await
    }

    /// Register (or replace) the handler for a job type.
    pub fn set_handler(&self, job_type: impl Into<String>, handler: JobHandler) -> &Self {
        self.inner
            .handlers
            .write()
            .unwrap()
            .insert(job_type.into(), handler);
        self
    }

    pub fn remove_handler(&self, job_type: &str) -> &Self {
        self.inner.handlers.write().unwrap().remove(job_type);
        self
    }

    /// Handler used when no per-type handler matches.
    pub fn set_fallback_handler(&self, handler: JobHandler) -> &Self {
        *self.inner.fallback.write().unwrap() = Some(handler);
        self
    }

    /// Drop every per-type handler and the fallback.
    pub fn reset_handlers(&self) {
        self.inner.handlers.write().unwrap().clear();
        *self.inner.fallback.write().unwrap() = None;
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.read().unwrap().len()
    }

    /// Subscribe to terminal events for a job type (`"*"` for all types).
    pub fn on_done(&self, job_type: &str, callback: EventCallback) -> SubscriptionHandle {
        self.inner.bus.subscribe(
            EventChannel::Done,
            job_type,
            callback,
            self.inner.config.dedupe_subscriptions,
        )
    }

    /// Subscribe to per-attempt events for a job type (`"*"` for all
    /// types). Fired twice per attempt: with the running view after the
    /// claim, and with the row after the transition.
    pub fn on_attempt(&self, job_type: &str, callback: EventCallback) -> SubscriptionHandle {
        self.inner.bus.subscribe(
            EventChannel::Attempt,
            job_type,
            callback,
            self.inner.config.dedupe_subscriptions,
        )
    }

    /// One-shot terminal callback for a specific job. The registration
    /// leaks if the job never reaches a terminal state (for example when
    /// another host crashed mid-run and the row only ever expires).
    pub fn on_done_for(&self, uid: Uuid, callback: EventCallback) {
        self.inner.bus.on_done_for(uid, callback);
    }

    pub fn on_attempt_for(&self, uid: Uuid, callback: EventCallback) {
        self.inner.bus.on_attempt_for(uid, callback);
    }

    /// Move jobs stuck in `running` beyond the configured threshold to
    /// `expired`. Meant to be called periodically by the host; nothing
    /// resurrects expired jobs.
    pub async fn cleanup(&self) -> Result<u64, QueueError> {
        self.inner.ensure_initialized().await?;
        let expired = self
            .inner
            .store
            .mark_expired(self.inner.config.expired_after_minutes)
            .await?;
        if expired > 0 {
            metrics::counter!(JOBS_EXPIRED).increment(expired);
            warn!(expired, "marked stuck running jobs as expired");
        }
        Ok(expired)
    }

    pub async fn health_preview(
        &self,
        since_minutes: i64,
    ) -> Result<Vec<HealthPreviewRow>, QueueError> {
        self.inner.ensure_initialized().await?;
        self.inner.store.health_preview(since_minutes).await
    }

    /// Drop and recreate both tables. All rows are lost.
    pub async fn reset_hard(&self) -> Result<(), QueueError> {
        schema::initialize(self.inner.store.pool(), self.inner.store.tables(), true).await?;
        let _ = self.inner.schema_ready.set(());
        Ok(())
    }

    /// Drop both tables without recreating them.
    pub async fn uninstall(&self) -> Result<(), QueueError> {
        schema::uninstall(self.inner.store.pool(), self.inner.store.tables()).await
    }

    /// Last status observed by the health monitor, or none when probing is
    /// disabled or has not run yet.
    pub fn get_db_health(&self) -> Option<DbHealthStatus> {
        self.health.as_ref().and_then(|monitor| monitor.last_status())
    }

    /// Probe the database right now. Recorded by the monitor (including
    /// transition callbacks) when one is running.
    pub async fn check_db_health(&self) -> DbHealthStatus {
        match &self.health {
            Some(monitor) => monitor.check_now().await,
            None => health::probe(self.inner.store.pool()).await,
        }
    }

    /// Number of jobs currently executing in this process.
    pub fn active_job_count(&self) -> usize {
        self.inner.active.lock().unwrap().len()
    }

    fn register_signal_handler(&self) {
        if !self.inner.config.graceful_shutdown {
            return;
        }
        let mut guard = self.signal_task.lock().unwrap();
        if guard.is_some() {
            return;
        }

        // The handler only flips the shutdown flag; workers drain
        // themselves and the host stays in charge of process exit.
        let shutdown_tx = self.shutdown_tx.clone();
        *guard = Some(tokio::spawn(async move {
            wait_for_termination().await;
            info!("termination signal received, draining workers");
            let _ = shutdown_tx.send(true);
        }));
    }
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(error) => {
            warn!(%error, "failed to install SIGTERM handler");
            drop(tokio::signal::ctrl_c().await);
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    drop(tokio::signal::ctrl_c().await);
}
