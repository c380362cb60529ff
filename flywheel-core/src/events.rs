use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::error;
use uuid::Uuid;

use crate::types::Job;

/// Topic that receives every event regardless of job type.
pub const WILDCARD_TOPIC: &str = "*";

/// In-process subscriber callback. Receives a snapshot of the job row as of
/// the event; read `job.status` to tell the phases apart.
pub type EventCallback = Arc<dyn Fn(&Job) + Send + Sync>;

/// The two event channels the executor publishes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventChannel {
    /// Fired twice per physical attempt: once with the running view right
    /// after the claim, once with the post-transition row.
    Attempt,
    /// Fired exactly once, when the job reaches completed or failed.
    Done,
}

struct Subscriber {
    id: u64,
    callback: EventCallback,
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    attempt_topics: Mutex<HashMap<String, Vec<Subscriber>>>,
    done_topics: Mutex<HashMap<String, Vec<Subscriber>>>,
    attempt_by_uid: Mutex<HashMap<Uuid, Vec<EventCallback>>>,
    done_by_uid: Mutex<HashMap<Uuid, Vec<EventCallback>>>,
}

/// Topic-keyed dispatcher for `attempt` and `done` events, plus the per-uid
/// one-shot callback registries. Dispatch happens on the publishing worker's
/// task; callbacks that panic are logged and swallowed so they can never
/// take a worker down.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

/// Returned by `subscribe`; detaches the subscription when consumed. Safe
/// to drop without unsubscribing.
pub struct SubscriptionHandle {
    inner: Weak<BusInner>,
    channel: EventChannel,
    topic: String,
    id: u64,
}

impl SubscriptionHandle {
    pub fn unsubscribe(self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let topics = match self.channel {
            EventChannel::Attempt => &inner.attempt_topics,
            EventChannel::Done => &inner.done_topics,
        };
        let mut topics = topics.lock().unwrap();
        if let Some(subscribers) = topics.get_mut(&self.topic) {
            subscribers.retain(|s| s.id != self.id);
            if subscribers.is_empty() {
                topics.remove(&self.topic);
            }
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `callback` to `topic` on `channel`. With `dedupe`, adding
    /// the same callback (the same `Arc`) to the same topic again returns a
    /// handle to the existing subscription instead of stacking a second one.
    pub fn subscribe(
        &self,
        channel: EventChannel,
        topic: &str,
        callback: EventCallback,
        dedupe: bool,
    ) -> SubscriptionHandle {
        let topics = match channel {
            EventChannel::Attempt => &self.inner.attempt_topics,
            EventChannel::Done => &self.inner.done_topics,
        };
        let mut topics = topics.lock().unwrap();
        let subscribers = topics.entry(topic.to_owned()).or_default();

        if dedupe {
            if let Some(existing) = subscribers
                .iter()
                .find(|s| Arc::ptr_eq(&s.callback, &callback))
            {
                return self.handle(channel, topic, existing.id);
            }
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        subscribers.push(Subscriber { id, callback });
        self.handle(channel, topic, id)
    }

    fn handle(&self, channel: EventChannel, topic: &str, id: u64) -> SubscriptionHandle {
        SubscriptionHandle {
            inner: Arc::downgrade(&self.inner),
            channel,
            topic: topic.to_owned(),
            id,
        }
    }

    /// Register a callback fired for every attempt event of the job with
    /// this uid, until the job reaches a terminal done state.
    pub fn on_attempt_for(&self, uid: Uuid, callback: EventCallback) {
        self.inner
            .attempt_by_uid
            .lock()
            .unwrap()
            .entry(uid)
            .or_default()
            .push(callback);
    }

    /// Register a callback fired once, when the job with this uid reaches a
    /// terminal done state.
    pub fn on_done_for(&self, uid: Uuid, callback: EventCallback) {
        self.inner
            .done_by_uid
            .lock()
            .unwrap()
            .entry(uid)
            .or_default()
            .push(callback);
    }

    pub fn publish_attempt(&self, job: &Job) {
        self.dispatch_topics(&self.inner.attempt_topics, job);

        let callbacks = self
            .inner
            .attempt_by_uid
            .lock()
            .unwrap()
            .get(&job.uid)
            .cloned()
            .unwrap_or_default();
        for callback in callbacks {
            invoke_quietly(&callback, job);
        }
    }

    /// Publish the terminal event and clear both per-uid registries for the
    /// job.
    pub fn publish_done(&self, job: &Job) {
        self.dispatch_topics(&self.inner.done_topics, job);

        let callbacks = self
            .inner
            .done_by_uid
            .lock()
            .unwrap()
            .remove(&job.uid)
            .unwrap_or_default();
        self.inner.attempt_by_uid.lock().unwrap().remove(&job.uid);
        for callback in callbacks {
            invoke_quietly(&callback, job);
        }
    }

    fn dispatch_topics(&self, topics: &Mutex<HashMap<String, Vec<Subscriber>>>, job: &Job) {
        // Clone the callbacks out before invoking, so subscribers are free
        // to (un)subscribe from inside a callback without deadlocking.
        let callbacks: Vec<EventCallback> = {
            let topics = topics.lock().unwrap();
            let mut callbacks: Vec<EventCallback> = topics
                .get(job.job_type.as_str())
                .into_iter()
                .flat_map(|subs| subs.iter().map(|s| s.callback.clone()))
                .collect();
            // The wildcard is never a literal type; a job typed "*" only
            // hits the wildcard subscribers once.
            if job.job_type != WILDCARD_TOPIC {
                if let Some(subs) = topics.get(WILDCARD_TOPIC) {
                    callbacks.extend(subs.iter().map(|s| s.callback.clone()));
                }
            }
            callbacks
        };
        for callback in callbacks {
            invoke_quietly(&callback, job);
        }
    }

    #[cfg(test)]
    fn uid_registry_sizes(&self, uid: Uuid) -> (usize, usize) {
        let attempt = self
            .inner
            .attempt_by_uid
            .lock()
            .unwrap()
            .get(&uid)
            .map_or(0, Vec::len);
        let done = self
            .inner
            .done_by_uid
            .lock()
            .unwrap()
            .get(&uid)
            .map_or(0, Vec::len);
        (attempt, done)
    }
}

fn invoke_quietly(callback: &EventCallback, job: &Job) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(job))) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_owned());
        error!(
            job_type = %job.job_type,
            uid = %job.uid,
            panic = %message,
            "job event subscriber panicked"
        );
    }
}
