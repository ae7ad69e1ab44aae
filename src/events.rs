//! In-process fan-out of pipeline events.
//!
//! Delivery is synchronous on the emitting task. A subscriber that panics is
//! isolated: the panic is caught and the remaining subscribers still receive
//! the event.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub mod event_type {
    pub const JOB_STARTED: &str = "job_started";
    pub const CHAPTER_CRAWLED: &str = "chapter_crawled";
    pub const CHAPTER_TRANSLATED: &str = "chapter_translated";
    pub const CHAPTER_ERROR: &str = "chapter_error";
    pub const PROGRESS: &str = "progress";
    pub const JOB_COMPLETED: &str = "job_completed";
    pub const JOB_FAILED: &str = "job_failed";
    pub const JOB_CANCELLED: &str = "job_cancelled";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub event_type: String,
    /// Owning job; concurrent runs share one bus without cross-talk.
    pub job_id: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl PipelineEvent {
    pub fn new(event_type: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            job_id: job_id.into(),
            payload: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

pub type SubscriptionId = u64;

type Callback = Arc<dyn Fn(&PipelineEvent) + Send + Sync>;

#[derive(Clone)]
enum Sink {
    Callback(Callback),
    Channel(mpsc::UnboundedSender<PipelineEvent>),
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    job_id: Option<String>,
    sink: Sink,
}

#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receives every event on the bus.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        self.add(None, Sink::Callback(Arc::new(callback)))
    }

    /// Receives only the events of `job_id`.
    pub fn subscribe_job<F>(&self, job_id: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        self.add(Some(job_id.to_owned()), Sink::Callback(Arc::new(callback)))
    }

    /// Streams the events of `job_id`. The subscription ends when the receiver is dropped.
    pub fn subscribe_channel(&self, job_id: &str) -> mpsc::UnboundedReceiver<PipelineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add(Some(job_id.to_owned()), Sink::Channel(tx));
        rx
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.lock();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    pub fn emit(&self, event: PipelineEvent) {
        let targets: Vec<Subscription> = self
            .lock()
            .iter()
            .filter(|s| s.job_id.as_deref().is_none_or(|id| id == event.job_id))
            .cloned()
            .collect();

        let mut closed = Vec::new();
        for sub in targets {
            match &sub.sink {
                Sink::Callback(callback) => {
                    if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                        tracing::warn!(
                            subscription = sub.id,
                            event_type = %event.event_type,
                            "event subscriber panicked; ignoring"
                        );
                    }
                }
                Sink::Channel(tx) => {
                    if tx.send(event.clone()).is_err() {
                        closed.push(sub.id);
                    }
                }
            }
        }

        if !closed.is_empty() {
            self.lock().retain(|s| !closed.contains(&s.id));
        }
    }

    fn add(&self, job_id: Option<String>, sink: Sink) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock().push(Subscription { id, job_id, sink });
        id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
