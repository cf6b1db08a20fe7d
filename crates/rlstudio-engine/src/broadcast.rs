//! Live metrics fan-out.
//!
//! The broadcaster keeps a registry of sinks per job and relays every
//! `metrics-update` to them. A subscriber joining mid-run is sent the
//! last-known snapshot from the store before any live update, and each sink
//! only ever sees increasing steps.

use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, EventName, JobRef, MetricsUpdate, TrainingComplete, handler_fn};
use crate::job::{Job, JobId, MetricsSnapshot};
use crate::store::{self, Collection, StateStore, keys};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SinkError {
    /// The receiver is not keeping up; the subscription is dropped.
    #[error("metrics sink is lagging")]
    Lagging,

    /// The receiver went away; the subscription is dropped.
    #[error("metrics sink is closed")]
    Closed,

    #[error("metrics transport failed: {0}")]
    Transport(String),
}

/// Transport handle metrics are pushed to.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn send(&self, metrics: &MetricsSnapshot) -> Result<(), SinkError>;
}

/// Sink backed by a bounded tokio channel. Never waits on a slow receiver.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<MetricsSnapshot>,
}

impl ChannelSink {
    #[must_use]
    pub const fn new(tx: mpsc::Sender<MetricsSnapshot>) -> Self {
        Self { tx }
    }
}

/// Creates a [`ChannelSink`] and the receiver its updates arrive on.
///
/// The receiver yields `None` once the broadcaster has released the
/// subscription and every other clone of the sink is dropped.
#[must_use]
pub fn channel_sink(buffer: usize) -> (ChannelSink, mpsc::Receiver<MetricsSnapshot>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (ChannelSink::new(tx), rx)
}

#[async_trait]
impl MetricsSink for ChannelSink {
    async fn send(&self, metrics: &MetricsSnapshot) -> Result<(), SinkError> {
        self.tx.try_send(metrics.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Lagging,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

/// Handle for one registered sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Delivery {
    sink: Arc<dyn MetricsSink>,
    last_step: Option<u64>,
}

impl Delivery {
    /// Sends `metrics` unless the sink already saw this step or a later one.
    async fn push(&mut self, metrics: &MetricsSnapshot) -> Result<bool, SinkError> {
        if self.last_step.is_some_and(|last| metrics.step <= last) {
            return Ok(false);
        }
        self.sink.send(metrics).await?;
        self.last_step = Some(metrics.step);
        Ok(true)
    }
}

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    delivery: Arc<Mutex<Delivery>>,
}

pub struct MetricsBroadcaster {
    store: Arc<dyn StateStore>,
    subscribers: Mutex<HashMap<JobId, Vec<Subscriber>>>,
    next_id: AtomicU64,
    max_per_job: usize,
}

impl fmt::Debug for MetricsBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsBroadcaster")
            .field("max_per_job", &self.max_per_job)
            .finish_non_exhaustive()
    }
}

impl MetricsBroadcaster {
    pub fn new(store: Arc<dyn StateStore>, max_per_job: usize) -> Self {
        Self {
            store,
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_per_job: max_per_job.max(1),
        }
    }

    /// Wires the broadcaster to the bus: metrics are relayed, and terminal or
    /// stop events release the job's subscriptions.
    pub async fn attach(self: &Arc<Self>, bus: &EventBus) {
        let broadcaster = Arc::clone(self);
        bus.subscribe(
            EventName::MetricsUpdate,
            handler_fn("broadcaster.relay", move |event| {
                let broadcaster = Arc::clone(&broadcaster);
                async move {
                    let update: MetricsUpdate = event.decode()?;
                    broadcaster.relay(&update.job_id, &update.metrics).await;
                    Ok::<(), EngineError>(())
                }
            }),
        )
        .await;

        let broadcaster = Arc::clone(self);
        bus.subscribe(
            EventName::TrainingComplete,
            handler_fn("broadcaster.release-complete", move |event| {
                let broadcaster = Arc::clone(&broadcaster);
                async move {
                    let complete: TrainingComplete = event.decode()?;
                    broadcaster.release(&complete.job_id).await;
                    Ok::<(), EngineError>(())
                }
            }),
        )
        .await;

        let broadcaster = Arc::clone(self);
        bus.subscribe(
            EventName::StopTraining,
            handler_fn("broadcaster.release-stop", move |event| {
                let broadcaster = Arc::clone(&broadcaster);
                async move {
                    let stop: JobRef = event.decode()?;
                    broadcaster.release(&stop.job_id).await;
                    Ok::<(), EngineError>(())
                }
            }),
        )
        .await;
    }

    async fn load_job(&self, job_id: &JobId) -> EngineResult<Job> {
        store::load(self.store.as_ref(), Collection::Training, &keys::job(job_id.as_str()))
            .await?
            .ok_or_else(|| EngineError::not_found("training job", job_id.as_str()))
    }

    /// Registers `sink` for `job_id` and sends it the last-known snapshot.
    ///
    /// Returns `None` when the job had already finished: the final snapshot is
    /// still sent, but nothing is registered.
    pub async fn subscribe(
        &self,
        job_id: &JobId,
        sink: Arc<dyn MetricsSink>,
    ) -> EngineResult<Option<SubscriptionId>> {
        let job = self.load_job(job_id).await?;
        if job.is_terminal() {
            if let Some(snapshot) = job.metrics_snapshot() {
                if let Err(e) = sink.send(&snapshot).await {
                    debug!(job_id = %job_id, error = %e, "Final snapshot not delivered");
                }
            }
            debug!(job_id = %job_id, status = %job.status, "Job already finished, not registering");
            return Ok(None);
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let delivery = Arc::new(Mutex::new(Delivery { sink, last_step: None }));

        // Live relays to this subscriber wait until the snapshot below is sent.
        let mut pending = delivery.lock().await;
        {
            let mut subscribers = self.subscribers.lock().await;
            let entries = subscribers.entry(job_id.clone()).or_default();
            if entries.len() >= self.max_per_job {
                return Err(EngineError::SubscriberLimit {
                    job_id: job_id.to_string(),
                    limit: self.max_per_job,
                });
            }
            entries.push(Subscriber { id, delivery: Arc::clone(&delivery) });
        }

        // Progress written before registration is only visible through the store.
        let current = match self.load_job(job_id).await {
            Ok(job) => job,
            Err(e) => {
                drop(pending);
                self.unsubscribe_one(job_id, id).await;
                return Err(e);
            }
        };
        let mut keep = !current.is_terminal();
        if let Some(snapshot) = current.metrics_snapshot() {
            if let Err(e) = pending.push(&snapshot).await {
                warn!(job_id = %job_id, subscription = %id, error = %e, "Initial snapshot failed");
                keep = false;
            }
        }
        drop(pending);

        if !keep {
            self.unsubscribe_one(job_id, id).await;
            return Ok(None);
        }
        info!(job_id = %job_id, subscription = %id, "Metrics subscriber registered");
        Ok(Some(id))
    }

    /// Pushes `metrics` to every sink registered for `job_id`. Sinks that fail
    /// are deregistered. Returns how many sinks received the update.
    pub async fn relay(&self, job_id: &JobId, metrics: &MetricsSnapshot) -> usize {
        let targets = self.subscribers.lock().await.get(job_id).cloned().unwrap_or_default();
        if targets.is_empty() {
            debug!(job_id = %job_id, step = metrics.step, "No subscribers, dropping metrics");
            return 0;
        }

        let mut delivered = 0;
        let mut dead = Vec::new();
        for subscriber in targets {
            let mut delivery = subscriber.delivery.lock().await;
            match delivery.push(metrics).await {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        job_id = %job_id,
                        subscription = %subscriber.id,
                        error = %e,
                        "Metrics sink failed, deregistering"
                    );
                    dead.push(subscriber.id);
                }
            }
        }
        for id in dead {
            self.unsubscribe_one(job_id, id).await;
        }
        delivered
    }

    /// Removes one subscription. Returns whether it was registered.
    pub async fn unsubscribe_one(&self, job_id: &JobId, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock().await;
        let Some(entries) = subscribers.get_mut(job_id) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|s| s.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            subscribers.remove(job_id);
        }
        removed
    }

    /// Removes every subscription of `job_id`, returning how many there were.
    pub async fn unsubscribe(&self, job_id: &JobId) -> usize {
        self.subscribers.lock().await.remove(job_id).map_or(0, |entries| entries.len())
    }

    /// Drops the job's subscriptions once it reached a terminal state.
    ///
    /// Terminal and metrics events travel on separate queues, so each sink is
    /// first sent the stored final snapshot unless it has already seen that step.
    pub async fn release(&self, job_id: &JobId) {
        let Some(entries) = self.subscribers.lock().await.remove(job_id) else {
            return;
        };

        let last = match self.load_job(job_id).await {
            Ok(job) => job.metrics_snapshot(),
            Err(e) => {
                debug!(job_id = %job_id, error = %e, "No final snapshot for released job");
                None
            }
        };
        if let Some(snapshot) = last {
            for subscriber in &entries {
                let mut delivery = subscriber.delivery.lock().await;
                if let Err(e) = delivery.push(&snapshot).await {
                    debug!(job_id = %job_id, subscription = %subscriber.id, error = %e, "Final snapshot not delivered");
                }
            }
        }
        info!(job_id = %job_id, released = entries.len(), "Released metrics subscribers");
    }

    pub async fn subscriber_count(&self, job_id: &JobId) -> usize {
        self.subscribers.lock().await.get(job_id).map_or(0, Vec::len)
    }
}
