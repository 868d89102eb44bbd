//! Per-request fan-out of bus events to attached streaming clients.
//!
//! The registry is process-local; cross-host delivery is the bus's job.
//! The map lock only guards membership: sends happen on sender clones
//! collected under the lock and executed outside it, so one slow
//! subscriber never blocks workers or its neighbours.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::{Envelope, EventBus, EventType};
use crate::error::KilnError;
use crate::store::Store;

/// Events buffered per subscriber before it is considered stuck.
const SUBSCRIBER_BUFFER: usize = 32;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Envelope>,
    heartbeat: CancellationToken,
}

/// One attached client's end of the stream.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    rx: mpsc::Receiver<Envelope>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

pub struct SubscriptionRegistry {
    buckets: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
    store: Arc<Store>,
    heartbeat_interval: Duration,
}

impl SubscriptionRegistry {
    pub fn new(store: Arc<Store>, heartbeat_interval: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            store,
            heartbeat_interval,
        }
    }

    /// Attach a subscriber to a request's stream.
    ///
    /// Immediately delivers `task:init` with the current snapshot (one
    /// consistent store read: live events may supersede it right away),
    /// then installs a per-subscriber heartbeat.
    pub async fn attach(self: &Arc<Self>, request_id: &str) -> Result<Subscription, KilnError> {
        let snapshot = self
            .store
            .request_snapshot(request_id)
            .await?
            .ok_or_else(|| KilnError::NotFound("request".to_string()))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let heartbeat = CancellationToken::new();

        let init = Envelope::new(
            request_id,
            EventType::TaskInit,
            serde_json::to_value(&snapshot)
                .map_err(|e| KilnError::Parse(format!("snapshot serialization: {e}")))?,
        );
        // Fresh channel: the snapshot always fits.
        let _ = tx.try_send(init);

        {
            let mut buckets = self.buckets.lock().expect("registry lock poisoned");
            buckets.entry(request_id.to_string()).or_default().push(Subscriber {
                id,
                tx: tx.clone(),
                heartbeat: heartbeat.clone(),
            });
        }

        self.spawn_heartbeat(request_id.to_string(), id, tx, heartbeat);

        tracing::debug!(request_id, subscriber = id, "subscriber attached");
        Ok(Subscription { id, rx })
    }

    /// Remove one subscriber; its heartbeat task stops with it.
    pub fn detach(&self, request_id: &str, subscriber_id: u64) {
        let mut buckets = self.buckets.lock().expect("registry lock poisoned");
        if let Some(subs) = buckets.get_mut(request_id) {
            if let Some(pos) = subs.iter().position(|s| s.id == subscriber_id) {
                let sub = subs.remove(pos);
                sub.heartbeat.cancel();
            }
            if subs.is_empty() {
                buckets.remove(request_id);
            }
        }
    }

    pub fn subscriber_count(&self, request_id: &str) -> usize {
        let buckets = self.buckets.lock().expect("registry lock poisoned");
        buckets.get(request_id).map_or(0, Vec::len)
    }

    /// Fan one bus event out to the matching bucket. Failed sends (full or
    /// closed) remove the subscriber; failures are isolated per subscriber.
    pub fn dispatch(&self, event: &Envelope) {
        let targets: Vec<(u64, mpsc::Sender<Envelope>)> = {
            let buckets = self.buckets.lock().expect("registry lock poisoned");
            match buckets.get(&event.task_id) {
                Some(subs) => subs.iter().map(|s| (s.id, s.tx.clone())).collect(),
                None => return,
            }
        };

        for (id, tx) in targets {
            if tx.try_send(event.clone()).is_err() {
                tracing::debug!(
                    request_id = event.task_id,
                    subscriber = id,
                    "send failed, removing subscriber"
                );
                self.detach(&event.task_id, id);
            }
        }
    }

    /// Pump bus messages into the registry until shutdown.
    pub fn spawn_pump(
        self: &Arc<Self>,
        bus: &dyn EventBus,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let mut rx = bus.subscribe();
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(event) => registry.dispatch(&event),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            // Best-effort channel: clients resync from task:init.
                            tracing::warn!(dropped = n, "registry lagged behind the bus");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    fn spawn_heartbeat(
        self: &Arc<Self>,
        request_id: String,
        subscriber_id: u64,
        tx: mpsc::Sender<Envelope>,
        token: CancellationToken,
    ) {
        let registry = self.clone();
        let period = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // first tick is immediate: skip it
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if tx.try_send(Envelope::heartbeat(&request_id)).is_err() {
                            registry.detach(&request_id, subscriber_id);
                            break;
                        }
                    }
                }
            }
        });
    }
}
