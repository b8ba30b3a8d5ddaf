//! Dual-write event sink: every event is persisted first, then fanned out to
//! the live subscribers of its target.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use dashmap::DashMap;
use pentest_common::{Event, EventKind, Phase};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::db::DbHandle;
use crate::ws::WsMessage;

/// Default number of messages queued per subscriber before it is dropped as lagging.
pub const SUBSCRIBER_BUFFER: usize = 1024;

type SubscriberMap = Arc<DashMap<i64, Vec<Subscriber>>>;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<String>,
}

pub struct EventSink {
    db: DbHandle,
    subscribers: SubscriberMap,
    next_id: AtomicU64,
    buffer: usize,
}

impl EventSink {
    pub fn new(db: DbHandle) -> Self {
        Self::with_buffer(db, SUBSCRIBER_BUFFER)
    }

    /// Sink whose subscribers each queue up to `buffer` undelivered messages.
    pub fn with_buffer(db: DbHandle, buffer: usize) -> Self {
        Self {
            db,
            subscribers: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    pub fn buffer(&self) -> usize {
        self.buffer
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    /// Persist an event and deliver it to the target's live subscribers.
    ///
    /// A persistence failure fails the call and nothing is delivered. Delivery
    /// failures never reach the caller; the failing subscriber is dropped.
    pub async fn record(
        &self,
        target_id: i64,
        phase: Phase,
        kind: EventKind,
        message: impl Into<String>,
        job_id: Option<i64>,
    ) -> Result<Event> {
        let message = message.into();
        let event = self
            .db
            .call(move |db| db.create_event(target_id, job_id, phase, kind, &message))
            .await?;
        self.broadcast(target_id, &WsMessage::from_event(&event));
        Ok(event)
    }

    /// Deliver a live-only message. Returns the number of subscribers reached.
    pub fn broadcast(&self, target_id: i64, msg: &WsMessage) -> usize {
        match serde_json::to_string(msg) {
            Ok(json) => self.deliver(target_id, json),
            Err(e) => {
                warn!(target_id, error = %e, "failed to serialize live message");
                0
            }
        }
    }

    fn deliver(&self, target_id: i64, json: String) -> usize {
        let mut delivered = 0;
        let mut pruned = 0;
        if let Some(mut subs) = self.subscribers.get_mut(&target_id) {
            subs.retain(|sub| match sub.tx.try_send(json.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!(
                        target_id,
                        subscriber = sub.id,
                        undelivered = self.buffer,
                        "live subscriber fell {} messages behind; dropping it \
                         (raise runner.live_buffer for slow viewers)",
                        self.buffer
                    );
                    pruned += 1;
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    pruned += 1;
                    false
                }
            });
        }
        if pruned > 0 {
            debug!(target_id, pruned, "pruned dead subscribers");
            self.subscribers.remove_if(&target_id, |_, subs| subs.is_empty());
        }
        delivered
    }

    /// Register a live subscriber for one target. Dropping the handle unregisters it.
    pub fn subscribe(&self, target_id: i64) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers
            .entry(target_id)
            .or_default()
            .push(Subscriber { id, tx });
        debug!(target_id, subscriber = id, "live subscriber registered");
        Subscription {
            target_id,
            id,
            rx,
            subscribers: self.subscribers.clone(),
        }
    }

    pub fn subscriber_count(&self, target_id: i64) -> usize {
        self.subscribers
            .get(&target_id)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}

/// Receiving half of a live subscription. Yields serialized [`WsMessage`] JSON.
pub struct Subscription {
    target_id: i64,
    id: u64,
    rx: mpsc::Receiver<String>,
    subscribers: SubscriberMap,
}

impl Subscription {
    pub fn target_id(&self) -> i64 {
        self.target_id
    }

    /// Next message, or `None` once the sink has dropped this subscriber.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(mut subs) = self.subscribers.get_mut(&self.target_id) {
            subs.retain(|sub| sub.id != self.id);
        }
        self.subscribers
            .remove_if(&self.target_id, |_, subs| subs.is_empty());
    }
}
