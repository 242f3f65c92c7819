//! Per-document event fan-out.
//!
//! Each document has one topic; each subscriber owns a bounded queue fed
//! with `try_send`, so a slow reader never blocks the publisher or other
//! subscribers. A full queue evicts the subscriber and flags it as lagged;
//! it has to resync from a snapshot.

use dashmap::DashMap;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    require, AccessDecision, AccessGate, ActorId, BroadcastConfig, Capability, CollabEvent,
    DocumentId, EventEnvelope, EventId, EventKind, Result, SessionId, SubscriptionId,
};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub events_published: u64,
    pub deliveries: u64,
    pub denied: u64,
    pub evicted: u64,
    pub active_topics: usize,
}

/// What a single publish did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub sequence: u64,
    pub delivered: usize,
    /// Dropped because the subscriber no longer holds VIEW
    pub denied: usize,
    /// Subscribers evicted for a full queue
    pub evicted: usize,
}

/// Subscription parameters
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Presence session of the subscriber, used to suppress self-echo
    pub session_id: Option<SessionId>,
    /// Streams to receive; empty means all
    pub kinds: Vec<EventKind>,
}

struct Subscriber {
    id: SubscriptionId,
    actor: ActorId,
    session: Option<SessionId>,
    kinds: Option<HashSet<EventKind>>,
    tx: mpsc::Sender<EventEnvelope>,
    cancel: CancellationToken,
    lagged: Arc<AtomicBool>,
}

impl Subscriber {
    fn wants(&self, envelope: &EventEnvelope) -> bool {
        let kind_ok = self
            .kinds
            .as_ref()
            .map(|kinds| kinds.contains(&envelope.event.kind()))
            .unwrap_or(true);
        kind_ok && envelope.delivers_to(self.session)
    }
}

#[derive(Default)]
struct TopicInner {
    sequence: u64,
    subscribers: Vec<Subscriber>,
}

/// Ordered topic for one document
struct Topic {
    inner: Mutex<TopicInner>,
}

/// Receiving end of a topic subscription
pub struct Subscription {
    id: SubscriptionId,
    document_id: DocumentId,
    rx: mpsc::Receiver<EventEnvelope>,
    cancel: CancellationToken,
    lagged: Arc<AtomicBool>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    /// Next event, or `None` once cancelled, evicted or the topic closed
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            event = self.rx.recv() => event,
        }
    }

    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// True once the subscriber was evicted for falling behind
    pub fn is_lagged(&self) -> bool {
        self.lagged.load(Ordering::Acquire)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for Subscription {
    type Item = EventEnvelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Registry of document topics
pub struct EventBroadcaster {
    config: BroadcastConfig,
    gate: Arc<dyn AccessGate>,
    topics: DashMap<DocumentId, Arc<Topic>>,
    published: AtomicU64,
    deliveries: AtomicU64,
    denied: AtomicU64,
    evicted: AtomicU64,
}

impl EventBroadcaster {
    pub fn new(config: BroadcastConfig, gate: Arc<dyn AccessGate>) -> Self {
        Self {
            config,
            gate,
            topics: DashMap::new(),
            published: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    fn topic(&self, document: DocumentId) -> Arc<Topic> {
        self.topics
            .entry(document)
            .or_insert_with(|| {
                Arc::new(Topic {
                    inner: Mutex::new(TopicInner::default()),
                })
            })
            .clone()
    }

    /// Subscribe to a document topic; requires VIEW
    pub fn subscribe(
        &self,
        actor: ActorId,
        document: DocumentId,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        require(self.gate.as_ref(), actor, document, Capability::View)?;

        let (tx, rx) = mpsc::channel(self.config.subscriber_capacity.max(1));
        let cancel = CancellationToken::new();
        let lagged = Arc::new(AtomicBool::new(false));
        let id = SubscriptionId::new();
        let kinds = if options.kinds.is_empty() {
            None
        } else {
            Some(options.kinds.into_iter().collect())
        };

        self.topic(document).inner.lock().subscribers.push(Subscriber {
            id,
            actor,
            session: options.session_id,
            kinds,
            tx,
            cancel: cancel.clone(),
            lagged: lagged.clone(),
        });
        debug!("Actor {} subscribed to document {}", actor, document);

        Ok(Subscription {
            id,
            document_id: document,
            rx,
            cancel,
            lagged,
        })
    }

    pub fn unsubscribe(&self, document: DocumentId, id: SubscriptionId) -> bool {
        let Some(topic) = self.topics.get(&document).map(|t| t.clone()) else {
            return false;
        };
        let mut inner = topic.inner.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|subscriber| {
            if subscriber.id == id {
                subscriber.cancel.cancel();
                false
            } else {
                true
            }
        });
        before != inner.subscribers.len()
    }

    /// Publish an event to every authorized subscriber of the document
    pub fn publish(
        &self,
        document: DocumentId,
        origin_session: Option<SessionId>,
        event: CollabEvent,
    ) -> PublishReport {
        let topic = self.topic(document);
        let mut inner = topic.inner.lock();
        inner.sequence += 1;
        let envelope = EventEnvelope {
            event_id: EventId::new(),
            document_id: document,
            sequence: inner.sequence,
            origin_session,
            emitted_at: chrono::Utc::now(),
            event,
        };
        let mut report = PublishReport {
            sequence: envelope.sequence,
            ..Default::default()
        };

        inner.subscribers.retain(|subscriber| {
            if subscriber.cancel.is_cancelled() || subscriber.tx.is_closed() {
                return false;
            }
            if !subscriber.wants(&envelope) {
                return true;
            }
            if self
                .gate
                .check_access(subscriber.actor, document, Capability::View)
                == AccessDecision::Deny
            {
                debug!(
                    "Dropping event {} for actor {} without VIEW on {}",
                    envelope.sequence, subscriber.actor, document
                );
                report.denied += 1;
                return true;
            }
            match subscriber.tx.try_send(envelope.clone()) {
                Ok(()) => {
                    report.delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "Subscriber {} on document {} fell behind; evicting",
                        subscriber.id, document
                    );
                    subscriber.lagged.store(true, Ordering::Release);
                    subscriber.cancel.cancel();
                    report.evicted += 1;
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        drop(inner);

        self.published.fetch_add(1, Ordering::Relaxed);
        self.deliveries
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.denied.fetch_add(report.denied as u64, Ordering::Relaxed);
        self.evicted
            .fetch_add(report.evicted as u64, Ordering::Relaxed);
        report
    }

    pub fn subscriber_count(&self, document: DocumentId) -> usize {
        self.topics
            .get(&document)
            .map(|topic| {
                topic
                    .inner
                    .lock()
                    .subscribers
                    .iter()
                    .filter(|s| !s.cancel.is_cancelled())
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_published: self.published.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            active_topics: self.topics.len(),
        }
    }
}
