//! Event bus for inter-agent communication
//!
//! The EventBus provides a pub/sub pattern for the coordinator, the
//! training controller, and worker agents to communicate without tight
//! coupling. Subscribers register async handlers per event kind (or a
//! wildcard); `publish` invokes every matching handler concurrently and
//! resolves only once all of them have settled.
//!
//! Delivery rules:
//! - a subscriber never receives an event it published itself
//! - a targeted event is delivered only to its target subscriber
//! - the subscription filter must accept the event kind
//!
//! Delivery is at-most-once, best-effort, and in-memory only. A bounded
//! history ring keeps the most recent events for diagnostics and replay
//! inspection; it is never used for redelivery.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use sdk::subscriber::EventHandler;
use sdk::types::{AgentId, Event, EventFilter, EventKind};

/// Number of events retained in the diagnostic history ring
pub const HISTORY_CAPACITY: usize = 1000;

/// One registered subscription
struct Subscription {
    id: Uuid,
    subscriber_id: AgentId,
    filter: EventFilter,
    handler: Arc<dyn EventHandler>,
}

impl Subscription {
    /// Whether this subscription should receive the given event
    fn matches(&self, event: &Event) -> bool {
        if self.subscriber_id == event.source {
            return false;
        }
        if let Some(target) = &event.target {
            if *target != self.subscriber_id {
                return false;
            }
        }
        self.filter.matches(event.kind)
    }
}

/// Pub/sub broker for events between agents
///
/// Shared via `Arc`; all interior state is behind async locks so the
/// bus can be used from the coordinator, the training controller, and
/// worker tasks running on a multi-threaded runtime.
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    history: RwLock<VecDeque<Event>>,
}

impl EventBus {
    /// Create a new EventBus
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            history: RwLock::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    /// Register a handler for events matching `filter`
    ///
    /// Returns the subscription id, which can later be passed to
    /// [`unsubscribe`](Self::unsubscribe).
    pub async fn subscribe(
        &self,
        subscriber_id: impl Into<AgentId>,
        filter: EventFilter,
        handler: Arc<dyn EventHandler>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let subscriber_id = subscriber_id.into();
        debug!(subscriber = %subscriber_id, ?filter, "registering subscription");
        self.subscriptions.write().await.push(Subscription {
            id,
            subscriber_id,
            filter,
            handler,
        });
        id
    }

    /// Remove a single subscription; returns whether it existed
    pub async fn unsubscribe(&self, subscription_id: Uuid) -> bool {
        let mut subs = self.subscriptions.write().await;
        let before = subs.len();
        subs.retain(|s| s.id != subscription_id);
        subs.len() != before
    }

    /// Remove every subscription owned by `subscriber_id`; returns the
    /// number removed
    pub async fn unsubscribe_all(&self, subscriber_id: &str) -> usize {
        let mut subs = self.subscriptions.write().await;
        let before = subs.len();
        subs.retain(|s| s.subscriber_id != subscriber_id);
        before - subs.len()
    }

    /// Publish an event to all matching subscribers
    ///
    /// Handlers run concurrently; `publish` returns once every handler
    /// has settled. A handler error is logged and does not abort
    /// delivery to the other subscribers.
    pub async fn publish(&self, event: Event) {
        // Snapshot matching handlers so no lock is held across awaits.
        let matched: Vec<(AgentId, Arc<dyn EventHandler>)> = {
            let subs = self.subscriptions.read().await;
            subs.iter()
                .filter(|s| s.matches(&event))
                .map(|s| (s.subscriber_id.clone(), Arc::clone(&s.handler)))
                .collect()
        };

        debug!(
            kind = ?event.kind,
            source = %event.source,
            target = ?event.target,
            subscribers = matched.len(),
            "publishing event"
        );

        let deliveries = matched.into_iter().map(|(subscriber_id, handler)| {
            let event = event.clone();
            async move {
                if let Err(e) = handler.handle(event).await {
                    warn!(subscriber = %subscriber_id, error = %e, "event handler failed");
                }
            }
        });
        futures::future::join_all(deliveries).await;

        let mut history = self.history.write().await;
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Most recent events, newest first, up to `count`
    pub async fn recent_events(&self, count: usize) -> Vec<Event> {
        let history = self.history.read().await;
        history.iter().rev().take(count).cloned().collect()
    }

    /// Most recent events of one kind, newest first, up to `count`
    pub async fn recent_events_of_kind(&self, kind: EventKind, count: usize) -> Vec<Event> {
        let history = self.history.read().await;
        history
            .iter()
            .rev()
            .filter(|e| e.kind == kind)
            .take(count)
            .cloned()
            .collect()
    }

    /// Most recent events visible to one subscriber (published by it,
    /// addressed to it, or broadcast), newest first, up to `count`
    pub async fn recent_events_for(&self, subscriber_id: &str, count: usize) -> Vec<Event> {
        let history = self.history.read().await;
        history
            .iter()
            .rev()
            .filter(|e| {
                e.source == subscriber_id
                    || match &e.target {
                        Some(t) => t == subscriber_id,
                        None => true,
                    }
            })
            .take(count)
            .cloned()
            .collect()
    }

    /// Number of live subscriptions
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
