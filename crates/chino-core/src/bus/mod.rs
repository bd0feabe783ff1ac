//! In-process publish/subscribe bus.
//!
//! Handlers are keyed by event name (or the `*` wildcard) and ordered by
//! (priority, registration order). A publish starts every matching handler in that
//! order, runs them concurrently, and returns once all of them finished or failed.
//! A failing or panicking handler is logged with its owner and never reaches the
//! publisher or its siblings.

pub mod events;

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use futures_util::FutureExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::CoreResult;

pub use events::{
    new_input_id, Event, EventPayload, EventRecord, Interrupt, MemoryFull, ResponseReady,
    SpeechReady, EVENT_VERSION, INTERRUPT, MEMORY_FULL, RESPONSE_READY, SPEECH_READY, SYSTEM_SHUTDOWN,
    WILDCARD,
};

const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Handler ordering. Lower runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High = 0,
    Normal = 1,
    Low = 2,
}

/// Handle returned by `subscribe`; pass it back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SubscriptionId(u64);

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Arc<Event>) -> CoreResult<()>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = CoreResult<()>> + Send + 'static,
{
    async fn handle(&self, event: Arc<Event>) -> CoreResult<()> {
        (self.f)(event).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CoreResult<()>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
    priority: Priority,
    owner: String,
}

impl Subscription {
    // ids are handed out monotonically, so they double as registration order
    fn order_key(&self) -> (Priority, u64) {
        (self.priority, self.id.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub total_subscribers: usize,
    pub events: BTreeMap<String, usize>,
    pub history_size: usize,
}

pub struct EventBus {
    subscribers: DashMap<String, Vec<Subscription>>,
    next_id: AtomicU64,
    history: Mutex<VecDeque<EventRecord>>,
    history_capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(history_capacity: usize) -> Self {
        let history_capacity = history_capacity.max(1);
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
        }
    }

    pub fn subscribe(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
        priority: Priority,
        owner: &str,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subs = self.subscribers.entry(event_type.to_string()).or_default();
        subs.push(Subscription {
            id,
            handler,
            priority,
            owner: owner.to_string(),
        });
        subs.sort_by_key(Subscription::order_key);
        debug!(target: "chino::bus", event = event_type, owner, ?priority, "subscribed");
        id
    }

    /// Remove one registration. Returns `false` when it was not registered.
    pub fn unsubscribe(&self, event_type: &str, id: SubscriptionId) -> bool {
        let removed = match self.subscribers.get_mut(event_type) {
            Some(mut subs) => {
                let before = subs.len();
                subs.retain(|s| s.id != id);
                before != subs.len()
            }
            None => false,
        };
        self.subscribers.remove_if(event_type, |_, subs| subs.is_empty());
        if removed {
            debug!(target: "chino::bus", event = event_type, "unsubscribed");
        }
        removed
    }

    /// Remove every registration made by `owner`, across all events.
    pub fn unsubscribe_all(&self, owner: &str) -> usize {
        let mut removed = 0;
        for mut entry in self.subscribers.iter_mut() {
            let before = entry.len();
            entry.retain(|s| s.owner != owner);
            removed += before - entry.len();
        }
        self.subscribers.retain(|_, subs| !subs.is_empty());
        if removed > 0 {
            info!(target: "chino::bus", owner, removed, "unsubscribed owner");
        }
        removed
    }

    /// Deliver an event and wait for every handler. Returns the number invoked.
    pub async fn publish(&self, event_type: &str, payload: EventPayload) -> usize {
        let event = Arc::new(Event::new(event_type, payload));
        self.record(&event);

        let targets = self.matching(event_type);
        if targets.is_empty() {
            debug!(target: "chino::bus", event = event_type, "no subscribers");
            return 0;
        }

        let count = targets.len();
        debug!(target: "chino::bus", event = event_type, handlers = count, "publishing");
        join_all(
            targets
                .into_iter()
                .map(|sub| Self::invoke(sub, Arc::clone(&event))),
        )
        .await;
        count
    }

    /// `publish` bounded by a deadline. Returns 0 when the deadline passes first.
    pub async fn publish_timeout(
        &self,
        event_type: &str,
        payload: EventPayload,
        timeout: Duration,
    ) -> usize {
        match tokio::time::timeout(timeout, self.publish(event_type, payload)).await {
            Ok(count) => count,
            Err(_) => {
                warn!(target: "chino::bus", event = event_type, ?timeout, "publish timed out");
                0
            }
        }
    }

    async fn invoke(sub: Subscription, event: Arc<Event>) {
        let outcome = AssertUnwindSafe(sub.handler.handle(Arc::clone(&event)))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(
                target: "chino::bus",
                event = %event.name,
                owner = %sub.owner,
                error = %e,
                "handler failed"
            ),
            Err(_) => error!(
                target: "chino::bus",
                event = %event.name,
                owner = %sub.owner,
                "handler panicked"
            ),
        }
    }

    fn matching(&self, event_type: &str) -> Vec<Subscription> {
        let mut targets: Vec<Subscription> = self
            .subscribers
            .get(event_type)
            .map(|subs| subs.value().clone())
            .unwrap_or_default();
        if event_type != WILDCARD {
            if let Some(wild) = self.subscribers.get(WILDCARD) {
                targets.extend(wild.iter().cloned());
            }
        }
        targets.sort_by_key(Subscription::order_key);
        targets
    }

    fn record(&self, event: &Event) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if history.len() == self.history_capacity {
            history.pop_front();
        }
        history.push_back(EventRecord {
            event: event.name.clone(),
            timestamp: event.timestamp,
            payload_kind: event.payload.kind().to_string(),
        });
    }

    /// Most recent `limit` records, oldest first.
    pub fn history(&self, limit: usize) -> Vec<EventRecord> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Subscribers for one event name, or across all names.
    pub fn subscriber_count(&self, event_type: Option<&str>) -> usize {
        match event_type {
            Some(name) => self.subscribers.get(name).map(|s| s.len()).unwrap_or(0),
            None => self.subscribers.iter().map(|e| e.len()).sum(),
        }
    }

    pub fn stats(&self) -> BusStats {
        let events: BTreeMap<String, usize> = self
            .subscribers
            .iter()
            .map(|e| (e.key().clone(), e.len()))
            .collect();
        BusStats {
            total_subscribers: events.values().sum(),
            events,
            history_size: self
                .history
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }

    /// Drop every subscription and the history.
    pub fn reset(&self) {
        self.subscribers.clear();
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!(target: "chino::bus", "bus reset");
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
