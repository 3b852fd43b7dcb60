use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use foreman_protocol::{Event, NewEvent};
use futures_util::FutureExt;
use tokio::sync::{RwLock, watch};
use tracing::{debug, error};

use super::{BusConfig, EventHandler, EventPublisher};
use crate::pattern::matches_event_pattern;

pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

struct SubscriptionEntry {
    id: u64,
    pattern: String,
    handler: Arc<dyn EventHandler>,
}

type Subscriptions = RwLock<Vec<SubscriptionEntry>>;

/// Handle returned by `subscribe`. Dropping it keeps the handler
/// registered; call [`unsubscribe`](Self::unsubscribe) to remove it.
pub struct Subscription {
    id: u64,
    pattern: String,
    subscriptions: Weak<Subscriptions>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .finish()
    }
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Returns false if the bus is gone or the handler was already removed.
    pub async fn unsubscribe(self) -> bool {
        let Some(subscriptions) = self.subscriptions.upgrade() else {
            return false;
        };
        let mut subscriptions = subscriptions.write().await;
        let before = subscriptions.len();
        subscriptions.retain(|entry| entry.id != self.id);
        before != subscriptions.len()
    }
}

/// Counts one spawned handler future until it is dropped.
struct InFlight(Arc<watch::Sender<usize>>);

impl InFlight {
    fn enter(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|n| *n += 1);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// In-memory event bus.
///
/// Each matching handler is spawned on its own task, in registration order,
/// so `publish` never waits for a handler to finish. Failures and panics are
/// logged. The subscription list is snapshotted before
/// delivery, so handlers may publish or subscribe re-entrantly.
pub struct EventBus {
    subscriptions: Arc<Subscriptions>,
    history: Mutex<VecDeque<Event>>,
    capacity: usize,
    next_id: AtomicU64,
    in_flight: Arc<watch::Sender<usize>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(&BusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: &BusConfig) -> Self {
        Self {
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            history: Mutex::new(VecDeque::with_capacity(config.history_capacity.min(1024))),
            capacity: config.history_capacity,
            next_id: AtomicU64::new(1),
            in_flight: Arc::new(watch::channel(0).0),
        }
    }

    pub(crate) fn record(&self, event: &Event) {
        if self.capacity == 0 {
            return;
        }
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        while history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(event.clone());
    }

    /// Record an already-stamped event and hand it to matching handlers.
    pub async fn deliver(&self, event: &Event) -> usize {
        self.record(event);
        self.dispatch(event).await
    }

    /// Hand an already-stamped event to matching handlers without recording
    /// it. Returns how many handlers were started.
    pub async fn dispatch(&self, event: &Event) -> usize {
        let handlers: Vec<(u64, Arc<dyn EventHandler>)> = self
            .subscriptions
            .read()
            .await
            .iter()
            .filter(|entry| matches_event_pattern(&entry.pattern, &event.kind))
            .map(|entry| (entry.id, entry.handler.clone()))
            .collect();

        for (subscription_id, handler) in &handlers {
            let subscription_id = *subscription_id;
            let handler = handler.clone();
            let event = event.clone();
            let guard = InFlight::enter(&self.in_flight);
            tokio::spawn(async move {
                let _guard = guard;
                let (event_id, event_type) = (event.id, event.kind.clone());
                match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(
                        event_id = %event_id,
                        event_type = %event_type,
                        subscription_id,
                        "event handler failed: {:#}",
                        e
                    ),
                    Err(_) => error!(
                        event_id = %event_id,
                        event_type = %event_type,
                        subscription_id,
                        "event handler panicked"
                    ),
                }
            });
        }

        debug!(event_id = %event.id, event_type = %event.kind, handlers = handlers.len(), "event dispatched");
        handlers.len()
    }

    /// Handler futures started and not yet finished.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Resolves once no handler future is running, including those started
    /// by handlers publishing in turn.
    pub async fn wait_idle(&self) {
        let mut rx = self.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Most recent events, oldest first. `None` returns the whole ring.
    pub fn history(&self, limit: Option<usize>) -> Vec<Event> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let skip = limit.map_or(0, |n| history.len().saturating_sub(n));
        history.iter().skip(skip).cloned().collect()
    }

    pub fn clear_history(&self) {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }
}

#[async_trait]
impl EventPublisher for EventBus {
    async fn publish(&self, event: NewEvent) -> Event {
        let event = event.stamp();
        self.deliver(&event).await;
        event
    }

    async fn subscribe(&self, pattern: &str, handler: Arc<dyn EventHandler>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.write().await.push(SubscriptionEntry {
            id,
            pattern: pattern.to_string(),
            handler,
        });
        debug!(subscription_id = id, pattern = %pattern, "subscribed");
        Subscription {
            id,
            pattern: pattern.to_string(),
            subscriptions: Arc::downgrade(&self.subscriptions),
        }
    }

    async fn wait_idle(&self) {
        EventBus::wait_idle(self).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_protocol::EventKind;

    type Seen = Arc<Mutex<Vec<String>>>;

    fn recorder(seen: &Seen, tag: &'static str) -> Arc<dyn EventHandler> {
        let seen = seen.clone();
        Arc::new(move |event: Event| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(format!("{}:{}", tag, event.kind));
                Ok::<(), anyhow::Error>(())
            }
        })
    }

    #[tokio::test]
    async fn test_pattern_routing() {
        let bus = EventBus::default();
        let seen: Seen = Arc::default();
        bus.subscribe("*", recorder(&seen, "all")).await;
        bus.subscribe("task.*", recorder(&seen, "task")).await;
        bus.subscribe("task.completed", recorder(&seen, "exact")).await;

        bus.publish(NewEvent::new(EventKind::TASK_COMPLETED, "test")).await;
        bus.publish(NewEvent::new(EventKind::AGENT_STARTED, "test")).await;
        bus.wait_idle().await;

        assert_eq!(
            *seen.lock().unwrap(),
            [
                "all:task.completed",
                "task:task.completed",
                "exact:task.completed",
                "all:agent.started",
            ]
        );
    }

    #[tokio::test]
    async fn test_publish_stamps_event() {
        let bus = EventBus::default();
        let event = bus
            .publish(
                NewEvent::new("code.file.created", "watcher")
                    .project("p1")
                    .with("path", "src/lib.rs"),
            )
            .await;
        assert_eq!(event.kind, "code.file.created");
        assert_eq!(event.project_id.as_deref(), Some("p1"));
        assert_eq!(event.payload["path"], "src/lib.rs");
        assert_eq!(bus.history(None), vec![event]);
    }

    #[tokio::test]
    async fn test_failing_handlers_do_not_stop_delivery() {
        let bus = EventBus::default();
        let seen: Seen = Arc::default();

        let failing: Arc<dyn EventHandler> =
            Arc::new(|_event: Event| async { Err::<(), _>(anyhow::anyhow!("handler failed")) });
        bus.subscribe("*", failing).await;

        let panicking: Arc<dyn EventHandler> = Arc::new(|event: Event| async move {
            if !event.kind.is_empty() {
                panic!("handler panicked");
            }
            Ok::<(), anyhow::Error>(())
        });
        bus.subscribe("*", panicking).await;
        bus.subscribe("*", recorder(&seen, "ok")).await;

        bus.publish(NewEvent::new("x.y", "test")).await;
        bus.wait_idle().await;
        assert_eq!(*seen.lock().unwrap(), ["ok:x.y"]);
        assert_eq!(bus.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = EventBus::default();
        let seen: Seen = Arc::default();
        let subscription = bus.subscribe("*", recorder(&seen, "a")).await;
        assert_eq!(subscription.pattern(), "*");
        assert_eq!(bus.subscriber_count().await, 1);

        assert!(subscription.unsubscribe().await);
        assert_eq!(bus.publish(NewEvent::new("x.y", "test")).await.kind, "x.y");
        bus.wait_idle().await;
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(bus.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_history_ring_drops_oldest() {
        let bus = EventBus::new(&BusConfig {
            history_capacity: 3,
        });
        for i in 0..5 {
            bus.publish(NewEvent::new(format!("e.{}", i), "test")).await;
        }
        let kinds: Vec<_> = bus.history(None).into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, ["e.2", "e.3", "e.4"]);

        let last: Vec<_> = bus.history(Some(2)).into_iter().map(|e| e.kind).collect();
        assert_eq!(last, ["e.3", "e.4"]);
    }

    #[tokio::test]
    async fn test_reentrant_publish() {
        let bus = Arc::new(EventBus::default());
        let seen: Seen = Arc::default();
        bus.subscribe("done", recorder(&seen, "done")).await;

        let weak = Arc::downgrade(&bus);
        let relay: Arc<dyn EventHandler> = Arc::new(move |_event: Event| {
            let weak = weak.clone();
            async move {
                if let Some(bus) = weak.upgrade() {
                    bus.publish(NewEvent::new("done", "relay")).await;
                    bus.subscribe("late", Arc::new(|_e: Event| async { Ok::<(), anyhow::Error>(()) }))
                        .await;
                }
                Ok::<(), anyhow::Error>(())
            }
        });
        bus.subscribe("start", relay).await;

        bus.publish(NewEvent::new("start", "test")).await;
        bus.wait_idle().await;
        assert_eq!(*seen.lock().unwrap(), ["done:done"]);
        assert_eq!(bus.subscriber_count().await, 3);
    }

    #[tokio::test]
    async fn test_publish_does_not_wait_for_handlers() {
        let bus = EventBus::default();
        let release = Arc::new(tokio::sync::Notify::new());
        let seen: Seen = Arc::default();

        let (gate, s) = (release.clone(), seen.clone());
        let slow: Arc<dyn EventHandler> = Arc::new(move |event: Event| {
            let (gate, s) = (gate.clone(), s.clone());
            async move {
                gate.notified().await;
                s.lock().unwrap().push(event.kind);
                Ok::<(), anyhow::Error>(())
            }
        });
        bus.subscribe("*", slow).await;

        let event = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            bus.publish(NewEvent::new("slow.event", "test")),
        )
        .await
        .expect("publish waited for its handler");
        assert_eq!(bus.history(None), vec![event]);
        assert_eq!(bus.in_flight(), 1);
        assert!(seen.lock().unwrap().is_empty());

        release.notify_one();
        bus.wait_idle().await;
        assert_eq!(*seen.lock().unwrap(), ["slow.event"]);
        assert_eq!(bus.in_flight(), 0);
    }
}
