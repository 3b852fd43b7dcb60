use std::sync::Arc;

use async_trait::async_trait;
use foreman_protocol::{Event, NewEvent};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{BusConfig, EventBus, EventHandler, EventPublisher, EventStore, Subscription};

/// Upper bound on events re-delivered by one replay.
const REPLAY_LIMIT: usize = 10_000;

/// Event bus that also writes every event to an [`EventStore`].
///
/// Each event is saved before it is delivered, so consumers can acknowledge
/// it with [`mark_event_processed`](Self::mark_event_processed) from inside
/// their handler. A store failure is logged and never affects delivery.
/// Events no consumer acknowledged are what
/// [`replay_unprocessed`](Self::replay_unprocessed) re-delivers.
pub struct PersistentEventBus {
    bus: EventBus,
    store: Arc<dyn EventStore>,
}

impl PersistentEventBus {
    pub fn new(config: &BusConfig, store: Arc<dyn EventStore>) -> Self {
        Self {
            bus: EventBus::new(config),
            store,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Re-deliver every stored event no consumer has acknowledged. Replayed
    /// events are recorded in the history like fresh ones, but not saved
    /// again.
    pub async fn replay_unprocessed(&self) -> anyhow::Result<usize> {
        let events = self.store.find_unprocessed(REPLAY_LIMIT).await?;
        for event in &events {
            self.bus.deliver(event).await;
        }

        if events.len() == REPLAY_LIMIT {
            warn!("Replay stopped at {} events; the rest are replayed on the next start", REPLAY_LIMIT);
        }
        if !events.is_empty() {
            info!("Replayed {} unprocessed event(s)", events.len());
        }
        Ok(events.len())
    }

    pub async fn mark_event_processed(&self, event_id: Uuid, processed_by: &str) -> anyhow::Result<()> {
        self.store.mark_as_processed(event_id, processed_by).await
    }

    pub async fn recent_events(&self, limit: usize) -> anyhow::Result<Vec<Event>> {
        self.store.find_recent(limit).await
    }

    pub async fn events_by_type(&self, kind: &str, limit: usize) -> anyhow::Result<Vec<Event>> {
        self.store.find_by_type(kind, limit).await
    }

    pub async fn events_by_project(&self, project_id: &str, limit: usize) -> anyhow::Result<Vec<Event>> {
        self.store.find_by_project_id(project_id, limit).await
    }
}

#[async_trait]
impl EventPublisher for PersistentEventBus {
    async fn publish(&self, event: NewEvent) -> Event {
        let event = event.stamp();
        if let Err(e) = self.store.save(&event).await {
            error!("Failed to persist event {} ({}): {}", event.id, event.kind, e);
        }
        self.bus.deliver(&event).await;
        event
    }

    async fn subscribe(&self, pattern: &str, handler: Arc<dyn EventHandler>) -> Subscription {
        self.bus.subscribe(pattern, handler).await
    }

    async fn mark_processed(&self, event_id: Uuid, processed_by: &str) -> anyhow::Result<()> {
        self.mark_event_processed(event_id, processed_by).await
    }

    async fn wait_idle(&self) {
        self.bus.wait_idle().await;
    }
}
