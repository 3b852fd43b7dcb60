// Event Bus
//
// In-process publish/subscribe with pattern routing, an optional persistent
// store for replay, and the trigger that turns events into agent tasks.

pub mod bus;
pub mod persistent;
pub mod store;
pub mod trigger;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use foreman_protocol::{Event, NewEvent};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use bus::{EventBus, Subscription};
pub use persistent::PersistentEventBus;
pub use store::{EventStore, InMemoryEventStore};
pub use trigger::{EventTrigger, TriggerConfig, TriggerMatch, TriggerMode, TriggerOutcome};

/// Receives events delivered by a bus.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        (self)(event).await
    }
}

/// Publishing seam shared by the in-memory and persistent buses.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Stamp and record an event, then start every matching handler.
    /// Handlers finish in the background; see [`wait_idle`](Self::wait_idle).
    async fn publish(&self, event: NewEvent) -> Event;

    async fn subscribe(&self, pattern: &str, handler: Arc<dyn EventHandler>) -> Subscription;

    /// Acknowledge that `processed_by` has consumed an event. Buses without
    /// a store have nothing to record.
    async fn mark_processed(&self, _event_id: Uuid, _processed_by: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Wait until every handler started so far has finished.
    async fn wait_idle(&self);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Events kept in the in-memory history ring
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_history_capacity() -> usize {
    bus::DEFAULT_HISTORY_CAPACITY
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
        }
    }
}
