use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_protocol::Event;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Event Store trait for persistence
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist a stamped event (initially unprocessed)
    async fn save(&self, event: &Event) -> Result<()>;

    /// Unprocessed events, oldest first
    async fn find_unprocessed(&self, limit: usize) -> Result<Vec<Event>>;

    async fn mark_as_processed(&self, event_id: Uuid, processed_by: &str) -> Result<()>;

    /// Events of one type, newest first
    async fn find_by_type(&self, kind: &str, limit: usize) -> Result<Vec<Event>>;

    /// Events of one project, newest first
    async fn find_by_project_id(&self, project_id: &str, limit: usize) -> Result<Vec<Event>>;

    /// Newest first
    async fn find_recent(&self, limit: usize) -> Result<Vec<Event>>;
}

#[derive(Debug, Clone)]
struct StoredEvent {
    event: Event,
    processed_by: Option<String>,
    processed_at: Option<DateTime<Utc>>,
}

/// Process-local store, mainly for tests and single-node setups.
#[derive(Default)]
pub struct InMemoryEventStore {
    events: RwLock<Vec<StoredEvent>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }

    /// Who marked `event_id` processed, and when.
    pub async fn processed_info(&self, event_id: Uuid) -> Option<(String, DateTime<Utc>)> {
        let events = self.events.read().await;
        let stored = events.iter().find(|s| s.event.id == event_id)?;
        Some((stored.processed_by.clone()?, stored.processed_at?))
    }

    async fn newest_where<F>(&self, limit: usize, predicate: F) -> Vec<Event>
    where
        F: Fn(&Event) -> bool,
    {
        self.events
            .read()
            .await
            .iter()
            .rev()
            .filter(|s| predicate(&s.event))
            .take(limit)
            .map(|s| s.event.clone())
            .collect()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn save(&self, event: &Event) -> Result<()> {
        let mut events = self.events.write().await;
        if events.iter().any(|s| s.event.id == event.id) {
            bail!("event {} already stored", event.id);
        }
        events.push(StoredEvent {
            event: event.clone(),
            processed_by: None,
            processed_at: None,
        });
        Ok(())
    }

    async fn find_unprocessed(&self, limit: usize) -> Result<Vec<Event>> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|s| s.processed_at.is_none())
            .take(limit)
            .map(|s| s.event.clone())
            .collect())
    }

    async fn mark_as_processed(&self, event_id: Uuid, processed_by: &str) -> Result<()> {
        let mut events = self.events.write().await;
        let Some(stored) = events.iter_mut().find(|s| s.event.id == event_id) else {
            bail!("event {} not found", event_id);
        };
        stored.processed_by = Some(processed_by.to_string());
        stored.processed_at = Some(Utc::now());
        Ok(())
    }

    async fn find_by_type(&self, kind: &str, limit: usize) -> Result<Vec<Event>> {
        Ok(self.newest_where(limit, |e| e.kind == kind).await)
    }

    async fn find_by_project_id(&self, project_id: &str, limit: usize) -> Result<Vec<Event>> {
        Ok(self
            .newest_where(limit, |e| e.project_id.as_deref() == Some(project_id))
            .await)
    }

    async fn find_recent(&self, limit: usize) -> Result<Vec<Event>> {
        Ok(self.newest_where(limit, |_| true).await)
    }
}
