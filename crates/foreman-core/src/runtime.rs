use std::sync::Arc;

use foreman_protocol::{Event, NewEvent};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::agent::AgentRegistry;
use crate::assistant::AssistantClient;
use crate::config::Settings;
use crate::error::Result;
use crate::event_bus::{EventPublisher, EventStore, EventTrigger, InMemoryEventStore, PersistentEventBus};
use crate::task::{AgentTaskHandler, TaskProcessor, TaskQueue};

static GLOBAL: OnceCell<Foreman> = OnceCell::const_new();

/// Process-wide instance built from [`Settings::new`] on first use.
pub async fn global() -> Result<&'static Foreman> {
    GLOBAL
        .get_or_try_init(|| async {
            let settings = Settings::new()?;
            Foreman::from_settings(settings).await
        })
        .await
}

/// Every engine component, wired together.
pub struct Foreman {
    settings: Settings,
    bus: Arc<PersistentEventBus>,
    registry: Arc<AgentRegistry>,
    queue: Arc<TaskQueue>,
    processor: Arc<TaskProcessor>,
    handler: Arc<AgentTaskHandler>,
    trigger: Arc<EventTrigger>,
}

impl Foreman {
    pub async fn from_settings(settings: Settings) -> Result<Self> {
        let store: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
        let bus = Arc::new(PersistentEventBus::new(&settings.bus, store));
        let publisher: Arc<dyn EventPublisher> = bus.clone();

        let client = Arc::new(AssistantClient::new(settings.assistant.clone()));
        let registry = Arc::new(AgentRegistry::new(client));
        if let Some(dir) = &settings.agents.directory {
            registry.register_from_dir(dir).await?;
        }

        let queue = Arc::new(TaskQueue::new());
        let processor = Arc::new(TaskProcessor::new(
            queue.clone(),
            settings.processor.clone(),
        ));
        let handler = Arc::new(AgentTaskHandler::new(
            registry.clone(),
            publisher.clone(),
        ));
        processor.register(handler.as_task_handler()).await;

        let trigger = Arc::new(EventTrigger::new(
            publisher,
            registry.clone(),
            queue.clone(),
            settings.trigger.clone(),
        ));

        Ok(Self {
            settings,
            bus,
            registry,
            queue,
            processor,
            handler,
            trigger,
        })
    }

    /// Subscribe the trigger, replay events left unprocessed by a previous
    /// run, then start polling the queue.
    pub async fn start(&self) -> Result<()> {
        self.handler.reopen();
        self.trigger.start().await;

        self.bus.replay_unprocessed().await?;
        self.processor.start().await;
        info!("Foreman started");
        Ok(())
    }

    /// Stop accepting events and polling, cancel agent tasks still running,
    /// then wait for tasks and event handlers to finish.
    pub async fn shutdown(&self) {
        self.trigger.stop().await;
        self.processor.stop_polling().await;

        let cancelled = self.handler.cancel_all(Some("shutting down".to_string()));
        if cancelled > 0 {
            warn!("Cancelled {} running task(s)", cancelled);
        }

        self.processor.drain().await;
        self.bus.wait_idle().await;
        info!("Foreman stopped");
    }

    pub async fn publish(&self, event: NewEvent) -> Event {
        self.bus.publish(event).await
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn bus(&self) -> &Arc<PersistentEventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn processor(&self) -> &Arc<TaskProcessor> {
        &self.processor
    }

    pub fn handler(&self) -> &Arc<AgentTaskHandler> {
        &self.handler
    }

    pub fn trigger(&self) -> &Arc<EventTrigger> {
        &self.trigger
    }
}
