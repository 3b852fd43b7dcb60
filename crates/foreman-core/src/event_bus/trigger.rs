use std::sync::{Arc, Weak};

use foreman_protocol::{
    AgentExecutionContext, AgentExecutionResult, CreateTask, Event, EventKind, NewEvent, Task,
    task_metadata,
};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::{EventPublisher, Subscription};
use crate::agent::{Agent, AgentRegistry, AgentRunOptions};
use crate::error::Result;
use crate::task::TaskQueue;

/// `source` of every event the trigger publishes.
pub const SOURCE: &str = "event-trigger";

/// Project used when the triggering event carries none.
pub const DEFAULT_PROJECT: &str = "default";

/// What `trigger` does with the agents an event matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Queue one task per matched agent
    #[default]
    CreateTasks,
    /// Run matched agents immediately
    AutoExecute,
    /// Report matches without side effects
    MatchOnly,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default)]
    pub mode: TriggerMode,

    /// Priority of created tasks
    #[serde(default)]
    pub default_priority: i32,

    /// Used when the event payload has no `cwd`
    #[serde(default)]
    pub default_working_directory: Option<String>,
}

#[derive(Clone)]
pub struct TriggerMatch {
    pub agent: Arc<Agent>,
    pub action: String,
}

impl std::fmt::Debug for TriggerMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerMatch")
            .field("agent", &self.agent.id())
            .field("action", &self.action)
            .finish()
    }
}

#[derive(Debug)]
pub enum TriggerOutcome {
    /// System lifecycle event, never routed to agents
    Ignored,
    Matched(Vec<TriggerMatch>),
    TasksCreated(Vec<Task>),
    /// `(agent id, result)` per executed agent
    Executed(Vec<(String, AgentExecutionResult)>),
}

impl TriggerOutcome {
    /// Number of agents the event reached.
    pub fn len(&self) -> usize {
        match self {
            TriggerOutcome::Ignored => 0,
            TriggerOutcome::Matched(matches) => matches.len(),
            TriggerOutcome::TasksCreated(tasks) => tasks.len(),
            TriggerOutcome::Executed(results) => results.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Event Trigger
///
/// Watches every event on the bus and hands non-lifecycle events to the
/// agents whose triggers match them.
pub struct EventTrigger {
    publisher: Arc<dyn EventPublisher>,
    registry: Arc<AgentRegistry>,
    queue: Arc<TaskQueue>,
    config: TriggerConfig,
    subscription: Mutex<Option<Subscription>>,
}

impl EventTrigger {
    pub fn new(
        publisher: Arc<dyn EventPublisher>,
        registry: Arc<AgentRegistry>,
        queue: Arc<TaskQueue>,
        config: TriggerConfig,
    ) -> Self {
        Self {
            publisher,
            registry,
            queue,
            config,
            subscription: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.config
    }

    /// Subscribe to every event on the bus. Each event is acknowledged as
    /// processed by [`SOURCE`] once the trigger has acted on it; an event whose
    /// handling failed stays unprocessed for replay.
    pub async fn start(self: &Arc<Self>) {
        let mut subscription = self.subscription.lock().await;
        if subscription.is_some() {
            warn!("Event trigger already running");
            return;
        }

        // The bus must not keep the trigger alive
        let trigger: Weak<Self> = Arc::downgrade(self);
        let handler = move |event: Event| {
            let trigger = trigger.clone();
            async move {
                let Some(trigger) = trigger.upgrade() else {
                    return Ok(());
                };
                trigger.trigger(&event).await?;
                if let Err(e) = trigger.publisher.mark_processed(event.id, SOURCE).await {
                    warn!("Failed to mark event {} processed: {}", event.id, e);
                }
                Ok::<(), anyhow::Error>(())
            }
        };

        *subscription = Some(self.publisher.subscribe("*", Arc::new(handler)).await);
        info!("Event trigger started (mode: {:?})", self.config.mode);
    }

    pub async fn stop(&self) {
        let Some(subscription) = self.subscription.lock().await.take() else {
            warn!("Event trigger is not running");
            return;
        };
        subscription.unsubscribe().await;
        info!("Event trigger stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.subscription.lock().await.is_some()
    }

    /// Agents triggered by `event`, each with the action of its first
    /// matching trigger. Empty for system lifecycle events.
    pub async fn triggered_agents(&self, event: &Event) -> Vec<TriggerMatch> {
        if EventKind::is_system(&event.kind) {
            return Vec::new();
        }

        self.registry
            .find_agents_for_event(event)
            .await
            .into_iter()
            .filter_map(|agent| {
                let action = agent.matching_trigger(&event.kind)?.action.clone();
                Some(TriggerMatch { agent, action })
            })
            .collect()
    }

    pub async fn trigger(&self, event: &Event) -> Result<TriggerOutcome> {
        if EventKind::is_system(&event.kind) {
            return Ok(TriggerOutcome::Ignored);
        }

        let matches = self.triggered_agents(event).await;
        if matches.is_empty() {
            return Ok(TriggerOutcome::Matched(matches));
        }

        info!(
            "Event {} ({}) matched {} agent(s)",
            event.id,
            event.kind,
            matches.len()
        );

        match self.config.mode {
            TriggerMode::MatchOnly => Ok(TriggerOutcome::Matched(matches)),
            TriggerMode::CreateTasks => {
                let mut tasks = Vec::with_capacity(matches.len());
                for m in &matches {
                    tasks.push(self.create_task(event, m).await?);
                }
                Ok(TriggerOutcome::TasksCreated(tasks))
            }
            TriggerMode::AutoExecute => Ok(TriggerOutcome::Executed(
                self.execute_matches(event, &matches).await,
            )),
        }
    }

    async fn create_task(&self, event: &Event, m: &TriggerMatch) -> Result<Task> {
        let project_id = event
            .project_id
            .clone()
            .unwrap_or_else(|| DEFAULT_PROJECT.to_string());
        let workspace_id = event
            .workspace_id
            .clone()
            .unwrap_or_else(|| project_id.clone());

        let input = CreateTask::new(project_id, format!("{}: {}", m.action, event.kind))
            .with_agent(m.agent.id())
            .with_priority(self.config.default_priority)
            .with_metadata(task_metadata::MESSAGE, build_message(event, &m.action))
            .with_metadata(task_metadata::CWD, self.working_directory(event))
            .with_metadata(task_metadata::WORKSPACE_ID, workspace_id.clone())
            .with_metadata(task_metadata::EVENT_ID, event.id.to_string())
            .with_metadata(
                task_metadata::CONTEXT,
                serde_json::to_value(event).unwrap_or(Value::Null),
            );
        let task = self.queue.create(input).await?;

        info!(
            "Agent '{}' triggered by {} ({}), task {}",
            m.agent.id(),
            event.kind,
            m.action,
            task.id
        );

        self.publisher
            .publish(
                NewEvent::new(EventKind::TASK_CREATED, SOURCE)
                    .project(task.project_id.clone())
                    .workspace(workspace_id)
                    .payload(json!({
                        "taskId": task.id.to_string(),
                        "agentId": m.agent.id(),
                        "title": task.title,
                        "eventId": event.id.to_string(),
                    })),
            )
            .await;

        Ok(task)
    }

    async fn execute_matches(
        &self,
        event: &Event,
        matches: &[TriggerMatch],
    ) -> Vec<(String, AgentExecutionResult)> {
        let project_id = event
            .project_id
            .clone()
            .unwrap_or_else(|| DEFAULT_PROJECT.to_string());
        let context = AgentExecutionContext {
            workspace_id: event
                .workspace_id
                .clone()
                .unwrap_or_else(|| project_id.clone()),
            project_id,
            working_directory: self.working_directory(event),
            task_id: None,
            event_id: Some(event.id),
        };

        let runs = matches.iter().map(|m| {
            let context = &context;
            async move {
                let message = build_message(event, &m.action);
                let result = m
                    .agent
                    .execute(&message, context, AgentRunOptions::default())
                    .await;
                if !result.success {
                    error!(
                        "Agent '{}' failed on event {}: {}",
                        m.agent.id(),
                        event.id,
                        result.error.as_deref().unwrap_or("unknown error")
                    );
                }
                (m.agent.id().to_string(), result)
            }
        });
        join_all(runs).await
    }

    fn working_directory(&self, event: &Event) -> String {
        event
            .payload
            .get("cwd")
            .and_then(Value::as_str)
            .filter(|cwd| !cwd.is_empty())
            .map(str::to_string)
            .or_else(|| self.config.default_working_directory.clone())
            .unwrap_or_else(|| ".".to_string())
    }
}

/// Prompt handed to an agent triggered by `event`.
fn build_message(event: &Event, action: &str) -> String {
    let payload = serde_json::to_string_pretty(&event.payload).unwrap_or_else(|_| "{}".to_string());
    format!(
        "Action: {action}\n\n\
         Event type: {kind}\n\
         Source: {source}\n\
         Project: {project}\n\n\
         Payload:\n{payload}\n\n\
         Perform the \"{action}\" action for this event and report what you did.",
        kind = event.kind,
        source = event.source,
        project = event.project_id.as_deref().unwrap_or(DEFAULT_PROJECT),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::{AssistantClient, AssistantConfig};
    use crate::event_bus::{BusConfig, EventBus};
    use foreman_protocol::{AgentDefinition, TaskFilter, Trigger, TrustLevel};

    struct Fixture {
        bus: Arc<EventBus>,
        queue: Arc<TaskQueue>,
        trigger: Arc<EventTrigger>,
    }

    fn definition(id: &str, triggers: &[(&str, &str)]) -> AgentDefinition {
        AgentDefinition {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            triggers: triggers.iter().map(|(e, a)| Trigger::new(*e, *a)).collect(),
            trust_level: TrustLevel::Low,
            max_turns: 3,
            allowed_tools: None,
            context: None,
            system_prompt: "You help.".to_string(),
        }
    }

    async fn fixture(mode: TriggerMode, agents: Vec<AgentDefinition>) -> Fixture {
        let config = AssistantConfig {
            program: "/nonexistent/foreman-assistant".to_string(),
            ..Default::default()
        };
        let registry = Arc::new(AgentRegistry::new(Arc::new(AssistantClient::new(config))));
        for agent in agents {
            registry.register_agent(agent).await.unwrap();
        }
        let bus = Arc::new(EventBus::new(&BusConfig::default()));
        let queue = Arc::new(TaskQueue::new());
        let trigger = Arc::new(EventTrigger::new(
            bus.clone(),
            registry,
            queue.clone(),
            TriggerConfig {
                mode,
                default_priority: 2,
                default_working_directory: None,
            },
        ));
        Fixture { bus, queue, trigger }
    }

    fn code_event() -> Event {
        NewEvent::new("code.file.changed", "watcher")
            .project("proj")
            .with("path", "src/lib.rs")
            .with("cwd", "/work/proj")
            .stamp()
    }

    #[tokio::test]
    async fn test_creates_one_task_per_match() {
        let f = fixture(
            TriggerMode::CreateTasks,
            vec![definition("reviewer", &[("code.*", "review")])],
        )
        .await;

        let outcome = f.trigger.trigger(&code_event()).await.unwrap();
        let tasks = match outcome {
            TriggerOutcome::TasksCreated(tasks) => tasks,
            other => panic!("expected tasks, got {:?}", other),
        };
        assert_eq!(tasks.len(), 1);

        let task = &tasks[0];
        assert_eq!(task.agent_id.as_deref(), Some("reviewer"));
        assert_eq!(task.project_id, "proj");
        assert_eq!(task.priority, 2);
        assert_eq!(task.title, "review: code.file.changed");
        let message = task.metadata_str(task_metadata::MESSAGE).unwrap();
        assert!(message.starts_with("Action: review"));
        assert!(message.contains("Event type: code.file.changed"));
        assert!(message.contains("\"path\": \"src/lib.rs\""));
        assert_eq!(task.metadata_str(task_metadata::CWD), Some("/work/proj"));
        assert_eq!(task.metadata_str(task_metadata::WORKSPACE_ID), Some("proj"));
        assert!(task.metadata.contains_key(task_metadata::CONTEXT));

        // task.created is announced
        let kinds: Vec<_> = f.bus.history(None).into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, [EventKind::TASK_CREATED]);
    }

    #[tokio::test]
    async fn test_first_trigger_supplies_action() {
        let f = fixture(
            TriggerMode::MatchOnly,
            vec![
                definition("a", &[("code.*", "review"), ("*", "observe")]),
                definition("b", &[("docs.*", "write"), ("*", "observe")]),
                definition("c", &[("docs.*", "write")]),
            ],
        )
        .await;

        let matches = f.trigger.triggered_agents(&code_event()).await;
        let pairs: Vec<_> = matches
            .iter()
            .map(|m| (m.agent.id().to_string(), m.action.clone()))
            .collect();
        assert_eq!(
            pairs,
            [
                ("a".to_string(), "review".to_string()),
                ("b".to_string(), "observe".to_string())
            ]
        );

        let outcome = f.trigger.trigger(&code_event()).await.unwrap();
        assert!(matches!(outcome, TriggerOutcome::Matched(ref m) if m.len() == 2));
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_system_events_are_ignored() {
        let f = fixture(
            TriggerMode::CreateTasks,
            vec![definition("everything", &[("*", "observe")])],
        )
        .await;

        for kind in [EventKind::TASK_COMPLETED, EventKind::AGENT_PROGRESS] {
            let event = NewEvent::new(kind, "test").stamp();
            assert!(f.trigger.triggered_agents(&event).await.is_empty());
            let outcome = f.trigger.trigger(&event).await.unwrap();
            assert!(matches!(outcome, TriggerOutcome::Ignored));
        }
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_cwd_falls_back_to_default() {
        let registry = Arc::new(AgentRegistry::new(Arc::new(AssistantClient::new(
            AssistantConfig::default(),
        ))));
        registry
            .register_agent(definition("r", &[("build.*", "fix")]))
            .await
            .unwrap();
        let queue = Arc::new(TaskQueue::new());
        let trigger = EventTrigger::new(
            Arc::new(EventBus::new(&BusConfig::default())),
            registry,
            queue.clone(),
            TriggerConfig {
                default_working_directory: Some("/srv/repo".to_string()),
                ..Default::default()
            },
        );

        let event = NewEvent::new("build.failed", "ci").stamp();
        trigger.trigger(&event).await.unwrap();

        let tasks = queue.list(&TaskFilter::default()).await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].project_id, DEFAULT_PROJECT);
        assert_eq!(tasks[0].metadata_str(task_metadata::CWD), Some("/srv/repo"));
    }

    #[tokio::test]
    async fn test_auto_execute_collects_results() {
        let f = fixture(
            TriggerMode::AutoExecute,
            vec![
                definition("a", &[("code.*", "review")]),
                definition("b", &[("code.file.*", "lint")]),
            ],
        )
        .await;

        let outcome = f.trigger.trigger(&code_event()).await.unwrap();
        let results = match outcome {
            TriggerOutcome::Executed(results) => results,
            other => panic!("expected executions, got {:?}", other),
        };
        let ids: Vec<_> = results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        // The assistant program does not exist
        assert!(results.iter().all(|(_, r)| !r.success && r.error.is_some()));
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_start_stop_routes_bus_events() {
        let f = fixture(
            TriggerMode::CreateTasks,
            vec![definition("reviewer", &[("code.*", "review")])],
        )
        .await;

        f.trigger.start().await;
        f.trigger.start().await;
        assert!(f.trigger.is_running().await);
        assert_eq!(f.bus.subscriber_count().await, 1);

        f.bus.publish(NewEvent::new("code.changed", "test")).await;
        f.bus
            .publish(NewEvent::new(EventKind::TASK_COMPLETED, "test"))
            .await;
        f.bus.wait_idle().await;
        assert_eq!(f.queue.len().await, 1);

        f.trigger.stop().await;
        f.trigger.stop().await;
        assert!(!f.trigger.is_running().await);
        assert_eq!(f.bus.subscriber_count().await, 0);

        f.bus.publish(NewEvent::new("code.changed", "test")).await;
        f.bus.wait_idle().await;
        assert_eq!(f.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_auto_execute_does_not_block_publisher() {
        let f = fixture(
            TriggerMode::AutoExecute,
            vec![definition("reviewer", &[("code.*", "review")])],
        )
        .await;
        f.trigger.start().await;

        // The agent run happens on the handler's task, not the publisher's
        f.bus.publish(NewEvent::new("code.changed", "test")).await;
        assert_eq!(f.bus.in_flight(), 1);
        f.bus.wait_idle().await;
        assert_eq!(f.bus.in_flight(), 0);
        assert!(f.queue.is_empty().await);
    }
}
