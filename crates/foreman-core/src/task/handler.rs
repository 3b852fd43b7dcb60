use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use foreman_protocol::{
    AgentExecutionContext, AgentExecutionResult, AgentProgress, EventKind, NewEvent, Task,
    task_metadata,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::processor::{TaskCancelled, TaskHandler};
use crate::agent::{AgentRegistry, AgentRunOptions};
use crate::cancellation::CancellationTokenSource;
use crate::error::{ForemanError, Result};
use crate::event_bus::EventPublisher;

/// `source` of every event this handler publishes.
pub const SOURCE: &str = "agent-task-handler";

const PROGRESS_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

type RunningTasks = Mutex<HashMap<Uuid, CancellationTokenSource>>;

fn lock(running: &RunningTasks) -> MutexGuard<'_, HashMap<Uuid, CancellationTokenSource>> {
    running.lock().unwrap_or_else(|e| e.into_inner())
}

/// Removes the task's cancellation source however `handle` exits.
struct RunningGuard<'a> {
    running: &'a RunningTasks,
    task_id: Uuid,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if let Some(source) = lock(self.running).remove(&self.task_id) {
            source.dispose();
        }
    }
}

/// Agent Task Handler
///
/// Executes tasks assigned to an agent and reports their lifecycle on the
/// event bus.
pub struct AgentTaskHandler {
    registry: Arc<AgentRegistry>,
    publisher: Arc<dyn EventPublisher>,
    running: RunningTasks,
    /// Set by `cancel_all`; tasks starting afterwards are cancelled at once
    closing: AtomicBool,
    closing_reason: Mutex<Option<String>>,
}

impl AgentTaskHandler {
    pub fn new(registry: Arc<AgentRegistry>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            registry,
            publisher,
            running: Mutex::new(HashMap::new()),
            closing: AtomicBool::new(false),
            closing_reason: Mutex::new(None),
        }
    }

    pub async fn handle(&self, task: &Task) -> Result<AgentExecutionResult> {
        let request = AgentRequest::from_task(task)?;

        let source = CancellationTokenSource::new();
        let token = source.token();
        if lock(&self.running).insert(task.id, source).is_some() {
            warn!(task_id = %task.id, "task was already running, replacing its cancellation source");
        }
        let _guard = RunningGuard {
            running: &self.running,
            task_id: task.id,
        };
        if self.closing.load(Ordering::SeqCst) {
            let reason = self
                .closing_reason
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            self.cancel_task(task.id, reason);
        }

        self.emit(&request, EventKind::TASK_STARTED, json!({ "title": task.title }))
            .await;
        self.emit(&request, EventKind::AGENT_STARTED, json!({})).await;

        // Progress is forwarded through a channel so events keep their order
        // and are all published before the terminal event.
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<AgentProgress>();
        let publisher = self.publisher.clone();
        let progress_event = request.event(EventKind::AGENT_PROGRESS);
        let forwarder = tokio::spawn(async move {
            while let Some(progress) = progress_rx.recv().await {
                let payload = serde_json::to_value(&progress).unwrap_or(Value::Null);
                publisher
                    .publish(progress_event.clone().payload(payload))
                    .await;
            }
        });

        let context = AgentExecutionContext {
            project_id: task.project_id.clone(),
            workspace_id: request.workspace_id.clone(),
            working_directory: request.cwd.clone(),
            task_id: Some(task.id),
            event_id: request.event_id,
        };
        let options = AgentRunOptions {
            cancellation: Some(token),
            on_progress: Some(Arc::new(move |progress: AgentProgress| {
                let _ = progress_tx.send(progress);
            })),
            timeout: None,
        };

        let outcome = self
            .registry
            .execute_agent(&request.agent_id, &request.message, &context, options)
            .await;
        // The sender is dropped with the controller once the process exits
        match tokio::time::timeout(PROGRESS_DRAIN_TIMEOUT, forwarder).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(task_id = %task.id, error = %e, "progress forwarder failed"),
            Err(_) => warn!(task_id = %task.id, "progress forwarder still running, not waiting"),
        }

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                let message = e.to_string();
                self.emit(&request, EventKind::TASK_FAILED, json!({ "error": message }))
                    .await;
                self.emit(&request, EventKind::AGENT_ERROR, json!({ "error": message }))
                    .await;
                return Err(e);
            }
        };

        if result.cancelled {
            info!(task_id = %task.id, agent_id = %request.agent_id, "agent task cancelled");
            self.emit(
                &request,
                EventKind::TASK_CANCELLED,
                json!({ "reason": result.error }),
            )
            .await;
        } else if result.success {
            info!(task_id = %task.id, agent_id = %request.agent_id, turns = result.turns_used, "agent task completed");
            let payload = json!({
                "output": result.output,
                "turnsUsed": result.turns_used,
            });
            self.emit(&request, EventKind::TASK_COMPLETED, payload.clone())
                .await;
            self.emit(&request, EventKind::AGENT_COMPLETED, payload).await;
        } else {
            info!(task_id = %task.id, agent_id = %request.agent_id, error = ?result.error, "agent task failed");
            let payload = json!({
                "error": result.error,
                "output": result.output,
                "turnsUsed": result.turns_used,
            });
            self.emit(&request, EventKind::TASK_FAILED, payload.clone())
                .await;
            self.emit(&request, EventKind::AGENT_ERROR, payload).await;
        }

        Ok(result)
    }

    async fn emit(&self, request: &AgentRequest, kind: &str, extra: Value) {
        let mut event = request.event(kind);
        if let Value::Object(map) = extra {
            event.payload.extend(map);
        }
        self.publisher.publish(event).await;
    }

    /// Cancel a running task. Returns false if it is not running here.
    pub fn cancel_task(&self, task_id: Uuid, reason: Option<String>) -> bool {
        let source = lock(&self.running).get(&task_id).cloned();
        match source {
            Some(source) => {
                info!(task_id = %task_id, reason = ?reason, "cancelling agent task");
                source.cancel(reason);
                true
            }
            None => false,
        }
    }

    /// Cancel every running task, and every task that starts until
    /// [`reopen`](Self::reopen) is called. Returns how many were running.
    pub fn cancel_all(&self, reason: Option<String>) -> usize {
        *self.closing_reason.lock().unwrap_or_else(|e| e.into_inner()) = reason.clone();
        self.closing.store(true, Ordering::SeqCst);

        let sources: Vec<_> = lock(&self.running).values().cloned().collect();
        for source in &sources {
            source.cancel(reason.clone());
        }
        if !sources.is_empty() {
            info!(count = sources.len(), reason = ?reason, "cancelled running agent tasks");
        }
        sources.len()
    }

    /// Accept tasks again after [`cancel_all`](Self::cancel_all).
    pub fn reopen(&self) {
        self.closing.store(false, Ordering::SeqCst);
    }

    pub fn is_task_running(&self, task_id: Uuid) -> bool {
        lock(&self.running).contains_key(&task_id)
    }

    pub fn running_tasks(&self) -> Vec<Uuid> {
        lock(&self.running).keys().copied().collect()
    }

    /// Adapter for [`TaskProcessor`](super::TaskProcessor): tasks without an
    /// agent are skipped, failed executions become errors and cancelled ones
    /// become [`TaskCancelled`].
    pub fn as_task_handler(self: &Arc<Self>) -> Arc<dyn TaskHandler> {
        Arc::new(AgentTaskAdapter(self.clone()))
    }
}

struct AgentTaskAdapter(Arc<AgentTaskHandler>);

#[async_trait]
impl TaskHandler for AgentTaskAdapter {
    async fn handle(&self, task: &Task) -> anyhow::Result<()> {
        if task.agent_id.is_none() {
            debug!(task_id = %task.id, "task has no agent, skipping");
            return Ok(());
        }

        let result = self.0.handle(task).await?;
        if result.cancelled {
            let reason = result
                .error
                .unwrap_or_else(|| "execution cancelled".to_string());
            return Err(TaskCancelled(reason).into());
        }
        if !result.success {
            anyhow::bail!(
                "{}",
                result
                    .error
                    .unwrap_or_else(|| "agent execution failed".to_string())
            );
        }
        Ok(())
    }
}

/// Validated execution inputs read from an agent task.
struct AgentRequest {
    task_id: Uuid,
    project_id: String,
    agent_id: String,
    message: String,
    cwd: String,
    workspace_id: String,
    event_id: Option<Uuid>,
}

impl AgentRequest {
    fn from_task(task: &Task) -> Result<Self> {
        let agent_id = task
            .agent_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ForemanError::validation("agent_id", "task has no agent assigned"))?;
        if task.metadata.is_empty() {
            return Err(ForemanError::validation("metadata", "agent task has no metadata"));
        }
        let cwd = task
            .metadata_str(task_metadata::CWD)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ForemanError::validation(task_metadata::CWD, "is required"))?
            .to_string();
        let workspace_id = task
            .metadata_str(task_metadata::WORKSPACE_ID)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ForemanError::validation(task_metadata::WORKSPACE_ID, "is required"))?
            .to_string();

        let message = task
            .metadata_str(task_metadata::MESSAGE)
            .map(str::to_string)
            .or_else(|| task.description.clone())
            .unwrap_or_else(|| task.title.clone());
        let event_id = task
            .metadata_str(task_metadata::EVENT_ID)
            .and_then(|s| Uuid::parse_str(s).ok());

        Ok(Self {
            task_id: task.id,
            project_id: task.project_id.clone(),
            agent_id,
            message,
            cwd,
            workspace_id,
            event_id,
        })
    }

    fn event(&self, kind: &str) -> NewEvent {
        NewEvent::new(kind, SOURCE)
            .project(self.project_id.clone())
            .workspace(self.workspace_id.clone())
            .with("taskId", self.task_id.to_string())
            .with("agentId", self.agent_id.clone())
    }
}
