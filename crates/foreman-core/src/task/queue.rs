use std::collections::HashMap;

use chrono::Utc;
use foreman_protocol::{CreateTask, Task, TaskFilter, TaskStatus, UpdateTask};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ForemanError, Result};

#[derive(Default)]
struct QueueState {
    tasks: HashMap<Uuid, Task>,
    /// Pending task ids in dequeue order
    pending: Vec<Uuid>,
    /// Creation sequence, breaks `created_at` ties
    sequence: HashMap<Uuid, u64>,
    next_sequence: u64,
}

impl QueueState {
    /// Insert before the first task with strictly lower priority, so equal
    /// priorities keep FIFO order.
    fn enqueue(&mut self, id: Uuid, priority: i32) {
        let position = self
            .pending
            .iter()
            .position(|other| {
                self.tasks
                    .get(other)
                    .is_some_and(|task| task.priority < priority)
            })
            .unwrap_or(self.pending.len());
        self.pending.insert(position, id);
    }

    fn remove_pending(&mut self, id: Uuid) {
        self.pending.retain(|other| *other != id);
    }
}

/// In-memory priority queue of tasks.
///
/// Every task lives in the task map until deleted; only `pending` tasks are
/// in the dequeue order.
#[derive(Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, input: CreateTask) -> Result<Task> {
        let title = input.title.trim();
        if title.is_empty() {
            return Err(ForemanError::validation("title", "is required"));
        }
        if input.project_id.trim().is_empty() {
            return Err(ForemanError::validation("project_id", "is required"));
        }

        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4(),
            project_id: input.project_id,
            agent_id: input.agent_id,
            title: title.to_string(),
            description: input.description,
            status: TaskStatus::Pending,
            priority: input.priority,
            parent_id: input.parent_id,
            created_at: now,
            updated_at: now,
            metadata: input.metadata,
        };

        let mut state = self.state.lock().await;
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.sequence.insert(task.id, sequence);
        state.tasks.insert(task.id, task.clone());
        state.enqueue(task.id, task.priority);
        debug!(task_id = %task.id, priority = task.priority, "task created");
        Ok(task)
    }

    pub async fn get(&self, id: Uuid) -> Result<Task> {
        self.state
            .lock()
            .await
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| ForemanError::not_found(format!("task {}", id)))
    }

    /// Shallow-merge `update` into the task. Status transitions move the
    /// task in or out of the pending order.
    pub async fn update(&self, id: Uuid, update: UpdateTask) -> Result<Task> {
        if update.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(ForemanError::validation("title", "must not be empty"));
        }

        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| ForemanError::not_found(format!("task {}", id)))?;

        let was_pending = task.status == TaskStatus::Pending;
        let old_priority = task.priority;

        if let Some(title) = update.title {
            task.title = title.trim().to_string();
        }
        if let Some(description) = update.description {
            task.description = Some(description);
        }
        if let Some(status) = update.status {
            task.status = status;
        }
        if let Some(priority) = update.priority {
            task.priority = priority;
        }
        if let Some(agent_id) = update.agent_id {
            task.agent_id = Some(agent_id);
        }
        if let Some(parent_id) = update.parent_id {
            task.parent_id = Some(parent_id);
        }
        if let Some(metadata) = update.metadata {
            task.metadata.extend(metadata);
        }
        task.updated_at = Utc::now();

        let task = task.clone();
        let is_pending = task.status == TaskStatus::Pending;
        // A dequeued task stays `pending` until the caller moves it on
        let queued = state.pending.contains(&id);
        match (was_pending, is_pending) {
            (true, false) => state.remove_pending(id),
            (false, true) if !queued => state.enqueue(id, task.priority),
            (true, true) if queued && old_priority != task.priority => {
                state.remove_pending(id);
                state.enqueue(id, task.priority);
            }
            _ => {}
        }
        debug!(task_id = %id, status = task.status.as_str(), "task updated");
        Ok(task)
    }

    pub async fn delete(&self, id: Uuid) -> Result<Task> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .remove(&id)
            .ok_or_else(|| ForemanError::not_found(format!("task {}", id)))?;
        state.remove_pending(id);
        state.sequence.remove(&id);
        Ok(task)
    }

    /// Pop the most urgent pending task. Its status is left unchanged; the
    /// caller is expected to move it out of `pending`.
    pub async fn dequeue(&self) -> Option<Task> {
        let mut state = self.state.lock().await;
        if state.pending.is_empty() {
            return None;
        }
        let id = state.pending.remove(0);
        state.tasks.get(&id).cloned()
    }

    pub async fn peek(&self) -> Option<Task> {
        let state = self.state.lock().await;
        state.pending.first().and_then(|id| state.tasks.get(id)).cloned()
    }

    /// Tasks matching `filter`, by priority descending then creation time.
    pub async fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect();
        let sequence = |task: &Task| state.sequence.get(&task.id).copied().unwrap_or(u64::MAX);
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then_with(|| sequence(a).cmp(&sequence(b)))
        });
        tasks
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.tasks.is_empty()
    }
}
