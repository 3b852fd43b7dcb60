//! Shared data model for the foreman engine and its outer collaborators
//! (dashboard, storage, desktop shell).

pub mod event_bus;
pub mod stream;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub use event_bus::{Event, EventKind, NewEvent};
pub use stream::StreamMessage;

// ============================================================================
// Agent Definition
// ============================================================================

/// Coarse policy tag consumed by the approval workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    #[default]
    Low,
    Medium,
    High,
    Full,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Low => "low",
            TrustLevel::Medium => "medium",
            TrustLevel::High => "high",
            TrustLevel::Full => "full",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(TrustLevel::Low),
            "medium" => Some(TrustLevel::Medium),
            "high" => Some(TrustLevel::High),
            "full" => Some(TrustLevel::Full),
            _ => None,
        }
    }
}

/// Maps an event-type pattern to an action name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// Exact event type or `*` glob (e.g. `code.*`)
    pub event: String,
    pub action: String,
}

impl Trigger {
    pub fn new(event: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            action: action.into(),
        }
    }
}

/// Immutable agent descriptor, owned by the registry once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    pub trust_level: TrustLevel,
    pub max_turns: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<String>>,
    pub system_prompt: String,
}

// ============================================================================
// Task
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }

    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

/// Metadata keys carried by agent tasks.
pub mod task_metadata {
    pub const MESSAGE: &str = "message";
    pub const CWD: &str = "cwd";
    pub const WORKSPACE_ID: &str = "workspaceId";
    pub const EVENT_ID: &str = "eventId";
    pub const CONTEXT: &str = "context";
    /// Written by the processor when a task fails
    pub const ERROR: &str = "error";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub project_id: String,
    pub agent_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    /// Higher is more urgent
    pub priority: i32,
    pub parent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Task {
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateTask {
    pub project_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl CreateTask {
    pub fn new(project_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Partial update. `metadata` is shallow-merged into the existing map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateTask {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

impl UpdateTask {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        self.project_id.as_ref().is_none_or(|p| &task.project_id == p)
            && self
                .agent_id
                .as_ref()
                .is_none_or(|a| task.agent_id.as_ref() == Some(a))
            && self.status.is_none_or(|s| task.status == s)
            && self.parent_id.is_none_or(|p| task.parent_id == Some(p))
    }
}

// ============================================================================
// Agent Execution
// ============================================================================

/// Ephemeral, one per execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecutionContext {
    pub project_id: String,
    pub workspace_id: String,
    pub working_directory: String,
    #[serde(default)]
    pub task_id: Option<Uuid>,
    #[serde(default)]
    pub event_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecutionResult {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub turns_used: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
}

impl AgentExecutionResult {
    /// Result for an execution that never started because it was cancelled.
    pub fn cancelled_before_start(started_at: DateTime<Utc>, reason: Option<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(reason.unwrap_or_else(|| "execution cancelled".to_string())),
            turns_used: 0,
            started_at,
            finished_at: Utc::now(),
            cancelled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    Text,
    ToolUse,
    ToolResult,
    Status,
}

/// Progress delivered upward to UI collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProgress {
    pub agent_id: String,
    pub task_id: Option<Uuid>,
    /// 0-100
    pub progress: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_turn: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<ProgressKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}
