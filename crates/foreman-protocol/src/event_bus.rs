//! Event bus message definitions shared by the engine and its consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ============================================================================
// Event Kind Constants
// ============================================================================

/// Event kind constants following the format: `<category>.<action>`
pub struct EventKind;

impl EventKind {
    // Task lifecycle
    pub const TASK_CREATED: &str = "task.created";
    pub const TASK_UPDATED: &str = "task.updated";
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_CANCELLED: &str = "task.cancelled";

    // Agent lifecycle
    pub const AGENT_STARTED: &str = "agent.started";
    pub const AGENT_PROGRESS: &str = "agent.progress";
    pub const AGENT_COMPLETED: &str = "agent.completed";
    pub const AGENT_ERROR: &str = "agent.error";

    /// Lifecycle kinds emitted by the engine itself. Agents are never
    /// triggered by these, otherwise an agent finishing a task would
    /// re-trigger agents listening on `task.*`.
    pub const SYSTEM_KINDS: &[&str] = &[
        Self::TASK_CREATED,
        Self::TASK_UPDATED,
        Self::TASK_STARTED,
        Self::TASK_COMPLETED,
        Self::TASK_FAILED,
        Self::TASK_CANCELLED,
        Self::AGENT_STARTED,
        Self::AGENT_PROGRESS,
        Self::AGENT_COMPLETED,
        Self::AGENT_ERROR,
    ];

    pub fn is_system(kind: &str) -> bool {
        Self::SYSTEM_KINDS.contains(&kind)
    }
}

// ============================================================================
// Event
// ============================================================================

/// Immutable, timestamped notification broadcast on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,

    /// Dot-segmented event type, e.g. "task.completed"
    #[serde(rename = "type")]
    pub kind: String,

    /// Component or collaborator that emitted the event
    pub source: String,

    #[serde(default)]
    pub project_id: Option<String>,

    #[serde(default)]
    pub workspace_id: Option<String>,

    #[serde(default)]
    pub payload: Map<String, Value>,

    pub time: DateTime<Utc>,
}

/// An event before the bus has stamped it with an id and timestamp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl NewEvent {
    pub fn new(kind: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            source: source.into(),
            ..Default::default()
        }
    }

    pub fn project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    /// Replace the payload with a JSON object. Non-object values are
    /// stored under a `value` key.
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    /// Assign id and timestamp
    pub fn stamp(self) -> Event {
        Event {
            id: Uuid::new_v4(),
            kind: self.kind,
            source: self.source,
            project_id: self.project_id,
            workspace_id: self.workspace_id,
            payload: self.payload,
            time: Utc::now(),
        }
    }
}
