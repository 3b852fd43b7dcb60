// Agent Registry / Orchestrator
//
// Agents are immutable definitions bound to the shared assistant client.
// The registry maps agent ids to runtime agents and matches events against
// their triggers.

pub mod loader;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use foreman_protocol::{
    AgentDefinition, AgentExecutionContext, AgentExecutionResult, AgentProgress, Trigger,
};

use crate::assistant::{AssistantClient, ExecuteOptions, ProgressFn};
use crate::cancellation::CancellationToken;
use crate::error::ForemanError;
use crate::pattern::matches_event_pattern;
use crate::process::ControllerProgress;

pub use registry::AgentRegistry;

pub type AgentProgressFn = Arc<dyn Fn(AgentProgress) + Send + Sync>;

/// Optional knobs for one execution.
#[derive(Clone, Default)]
pub struct AgentRunOptions {
    pub cancellation: Option<CancellationToken>,
    pub on_progress: Option<AgentProgressFn>,
    pub timeout: Option<Duration>,
}

/// Runtime wrapper around an [`AgentDefinition`].
pub struct Agent {
    definition: AgentDefinition,
    client: Arc<AssistantClient>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.definition.id)
            .field("trust_level", &self.definition.trust_level)
            .finish()
    }
}

impl Agent {
    pub fn new(definition: AgentDefinition, client: Arc<AssistantClient>) -> Self {
        Self { definition, client }
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn definition(&self) -> &AgentDefinition {
        &self.definition
    }

    /// First trigger whose pattern matches `event_type`.
    pub fn matching_trigger(&self, event_type: &str) -> Option<&Trigger> {
        self.definition
            .triggers
            .iter()
            .find(|trigger| matches_event_pattern(&trigger.event, event_type))
    }

    fn system_prompt(&self) -> String {
        let prompt = &self.definition.system_prompt;
        match self.definition.context.as_deref() {
            Some(hints) if !hints.is_empty() => {
                let mut out = prompt.clone();
                out.push_str("\n\nContext:\n");
                for hint in hints {
                    out.push_str("- ");
                    out.push_str(hint);
                    out.push('\n');
                }
                out
            }
            _ => prompt.clone(),
        }
    }

    /// Run `message` through the assistant. Never fails: errors and
    /// cancellation are folded into the returned result.
    pub async fn execute(
        &self,
        message: &str,
        context: &AgentExecutionContext,
        options: AgentRunOptions,
    ) -> AgentExecutionResult {
        let started_at = Utc::now();
        let token = options.cancellation.clone();

        if let Some(token) = token.as_ref().filter(|t| t.is_cancelled()) {
            tracing::info!(agent_id = %self.id(), task_id = ?context.task_id, "execution cancelled before start");
            return AgentExecutionResult::cancelled_before_start(started_at, token.reason());
        }

        let on_progress = options.on_progress.map(|callback| {
            let agent_id = self.id().to_string();
            let task_id = context.task_id;
            let forward: ProgressFn = Arc::new(move |p: &ControllerProgress| {
                callback(AgentProgress {
                    agent_id: agent_id.clone(),
                    task_id,
                    progress: p.percent,
                    message: p.message.clone(),
                    current_turn: Some(p.current_turn),
                    max_turns: Some(p.max_turns),
                    kind: Some(p.kind),
                    tool_name: p.tool_name.clone(),
                });
            });
            forward
        });

        let mut env = std::collections::HashMap::new();
        env.insert("FOREMAN_AGENT_ID".to_string(), self.id().to_string());
        env.insert("FOREMAN_PROJECT_ID".to_string(), context.project_id.clone());
        env.insert("FOREMAN_WORKSPACE_ID".to_string(), context.workspace_id.clone());
        if let Some(task_id) = context.task_id {
            env.insert("FOREMAN_TASK_ID".to_string(), task_id.to_string());
        }

        let execute_options = ExecuteOptions {
            system_prompt: Some(self.system_prompt()),
            max_turns: Some(self.definition.max_turns),
            allowed_tools: self.definition.allowed_tools.clone(),
            working_directory: Some(context.working_directory.clone().into()),
            env,
            timeout: options.timeout,
            cancellation: token.clone(),
            on_progress,
        };

        tracing::info!(
            agent_id = %self.id(),
            task_id = ?context.task_id,
            workdir = %context.working_directory,
            "agent execution started"
        );

        let outcome = self.client.execute(message, execute_options).await;
        let cancelled = token.as_ref().is_some_and(|t| t.is_cancelled());
        let finished_at = Utc::now();

        let result = match outcome {
            Ok(response) => AgentExecutionResult {
                success: response.success && !cancelled,
                output: response.output,
                error: if cancelled {
                    Some(cancel_message(token.as_ref()))
                } else {
                    response.error
                },
                turns_used: response.messages.len(),
                started_at,
                finished_at,
                cancelled,
            },
            Err(e) => {
                let error = if cancelled {
                    cancel_message(token.as_ref())
                } else if let ForemanError::Timeout(after) = &e {
                    format!("Execution timed out after {}s", after.as_secs())
                } else {
                    e.to_string()
                };
                AgentExecutionResult {
                    success: false,
                    output: String::new(),
                    error: Some(error),
                    turns_used: 0,
                    started_at,
                    finished_at,
                    cancelled,
                }
            }
        };

        tracing::info!(
            agent_id = %self.id(),
            task_id = ?context.task_id,
            success = result.success,
            cancelled = result.cancelled,
            turns_used = result.turns_used,
            "agent execution finished"
        );
        result
    }
}

fn cancel_message(token: Option<&CancellationToken>) -> String {
    token
        .and_then(|t| t.reason())
        .unwrap_or_else(|| "execution cancelled".to_string())
}
