use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use foreman_protocol::{AgentDefinition, AgentExecutionContext, AgentExecutionResult, Event};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::{Agent, AgentRunOptions, loader};
use crate::assistant::AssistantClient;
use crate::error::{ForemanError, Result};

/// Agent Registry
///
/// Owns every registered agent; all of them share one assistant client.
pub struct AgentRegistry {
    client: Arc<AssistantClient>,
    agents: RwLock<HashMap<String, Arc<Agent>>>,
}

impl AgentRegistry {
    pub fn new(client: Arc<AssistantClient>) -> Self {
        Self {
            client,
            agents: RwLock::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &Arc<AssistantClient> {
        &self.client
    }

    /// Register (or replace) an agent.
    pub async fn register_agent(&self, definition: AgentDefinition) -> Result<Arc<Agent>> {
        loader::validate(&definition)?;

        let agent = Arc::new(Agent::new(definition, self.client.clone()));
        let previous = self
            .agents
            .write()
            .await
            .insert(agent.id().to_string(), agent.clone());

        if previous.is_some() {
            info!("Replaced agent '{}'", agent.id());
        } else {
            info!("Registered agent '{}'", agent.id());
        }
        Ok(agent)
    }

    pub async fn unregister_agent(&self, id: &str) -> bool {
        let removed = self.agents.write().await.remove(id).is_some();
        if removed {
            info!("Unregistered agent '{}'", id);
        }
        removed
    }

    pub async fn get_agent(&self, id: &str) -> Option<Arc<Agent>> {
        self.agents.read().await.get(id).cloned()
    }

    /// Every registered agent, ordered by id.
    pub async fn list_agents(&self) -> Vec<Arc<Agent>> {
        let mut agents: Vec<_> = self.agents.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.id().cmp(b.id()));
        agents
    }

    /// Agents with at least one trigger matching `event.kind`, ordered by id.
    pub async fn find_agents_for_event(&self, event: &Event) -> Vec<Arc<Agent>> {
        self.list_agents()
            .await
            .into_iter()
            .filter(|agent| agent.matching_trigger(&event.kind).is_some())
            .collect()
    }

    pub async fn execute_agent(
        &self,
        id: &str,
        message: &str,
        context: &AgentExecutionContext,
        options: AgentRunOptions,
    ) -> Result<AgentExecutionResult> {
        let agent = self
            .get_agent(id)
            .await
            .ok_or_else(|| ForemanError::not_found(format!("agent '{}'", id)))?;
        Ok(agent.execute(message, context, options).await)
    }

    /// Register every valid descriptor found in `dir`.
    pub async fn register_from_dir(&self, dir: &Path) -> Result<usize> {
        let owned = dir.to_path_buf();
        let definitions = tokio::task::spawn_blocking(move || loader::load_agents_from_dir(&owned))
            .await
            .map_err(|e| anyhow::anyhow!("agent loader task failed: {}", e))??;
        let mut registered = 0;
        for definition in definitions {
            let id = definition.id.clone();
            match self.register_agent(definition).await {
                Ok(_) => registered += 1,
                Err(e) => warn!("Skipping agent '{}': {}", id, e),
            }
        }
        info!("Loaded {} agent(s) from {}", registered, dir.display());
        Ok(registered)
    }
}
