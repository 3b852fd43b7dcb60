// Assistant Client
//
// Checks that the assistant program is installed and authenticated, runs a
// message through a SubprocessController and folds the parsed stream into a
// response.

pub mod client;
pub mod conversation;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use client::{AssistantClient, AssistantResponse, AssistantStatus, ExecuteOptions, ProgressFn};
pub use conversation::{ConversationMessage, Role, ToolCall};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments placed before the generated flags
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Turn limit when neither the agent nor the caller sets one
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_require_auth")]
    pub require_auth: bool,
    #[serde(default = "default_auth_env_vars")]
    pub auth_env_vars: Vec<String>,
    #[serde(default = "default_credential_files")]
    pub credential_files: Vec<String>,
    #[serde(default)]
    pub keep_stdin_open: bool,
}

fn default_program() -> String {
    "claude".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_turns() -> u32 {
    10
}

fn default_require_auth() -> bool {
    true
}

fn default_auth_env_vars() -> Vec<String> {
    vec!["ANTHROPIC_API_KEY".to_string()]
}

fn default_credential_files() -> Vec<String> {
    vec!["~/.claude/.credentials.json".to_string()]
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            extra_args: Vec::new(),
            timeout_secs: default_timeout_secs(),
            max_turns: default_max_turns(),
            require_auth: default_require_auth(),
            auth_env_vars: default_auth_env_vars(),
            credential_files: default_credential_files(),
            keep_stdin_open: false,
        }
    }
}

impl AssistantConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
