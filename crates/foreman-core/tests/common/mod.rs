//! Fake assistant program shared by the integration tests.
//!
//! The script runs through `/bin/sh` (passed as `extra_args`) so nothing has
//! to be made executable, and answers `--version` like the real program.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use foreman_core::assistant::{AssistantClient, AssistantConfig};
use foreman_protocol::{AgentDefinition, Trigger, TrustLevel};

pub const SUCCESS_STREAM: &str = r#"
echo '{"type":"system","subtype":"init","session_id":"sess-1"}'
echo '{"type":"assistant","content":"Hello "}'
echo '{"type":"tool_use","id":"t1","name":"Read","input":{"path":"src/main.rs"}}'
echo '{"type":"tool_result","tool_use_id":"t1","content":"fn main() {}"}'
echo '{"type":"assistant","content":"world"}'
echo '{"type":"result","success":true,"session_id":"sess-1","total_cost_usd":0.01,"usage":{"input_tokens":12,"output_tokens":5}}'
"#;

/// Prints one assistant line, then blocks until killed.
pub const HANGING_STREAM: &str = r#"
echo '{"type":"assistant","content":"thinking"}'
exec sleep 30
"#;

pub fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("assistant.sh");
    let script = format!(
        "#!/bin/sh\nif [ \"$1\" = \"--version\" ]; then\n  echo \"fake-assistant 1.0.0\"\n  exit 0\nfi\n{}\n",
        body
    );
    std::fs::write(&path, script).unwrap();
    path
}

pub fn config(script: &Path) -> AssistantConfig {
    AssistantConfig {
        program: "/bin/sh".to_string(),
        extra_args: vec![script.to_string_lossy().into_owned()],
        require_auth: false,
        ..Default::default()
    }
}

pub fn client(script: &Path) -> AssistantClient {
    AssistantClient::new(config(script))
}

pub fn definition(id: &str, triggers: &[(&str, &str)]) -> AgentDefinition {
    AgentDefinition {
        id: id.to_string(),
        name: id.to_string(),
        description: String::new(),
        triggers: triggers.iter().map(|(e, a)| Trigger::new(*e, *a)).collect(),
        trust_level: TrustLevel::Medium,
        max_turns: 4,
        allowed_tools: None,
        context: None,
        system_prompt: "You are a test agent.".to_string(),
    }
}
