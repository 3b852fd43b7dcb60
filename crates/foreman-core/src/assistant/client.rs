use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use foreman_protocol::stream::{StreamMessage, Usage};
use serde::Serialize;
use tokio::process::Command;

use super::AssistantConfig;
use super::conversation::{ConversationMessage, reconstruct};
use crate::cancellation::CancellationToken;
use crate::error::{ForemanError, Result};
use crate::process::{ControllerOptions, ControllerProgress, StopReason, SubprocessController};
use crate::stream::{ParserEvent, ParserEventKind};

const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

pub type ProgressFn = Arc<dyn Fn(&ControllerProgress) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssistantStatus {
    pub version: String,
    pub authenticated: bool,
}

/// Per-call overrides. Unset fields fall back to the client configuration.
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    pub system_prompt: Option<String>,
    pub max_turns: Option<u32>,
    pub allowed_tools: Option<Vec<String>>,
    pub working_directory: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub cancellation: Option<CancellationToken>,
    pub on_progress: Option<ProgressFn>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssistantResponse {
    pub success: bool,
    pub output: String,
    pub messages: Vec<ConversationMessage>,
    pub parsed_messages: Vec<StreamMessage>,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

/// Runs the external assistant program.
#[derive(Debug, Clone)]
pub struct AssistantClient {
    config: AssistantConfig,
}

impl AssistantClient {
    pub fn new(config: AssistantConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AssistantConfig {
        &self.config
    }

    /// Verify the program is installed and, when required, authenticated.
    pub async fn check(&self) -> Result<AssistantStatus> {
        let program = &self.config.program;
        let run = Command::new(program)
            .args(&self.config.extra_args)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(VERSION_CHECK_TIMEOUT, run).await {
            Err(_) => return Err(ForemanError::Timeout(VERSION_CHECK_TIMEOUT)),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ForemanError::NotFound(format!(
                    "assistant program `{}` not found",
                    program
                )));
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            return Err(anyhow::anyhow!(
                "`{} --version` exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )
            .into());
        }

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let authenticated = self.is_authenticated();
        if self.config.require_auth && !authenticated {
            return Err(ForemanError::Unauthorized(format!(
                "no credentials found for `{}`: set one of [{}] or log in",
                program,
                self.config.auth_env_vars.join(", ")
            )));
        }

        tracing::debug!(program = %program, version = %version, authenticated, "assistant program available");
        Ok(AssistantStatus {
            version,
            authenticated,
        })
    }

    fn is_authenticated(&self) -> bool {
        let from_env = self
            .config
            .auth_env_vars
            .iter()
            .any(|key| std::env::var(key).is_ok_and(|v| !v.trim().is_empty()));
        from_env
            || self
                .config
                .credential_files
                .iter()
                .any(|path| expand_home(path).is_file())
    }

    /// A controller configured from the client settings and `options`,
    /// not yet started.
    pub fn spawn(&self, options: &ExecuteOptions) -> SubprocessController {
        let timeout = options.timeout.unwrap_or_else(|| self.config.timeout());
        let controller = SubprocessController::new(ControllerOptions {
            program: self.config.program.clone(),
            extra_args: self.config.extra_args.clone(),
            system_prompt: options.system_prompt.clone(),
            max_turns: options.max_turns.unwrap_or(self.config.max_turns),
            allowed_tools: options.allowed_tools.clone(),
            working_directory: options.working_directory.clone(),
            env: options.env.clone(),
            timeout,
            keep_stdin_open: self.config.keep_stdin_open,
            cancellation: options.cancellation.clone(),
            ..Default::default()
        });

        controller.on_parser_event(ParserEventKind::ParseError, |event| {
            if let ParserEvent::ParseError { error, raw_line } = event {
                tracing::debug!(error = %error, raw_line = %raw_line, "skipping unparseable output line");
            }
        });
        if let Some(on_progress) = options.on_progress.clone() {
            controller.on_progress(move |progress| on_progress(progress));
        }
        controller
    }

    /// Run one message to completion.
    pub async fn execute(&self, message: &str, options: ExecuteOptions) -> Result<AssistantResponse> {
        self.check().await?;

        let timeout = options.timeout.unwrap_or_else(|| self.config.timeout());
        let controller = self.spawn(&options);
        controller.send(message).await?;

        let exit_code = match tokio::time::timeout(timeout, controller.wait()).await {
            Ok(code) => code?,
            Err(_) => {
                tracing::warn!(pid = ?controller.pid(), timeout = ?timeout, "assistant call timed out");
                controller.stop().await;
                return Err(ForemanError::Timeout(timeout));
            }
        };
        if controller.stop_reason() == Some(StopReason::Timeout) {
            return Err(ForemanError::Timeout(timeout));
        }

        Ok(build_response(&controller, exit_code))
    }
}

fn build_response(controller: &SubprocessController, exit_code: i32) -> AssistantResponse {
    let parsed_messages = controller.messages();
    let stderr = controller.stderr_output();
    let final_result = parsed_messages.iter().rev().find_map(|m| match m {
        StreamMessage::Result(r) => Some(r),
        _ => None,
    });
    let stream_error = parsed_messages.iter().rev().find_map(|m| match m {
        StreamMessage::Error(e) => Some(e.message.clone()),
        _ => None,
    });

    let mut output = controller.text();
    if output.is_empty() {
        if let Some(text) = final_result.and_then(|r| r.result.clone()) {
            output = text;
        }
    }

    let success = exit_code == 0 && stderr.trim().is_empty();
    let error = if success {
        None
    } else if !stderr.trim().is_empty() {
        Some(stderr.trim().to_string())
    } else {
        Some(stream_error.unwrap_or_else(|| format!("assistant exited with code {}", exit_code)))
    };

    AssistantResponse {
        success,
        output,
        messages: reconstruct(&parsed_messages),
        exit_code,
        error,
        usage: final_result.and_then(|r| r.usage),
        session_id: final_result.and_then(|r| r.session_id.clone()),
        cost_usd: final_result.and_then(|r| r.total_cost_usd),
        parsed_messages,
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(path)
}
