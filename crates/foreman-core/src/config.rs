use std::env;
use std::path::PathBuf;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::assistant::AssistantConfig;
use crate::event_bus::BusConfig;
use crate::event_bus::trigger::TriggerConfig;
use crate::task::ProcessorConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentsConfig {
    /// Directory holding agent descriptors (`*.toml`, `*.md`)
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
}

impl Settings {
    /// Layered load: defaults, run-mode file, local overrides, then
    /// `FOREMAN__SECTION__KEY` environment variables.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Not tracked by git
            .add_source(File::with_name("config/local").required(false))
            .add_source(environment())
            .build()?;

        s.try_deserialize()
    }

    /// Load from an explicit file, still honouring environment overrides.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        Self::from_file_with(path, environment())
    }

    fn from_file_with(path: &std::path::Path, env: Environment) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from(path))
            .add_source(env)
            .build()?;

        s.try_deserialize()
    }
}

/// `FOREMAN__SECTION__KEY` overrides; list fields take comma-separated values.
fn environment() -> Environment {
    Environment::with_prefix("FOREMAN")
        .prefix_separator("__")
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("assistant.extra_args")
        .with_list_parse_key("assistant.auth_env_vars")
        .with_list_parse_key("assistant.credential_files")
        .try_parsing(true)
}
