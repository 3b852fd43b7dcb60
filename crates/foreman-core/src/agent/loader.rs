//! Agent descriptor loading.
//!
//! Two formats are accepted:
//!
//! * `*.toml`: every field as a TOML key, triggers as `[[triggers]]` tables.
//! * `*.md`: TOML front matter between `+++` fences; the Markdown body is the
//!   system prompt.
//!
//! Validation collects every problem into a field-keyed
//! [`ForemanError::Validation`] instead of stopping at the first one.

use std::collections::BTreeMap;
use std::path::Path;

use foreman_protocol::{AgentDefinition, Trigger, TrustLevel};
use serde::{Deserialize, Serialize};

use crate::error::{ForemanError, Result};

pub const DEFAULT_MAX_TURNS: u32 = 10;

const FRONT_MATTER_FENCE: &str = "+++";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorFormat {
    Toml,
    Markdown,
}

impl DescriptorFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "toml" => Some(DescriptorFormat::Toml),
            "md" | "markdown" => Some(DescriptorFormat::Markdown),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawDescriptor {
    id: Option<String>,
    name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    triggers: Vec<RawTrigger>,
    trust_level: Option<String>,
    max_turns: Option<i64>,
    allowed_tools: Option<Vec<String>>,
    context: Option<Vec<String>>,
    system_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTrigger {
    event: Option<String>,
    action: Option<String>,
}

pub fn parse_descriptor(content: &str, format: DescriptorFormat) -> Result<AgentDefinition> {
    let raw = match format {
        DescriptorFormat::Toml => parse_toml(content)?,
        DescriptorFormat::Markdown => {
            let (front_matter, body) = split_front_matter(content)?;
            let mut raw = parse_toml(front_matter)?;
            let body = body.trim();
            if !body.is_empty() {
                raw.system_prompt = Some(body.to_string());
            }
            raw
        }
    };
    build_definition(raw)
}

fn parse_toml(content: &str) -> Result<RawDescriptor> {
    toml::from_str(content)
        .map_err(|e| ForemanError::validation("descriptor", e.message().to_string()))
}

fn split_front_matter(content: &str) -> Result<(&str, &str)> {
    let missing = || ForemanError::validation("descriptor", "missing `+++` front matter");

    let content = content.trim_start_matches('\u{feff}');
    let rest = content
        .strip_prefix(FRONT_MATTER_FENCE)
        .and_then(|r| r.strip_prefix("\r\n").or_else(|| r.strip_prefix('\n')))
        .ok_or_else(missing)?;

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == FRONT_MATTER_FENCE {
            let front_matter = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Ok((front_matter, body));
        }
        offset += line.len();
    }
    Err(ForemanError::validation(
        "descriptor",
        "unterminated `+++` front matter",
    ))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn build_definition(raw: RawDescriptor) -> Result<AgentDefinition> {
    let mut errors = BTreeMap::new();

    let id = non_empty(raw.id);
    match &id {
        None => {
            errors.insert("id".to_string(), "is required".to_string());
        }
        Some(id) if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') => {
            errors.insert(
                "id".to_string(),
                "may only contain letters, digits, `-` and `_`".to_string(),
            );
        }
        Some(_) => {}
    }

    let name = non_empty(raw.name);
    if name.is_none() {
        errors.insert("name".to_string(), "is required".to_string());
    }

    let trust_level = match raw.trust_level.as_deref() {
        None => {
            errors.insert("trust_level".to_string(), "is required".to_string());
            TrustLevel::default()
        }
        Some(s) => TrustLevel::parse(s).unwrap_or_else(|| {
            errors.insert(
                "trust_level".to_string(),
                format!("unknown trust level `{}` (expected low, medium, high or full)", s),
            );
            TrustLevel::default()
        }),
    };

    let max_turns = match raw.max_turns {
        None => DEFAULT_MAX_TURNS,
        Some(n) if n > 0 && n <= u32::MAX as i64 => n as u32,
        Some(n) => {
            errors.insert(
                "max_turns".to_string(),
                format!("must be a positive integer, got {}", n),
            );
            DEFAULT_MAX_TURNS
        }
    };

    let mut triggers = Vec::with_capacity(raw.triggers.len());
    for (i, trigger) in raw.triggers.into_iter().enumerate() {
        match (non_empty(trigger.event), non_empty(trigger.action)) {
            (Some(event), Some(action)) => triggers.push(Trigger { event, action }),
            _ => {
                errors
                    .entry("triggers".to_string())
                    .or_insert_with(|| format!("trigger #{} needs both `event` and `action`", i + 1));
            }
        }
    }

    let system_prompt = non_empty(raw.system_prompt);
    if system_prompt.is_none() {
        errors.insert("system_prompt".to_string(), "is required".to_string());
    }

    match (id, name, system_prompt) {
        (Some(id), Some(name), Some(system_prompt)) if errors.is_empty() => Ok(AgentDefinition {
            id,
            name,
            description: raw.description.unwrap_or_default(),
            triggers,
            trust_level,
            max_turns,
            allowed_tools: raw.allowed_tools,
            context: raw.context,
            system_prompt,
        }),
        _ => Err(ForemanError::Validation { fields: errors }),
    }
}

/// Re-check an already-built definition, e.g. one constructed in code.
pub fn validate(definition: &AgentDefinition) -> Result<()> {
    build_definition(RawDescriptor {
        id: Some(definition.id.clone()),
        name: Some(definition.name.clone()),
        description: Some(definition.description.clone()),
        triggers: definition
            .triggers
            .iter()
            .map(|t| RawTrigger {
                event: Some(t.event.clone()),
                action: Some(t.action.clone()),
            })
            .collect(),
        trust_level: Some(definition.trust_level.as_str().to_string()),
        max_turns: Some(definition.max_turns as i64),
        allowed_tools: None,
        context: None,
        system_prompt: Some(definition.system_prompt.clone()),
    })
    .map(|_| ())
}

#[derive(Serialize)]
struct DescriptorOut<'a> {
    id: &'a str,
    name: &'a str,
    description: &'a str,
    trust_level: &'a str,
    max_turns: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    allowed_tools: Option<&'a Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a Vec<String>>,
    system_prompt: &'a str,
    // Arrays of tables go last in TOML
    triggers: &'a [Trigger],
}

/// Render a definition as a TOML descriptor.
pub fn to_toml(definition: &AgentDefinition) -> Result<String> {
    let out = DescriptorOut {
        id: &definition.id,
        name: &definition.name,
        description: &definition.description,
        trust_level: definition.trust_level.as_str(),
        max_turns: definition.max_turns,
        allowed_tools: definition.allowed_tools.as_ref(),
        context: definition.context.as_ref(),
        system_prompt: &definition.system_prompt,
        triggers: &definition.triggers,
    };
    toml::to_string_pretty(&out).map_err(|e| anyhow::anyhow!("failed to render descriptor: {}", e).into())
}

pub fn load_agent_file(path: &Path) -> Result<AgentDefinition> {
    let format = DescriptorFormat::from_path(path).ok_or_else(|| {
        ForemanError::validation("descriptor", format!("unsupported file type: {}", path.display()))
    })?;
    let content = std::fs::read_to_string(path)?;
    parse_descriptor(&content, format)
}

/// Load every descriptor in `dir`. Invalid files are logged and skipped;
/// only an unreadable directory is an error.
pub fn load_agents_from_dir(dir: &Path) -> Result<Vec<AgentDefinition>> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && DescriptorFormat::from_path(path).is_some())
        .collect();
    paths.sort();

    let mut definitions = Vec::with_capacity(paths.len());
    for path in paths {
        match load_agent_file(&path) {
            Ok(definition) => {
                tracing::debug!(agent_id = %definition.id, path = %path.display(), "loaded agent descriptor");
                definitions.push(definition);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping invalid agent descriptor");
            }
        }
    }
    Ok(definitions)
}
