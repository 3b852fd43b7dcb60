use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForemanError {
    #[error("Validation failed: {}", format_fields(.fields))]
    Validation { fields: BTreeMap<String, String> },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Process is not running")]
    ProcessNotRunning,

    #[error("Process stdin is closed")]
    StdinClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ForemanError>;

/// Coarse failure category reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Unauthorized,
    Timeout,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl ForemanError {
    /// Single-field validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(field.into(), message.into());
        ForemanError::Validation { fields }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        ForemanError::NotFound(what.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ForemanError::Validation { .. } => ErrorKind::Validation,
            ForemanError::NotFound(_) => ErrorKind::NotFound,
            ForemanError::Unauthorized(_) => ErrorKind::Unauthorized,
            ForemanError::Timeout(_) => ErrorKind::Timeout,
            ForemanError::ProcessNotRunning
            | ForemanError::StdinClosed
            | ForemanError::Io(_)
            | ForemanError::Config(_)
            | ForemanError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Field -> message map for validation failures
    pub fn fields(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            ForemanError::Validation { fields } => Some(fields),
            _ => None,
        }
    }
}

fn format_fields(fields: &BTreeMap<String, String>) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{k}: {v}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display() {
        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), "is required".to_string());
        fields.insert("max_turns".to_string(), "must be greater than 0".to_string());
        let err = ForemanError::Validation { fields };
        assert_eq!(
            err.to_string(),
            "Validation failed: id: is required, max_turns: must be greater than 0"
        );
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_unknown_preserves_cause() {
        let err: ForemanError = anyhow::anyhow!("disk on fire").into();
        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert_eq!(err.to_string(), "disk on fire");
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::NotFound.to_string(), "not_found");
        assert_eq!(ForemanError::Timeout(Duration::from_secs(1)).kind(), ErrorKind::Timeout);
    }
}
