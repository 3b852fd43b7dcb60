//! Event-type pattern matching shared by the bus and agent triggers.
//!
//! `*` alone matches every event type. A pattern containing `*` is compiled
//! to an anchored regex where `*` becomes `.*` and every other character is
//! literal, so `code.*` matches `code.file.created` but not `codex`.
//! Anything else is compared for exact equality.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;

static COMPILED: Lazy<Mutex<HashMap<String, Regex>>> = Lazy::new(|| Mutex::new(HashMap::new()));

pub fn matches_event_pattern(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == event_type;
    }

    let mut cache = COMPILED.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(re) = cache.get(pattern) {
        return re.is_match(event_type);
    }
    match compile(pattern) {
        Ok(re) => {
            let matched = re.is_match(event_type);
            cache.insert(pattern.to_string(), re);
            matched
        }
        Err(e) => {
            tracing::warn!(pattern = %pattern, error = %e, "invalid event pattern");
            false
        }
    }
}

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{}$", body))
}
