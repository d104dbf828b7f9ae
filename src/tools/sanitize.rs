//! Tool output sanitization.
//!
//! Output is truncated and redacted before it ever reaches the prompt
//! assembler or the audit log. The sensitive-pattern set comes from
//! configuration, not code.

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;

use crate::config::ToolingConfig;

const REDACTION: &str = "[redacted]";
const TRUNCATION_MARKER: &str = " …[truncated]";

/// Applies truncation and pattern redaction to tool output.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    max_output_bytes: usize,
    patterns: Vec<Regex>,
}

impl Sanitizer {
    pub fn new(config: &ToolingConfig) -> Result<Self> {
        let patterns = config
            .redact_patterns
            .iter()
            .map(|p| {
                Regex::new(p).with_context(|| format!("invalid redaction pattern '{}'", p))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            max_output_bytes: config.max_tool_output_bytes.max(64),
            patterns,
        })
    }

    /// Redact sensitive substrings, then truncate to the configured length.
    pub fn sanitize_text(&self, text: &str) -> String {
        let mut sanitized = text.to_string();
        for pattern in &self.patterns {
            sanitized = pattern.replace_all(&sanitized, REDACTION).into_owned();
        }

        if sanitized.len() > self.max_output_bytes {
            let cut = floor_char_boundary(&sanitized, self.max_output_bytes);
            sanitized.truncate(cut);
            sanitized.push_str(TRUNCATION_MARKER);
        }
        sanitized
    }

    /// Walk a JSON value, sanitizing every string in place.
    pub fn sanitize_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.sanitize_text(s)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.sanitize_value(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.sanitize_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut cut = index;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    cut
}
