use std::collections::HashMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

/// Per-run data shared between nodes.
///
/// Holds the submitted prompt under `input`, each resolved node's output
/// under its id, and `<id>_status` (`success` / `failure`) for conditional
/// edges. Discarded when the next run starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunContext {
    data: HashMap<String, serde_json::Value>,
}

impl RunContext {
    pub fn new(prompt: impl Into<String>) -> Self {
        let mut ctx = Self::default();
        ctx.set_str("input", prompt);
        ctx
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    /// Store a node's output and outcome.
    ///
    /// JSON object outputs are kept structured so `{{node.field}}` can reach
    /// into them; anything else is stored as text.
    pub fn record_output(&mut self, node_id: &str, output: &str, succeeded: bool) {
        let value = match serde_json::from_str::<serde_json::Value>(output) {
            Ok(json) if json.is_object() => json,
            _ => serde_json::Value::String(output.to_string()),
        };
        self.data.insert(node_id.to_string(), value);
        self.set_str(
            format!("{}_status", node_id),
            if succeeded { "success" } else { "failure" },
        );
    }

    /// Text form of a stored output.
    pub fn output_text(&self, node_id: &str) -> Option<String> {
        self.data.get(node_id).map(display_value)
    }

    /// Replace `{{key}}` and `{{node.field}}` placeholders.
    ///
    /// Unknown keys fall back to the run input; without an input the
    /// placeholder is left untouched.
    pub fn substitute(&self, template: &str) -> String {
        placeholder_re()
            .replace_all(template, |caps: &Captures| self.resolve(caps))
            .into_owned()
    }

    pub fn data(&self) -> &HashMap<String, serde_json::Value> {
        &self.data
    }

    fn resolve(&self, caps: &Captures) -> String {
        let name = &caps[1];

        if let Some(value) = self.data.get(name) {
            return display_value(value);
        }

        if let Some((node, field)) = name.split_once('.') {
            if let Some(value) = self.data.get(node).and_then(|v| v.get(field)) {
                return display_value(value);
            }
        }

        match self.get_str("input") {
            Some(input) => input.to_string(),
            None => caps[0].to_string(),
        }
    }
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{(\w+(?:\.\w+)?)\}\}").expect("placeholder regex"))
}

/// Render a context value as prompt text.
///
/// Objects with a `response` key render as that response.
fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => match map.get("response") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => value.to_string(),
        },
        other => other.to_string(),
    }
}
