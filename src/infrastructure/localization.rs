//! Recursive localization of upstream JSON payloads.
//!
//! The actual script conversion is an injected pure function (the site wires
//! in a traditional-to-simplified converter; tests and the default binary use
//! identity). This module owns the structural walk: strings are converted,
//! arrays element-wise, objects value-wise with keys untouched, and all other
//! JSON types pass through. A conversion error for one string falls back to
//! the original string so a single bad value cannot abort a whole batch.

use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

pub type StringTransform = Arc<dyn Fn(&str) -> Result<String> + Send + Sync>;

#[derive(Clone)]
pub struct Localizer {
    transform: StringTransform,
}

impl Localizer {
    pub fn new(transform: StringTransform) -> Self {
        Self { transform }
    }

    /// Pass-through localizer for deployments that serve the original script.
    pub fn identity() -> Self {
        Self { transform: Arc::new(|s| Ok(s.to_string())) }
    }

    /// Convert one string, falling back to the input on conversion failure.
    pub fn text(&self, s: &str) -> String {
        match (self.transform)(s) {
            Ok(converted) => converted,
            Err(e) => {
                warn!("Localization failed, keeping original text: {e:#}");
                s.to_string()
            }
        }
    }

    /// Recursively localize a JSON value. Never fails for well-formed JSON.
    pub fn localize(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.text(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.localize(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.localize(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}
