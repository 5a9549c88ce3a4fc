//! Human-in-the-loop classification.
//!
//! Deterministic: a workflow requires approval when its type is sensitive,
//! when any top-level payload key names sensitive data, or when any
//! top-level key containing `amount` carries a numeric value strictly above
//! the configured threshold. Nested structures are not inspected; designers
//! hoist sensitive fields to the top level.

use serde_json::Value;

use crate::config::HilConfig;

const SENSITIVE_TYPES: [&str; 5] = ["legal", "financial", "title", "ownership", "lien"];

const SENSITIVE_KEYS: [&str; 8] = [
    "legal_description",
    "ownership_chain",
    "lien_data",
    "judgment",
    "title_commitment",
    "deed",
    "mortgage",
    "encumbrance",
];

#[derive(Debug, Clone)]
pub struct HilPolicy {
    amount_threshold: f64,
}

impl HilPolicy {
    pub fn new(config: &HilConfig) -> Self {
        HilPolicy {
            amount_threshold: config.amount_threshold,
        }
    }

    pub fn requires_approval(&self, workflow_type: &str, payload: &Value) -> bool {
        if SENSITIVE_TYPES.contains(&workflow_type.to_lowercase().as_str()) {
            return true;
        }

        let Some(map) = payload.as_object() else {
            return false;
        };

        for (key, value) in map {
            let key = key.to_lowercase();
            if SENSITIVE_KEYS.contains(&key.as_str()) {
                return true;
            }
            if key.contains("amount") {
                if let Some(amount) = value.as_f64() {
                    if amount > self.amount_threshold {
                        return true;
                    }
                }
            }
        }

        false
    }
}

impl Default for HilPolicy {
    fn default() -> Self {
        HilPolicy::new(&HilConfig::default())
    }
}
