use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// Step names used as ledger keys. Named after what the step does so the
/// response payload reads without further context.
pub mod steps {
    pub const STRIP_DUPLICATE_TITLE: &str = "strip_duplicate_title";
    pub const MIRROR_IMAGES: &str = "mirror_images";
    pub const FORMAT_DATES: &str = "format_dates";
    pub const CONTENT_TYPE_TERM: &str = "content_type_term";
    pub const BRAND_DIVISION_TERM: &str = "brand_division_term";
    pub const PRODUCT_TERMS: &str = "product_terms";
    pub const SERVER_TYPE_TERM: &str = "server_type_term";
    pub const PRODUCT_TYPE_TERM: &str = "product_type_term";
    pub const PERSIST_ATTACHMENTS: &str = "persist_attachments";
    pub const PUBLICATION: &str = "publication";
    pub const UPSERT_DOCUMENT: &str = "upsert_document";
    pub const GENERATE_ALIAS: &str = "generate_alias";
    pub const SAVE_ALIAS: &str = "save_alias";
}

/// Per-request ledger of failing steps, keyed by `(external_id, step)`.
///
/// A failing step writes its message, a succeeding step removes the entry,
/// so at any point the ledger holds only the steps that are *currently*
/// failing for each record. Last write wins.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsLog {
    entries: BTreeMap<(String, String), String>,
}

impl DiagnosticsLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&mut self, external_id: &str, step: &str, message: impl Into<String>) {
        self.entries
            .insert((external_id.to_string(), step.to_string()), message.into());
    }

    pub fn record_success(&mut self, external_id: &str, step: &str) {
        self.entries
            .remove(&(external_id.to_string(), step.to_string()));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, external_id: &str, step: &str) -> Option<&str> {
        self.entries
            .get(&(external_id.to_string(), step.to_string()))
            .map(String::as_str)
    }

    /// Render the ledger as `{external_id: {step: message}}` for the
    /// response payload.
    pub fn to_json(&self) -> Value {
        let mut by_record: Map<String, Value> = Map::new();
        for ((external_id, step), message) in &self.entries {
            let record = by_record
                .entry(external_id.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(steps) = record {
                steps.insert(step.clone(), Value::String(message.clone()));
            }
        }
        Value::Object(by_record)
    }
}
