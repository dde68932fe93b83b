//! Redaction engine
//!
//! Masks configured header names and field names before an event is admitted
//! anywhere downstream. Matching is case-insensitive. Field names are matched
//! at every depth of nested objects and arrays; the whole value under a
//! matching key is replaced by the mask token, everything else is left as is.
//!
//! Redaction is idempotent: masked values are replaced by the same token again.

use crate::config::RedactionConfig;
use crate::observability::model::{CapturedBody, RequestHit, RuntimeLogEntry};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone)]
pub struct Redactor {
    headers: HashSet<String>,
    fields: HashSet<String>,
    mask: String,
    mask_unstructured: bool,
}

impl Redactor {
    pub fn new(config: &RedactionConfig) -> Self {
        Self {
            headers: config.mask_headers.iter().map(|h| h.to_ascii_lowercase()).collect(),
            fields: config.mask_body_fields.iter().map(|f| f.to_ascii_lowercase()).collect(),
            mask: config.mask_token.clone(),
            mask_unstructured: config.mask_unstructured_bodies,
        }
    }

    pub fn mask_token(&self) -> &str {
        &self.mask
    }

    pub fn redact_hit(&self, hit: &mut RequestHit) {
        self.redact_headers(&mut hit.request_headers);
        self.redact_headers(&mut hit.response_headers);
        self.redact_fields(&mut hit.query);
        if let Some(body) = hit.request_body.as_mut() {
            self.redact_body(body);
        }
        if let Some(body) = hit.response_body.as_mut() {
            self.redact_body(body);
        }
    }

    pub fn redact_log(&self, entry: &mut RuntimeLogEntry) {
        for (key, value) in entry.payload.iter_mut() {
            if self.is_sensitive_field(key) {
                *value = Value::String(self.mask.clone());
            } else {
                self.redact_value(value);
            }
        }
    }

    pub fn redact_headers(&self, headers: &mut BTreeMap<String, String>) {
        for (name, value) in headers.iter_mut() {
            if self.headers.contains(&name.to_ascii_lowercase()) {
                *value = self.mask.clone();
            }
        }
    }

    /// Mask flat string maps (query parameters) by field name
    pub fn redact_fields(&self, fields: &mut BTreeMap<String, String>) {
        for (name, value) in fields.iter_mut() {
            if self.is_sensitive_field(name) {
                *value = self.mask.clone();
            }
        }
    }

    pub fn redact_body(&self, body: &mut CapturedBody) {
        match body {
            CapturedBody::Json { value } => self.redact_value(value),
            CapturedBody::Text { text, truncated, .. } => {
                if self.mask_unstructured {
                    *text = self.mask.clone();
                    *truncated = false;
                }
            }
            CapturedBody::Omitted { .. } => {}
        }
    }

    /// Recursively mask sensitive keys through objects and arrays
    pub fn redact_value(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    if self.is_sensitive_field(key) {
                        *child = Value::String(self.mask.clone());
                    } else {
                        self.redact_value(child);
                    }
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.redact_value(item);
                }
            }
            _ => {}
        }
    }

    fn is_sensitive_field(&self, name: &str) -> bool {
        !self.fields.is_empty() && self.fields.contains(&name.to_ascii_lowercase())
    }
}
