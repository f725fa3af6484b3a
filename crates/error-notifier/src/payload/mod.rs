// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The delivery envelope: `{"access_token": ..., "data": {...}}`.

pub mod builder;

use crate::config::Config;
use crate::error::TruncationError;
use crate::truncation;
use serde_json::{json, Value};
use std::sync::Arc;

/// A built report plus the configuration it was built with.
#[derive(Debug, Clone)]
pub struct Payload {
    value: Value,
    config: Arc<Config>,
}

impl Payload {
    /// Wraps a report document with the configured access token.
    #[must_use]
    pub fn new(data: Value, config: Arc<Config>) -> Self {
        let value = json!({
            "access_token": config.access_token,
            "data": data,
        });
        Payload { value, config }
    }

    /// Takes an already enveloped payload as is, e.g. one coming back from a job queue.
    #[must_use]
    pub fn from_value(value: Value, config: Arc<Config>) -> Self {
        Payload { value, config }
    }

    #[must_use]
    pub fn as_value(&self) -> &Value {
        &self.value
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        self.value
    }

    #[must_use]
    pub fn data(&self) -> &Value {
        self.value.get("data").unwrap_or(&Value::Null)
    }

    /// Token carried by the payload, or the configured one for payloads without it.
    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        self.value
            .get("access_token")
            .and_then(Value::as_str)
            .or(self.config.access_token.as_deref())
    }

    #[must_use]
    pub fn uuid(&self) -> Option<&str> {
        self.data().get("uuid").and_then(Value::as_str)
    }

    /// True when the report's person id is in `ignored_person_ids`.
    ///
    /// Numeric ids are compared by their decimal rendering.
    #[must_use]
    pub fn is_ignored(&self) -> bool {
        if self.config.ignored_person_ids.is_empty() {
            return false;
        }
        let Some(person) = self.data().get("person").and_then(Value::as_object) else {
            return false;
        };
        let id = match person.get(&self.config.person_id_field) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return false,
        };
        self.config.ignored_person_ids.contains(&id)
    }

    /// Serializes the payload, truncated to `max_payload_size`.
    pub fn dump(&self) -> Result<String, TruncationError> {
        truncation::truncate(&self.value, self.config.max_payload_size)
    }
}
