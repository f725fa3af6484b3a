// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helpers for turning arbitrary application data into well-formed JSON documents.

use serde_json::{Map, Value};

/// Decodes `bytes` as UTF-8, dropping every invalid sequence.
///
/// Unlike [`String::from_utf8_lossy`], no replacement character is inserted: the invalid
/// bytes are replaced with the empty string so the valid text around them is preserved as is.
///
/// ```
/// use error_notifier::encoding::sanitize_utf8;
///
/// assert_eq!(sanitize_utf8(b"caf\xc3\xa9"), "café");
/// assert_eq!(sanitize_utf8(b"bad \xff\xfe bytes"), "bad  bytes");
/// ```
#[must_use]
pub fn sanitize_utf8(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        out.push_str(chunk.valid());
    }
    out
}

/// Deep-merges `overlay` into `base`.
///
/// Objects are merged key by key, recursively; any other value in `overlay` replaces the
/// value in `base`.
pub fn deep_merge(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(base_obj)), Value::Object(overlay_obj)) => {
                deep_merge(base_obj, overlay_obj);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Returns true for values the collector treats as absent: null, false, "", [] and {}.
#[must_use]
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}
