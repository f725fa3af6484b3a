// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shrinks serialized payloads until they fit under the size ceiling.
//!
//! Strategies run in order, each one working on the output of the previous one:
//!
//! 1. raw: the payload as built
//! 2. frames: keep the first and last [`FRAMES_RANGE`] frames of every trace
//! 3. strings: cap every string at 1024, then 512, then 256 bytes; exception class and
//!    message are left for the next step
//! 4. min body: cap exception messages at [`MIN_BODY_MESSAGE_LENGTH`] and keep only the
//!    first and last frame
//! 5. drop `data.request`
//! 6. drop `extra` from the body
//!
//! Every attempt is serialized from a `serde_json::Value`, so the output is always a
//! complete JSON document.

use crate::error::TruncationError;
use serde_json::{Map, Value};
use tracing::debug;

pub const FRAMES_RANGE: usize = 50;
pub const STRING_THRESHOLDS: [usize; 3] = [1024, 512, 256];
pub const MIN_BODY_MESSAGE_LENGTH: usize = 255;

const ELLIPSIS: &str = "...";

/// True when the serialized payload is over `max_size` bytes.
#[must_use]
pub fn needs_truncation(serialized: &str, max_size: usize) -> bool {
    serialized.len() > max_size
}

/// Serializes `payload`, shrinking it as needed to stay within `max_size` bytes.
pub fn truncate(payload: &Value, max_size: usize) -> Result<String, TruncationError> {
    let mut attempts = Vec::new();

    let raw = serde_json::to_string(payload).unwrap_or_default();
    let original_size = raw.len();
    attempts.push(original_size);
    if !needs_truncation(&raw, max_size) {
        return Ok(raw);
    }

    debug!("Payload of {original_size} bytes exceeds {max_size} bytes, truncating");
    let mut working = payload.clone();

    let attempt = |working: &Value, attempts: &mut Vec<usize>| -> Option<String> {
        let result = serde_json::to_string(working).unwrap_or_default();
        attempts.push(result.len());
        (!needs_truncation(&result, max_size)).then_some(result)
    };

    for_each_trace(&mut working, |trace| select_frames(trace, FRAMES_RANGE));
    if let Some(result) = attempt(&working, &mut attempts) {
        return Ok(result);
    }

    for threshold in STRING_THRESHOLDS {
        truncate_strings(&mut working, threshold, false);
        if let Some(result) = attempt(&working, &mut attempts) {
            return Ok(result);
        }
    }

    for_each_trace(&mut working, |trace| {
        if let Some(Value::Object(exception)) = trace.get_mut("exception") {
            for key in ["message", "description"] {
                if let Some(Value::String(s)) = exception.get_mut(key) {
                    *s = truncate_str(s, MIN_BODY_MESSAGE_LENGTH);
                }
            }
        }
        select_frames(trace, 1);
    });
    if let Some(Value::String(s)) = working.pointer_mut("/data/body/message/body") {
        *s = truncate_str(s, MIN_BODY_MESSAGE_LENGTH);
    }
    if let Some(result) = attempt(&working, &mut attempts) {
        return Ok(result);
    }

    if let Some(Value::Object(data)) = working.get_mut("data") {
        data.remove("request");
    }
    if let Some(result) = attempt(&working, &mut attempts) {
        return Ok(result);
    }

    if let Some(Value::Object(message)) = working.pointer_mut("/data/body/message") {
        message.remove("extra");
    }
    for_each_trace(&mut working, |trace| {
        trace.remove("extra");
    });
    if let Some(result) = attempt(&working, &mut attempts) {
        return Ok(result);
    }

    Err(TruncationError::TooLarge {
        original_size,
        attempts,
    })
}

/// Applies `f` to the `trace` object and to every `trace_chain` entry of the body.
fn for_each_trace<F>(payload: &mut Value, mut f: F)
where
    F: FnMut(&mut Map<String, Value>),
{
    let Some(Value::Object(body)) = payload.pointer_mut("/data/body") else {
        return;
    };
    if let Some(Value::Object(trace)) = body.get_mut("trace") {
        f(trace);
    }
    if let Some(Value::Array(chain)) = body.get_mut("trace_chain") {
        for trace in chain.iter_mut().filter_map(Value::as_object_mut) {
            f(trace);
        }
    }
}

/// Keeps the first and last `range` frames when a trace has more than `2 * range`.
fn select_frames(trace: &mut Map<String, Value>, range: usize) {
    if let Some(Value::Array(frames)) = trace.get_mut("frames") {
        if frames.len() > range * 2 {
            let tail = frames.split_off(frames.len() - range);
            frames.truncate(range);
            frames.extend(tail);
        }
    }
}

/// Caps every string under `value` at `threshold` bytes, skipping exception class and
/// message.
fn truncate_strings(value: &mut Value, threshold: usize, in_exception: bool) {
    match value {
        Value::String(s) => {
            if s.len() > threshold {
                *s = truncate_str(s, threshold);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                truncate_strings(item, threshold, false);
            }
        }
        Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                if in_exception && (key == "class" || key == "message") {
                    continue;
                }
                truncate_strings(item, threshold, key == "exception");
            }
        }
        _ => {}
    }
}

/// Cuts `s` to at most `max_bytes` bytes on a char boundary, ending with "...".
#[must_use]
pub fn truncate_str(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    if max_bytes <= ELLIPSIS.len() {
        return ELLIPSIS[..max_bytes].to_string();
    }
    let mut end = max_bytes - ELLIPSIS.len();
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &s[..end], ELLIPSIS)
}
