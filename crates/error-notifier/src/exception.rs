// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Captured application errors: class names, backtraces and cause chains.

use crate::encoding::sanitize_utf8;
use crate::error::BoxError;
use regex::Regex;
use serde::Serialize;
use std::any::TypeId;
use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::io;
use std::ptr;
use std::sync::{Arc, OnceLock};

/// Class reported for `std::io::Error`, whose `Debug` output starts with its variant name.
pub const IO_ERROR_CLASS: &str = "IoError";

/// Symbol prefixes stripped from the top of a synthesized backtrace.
const INTERNAL_FRAME_PREFIXES: &[&str] = &["backtrace::", "error_notifier::"];

/// An application error ready to be reported.
///
/// Wraps any `std::error::Error`, remembering a class name for filtering and display and an
/// optional backtrace as raw frame lines (`file:line[:col][ in method]`).
#[derive(Clone)]
pub struct Exception {
    error: Arc<dyn Error + Send + Sync + 'static>,
    class_name: String,
    backtrace: Option<Vec<String>>,
}

impl Exception {
    pub fn new<E>(error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        let class_name = if TypeId::of::<E>() == TypeId::of::<io::Error>() {
            IO_ERROR_CLASS
        } else {
            short_type_name(std::any::type_name::<E>())
        };
        Exception {
            class_name: class_name.to_string(),
            error: Arc::new(error),
            backtrace: None,
        }
    }

    /// Wraps an already boxed error. The class name is recovered from its `Debug` output.
    pub fn from_boxed(error: BoxError) -> Self {
        let error: Arc<dyn Error + Send + Sync + 'static> = Arc::from(error);
        Exception {
            class_name: dyn_class_name(&*error),
            error,
            backtrace: None,
        }
    }

    /// Wraps `error` and records the current call stack as its backtrace.
    pub fn capture<E>(error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Exception::new(error).with_backtrace(current_backtrace())
    }

    #[must_use]
    pub fn with_class_name(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = class_name.into();
        self
    }

    #[must_use]
    pub fn with_backtrace(mut self, frames: Vec<String>) -> Self {
        self.backtrace = Some(frames);
        self
    }

    /// Same as [`Exception::with_backtrace`] for frames that may not be valid UTF-8.
    #[must_use]
    pub fn with_raw_backtrace(self, frames: &[Vec<u8>]) -> Self {
        self.with_backtrace(frames.iter().map(|f| sanitize_utf8(f)).collect())
    }

    #[must_use]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    #[must_use]
    pub fn message(&self) -> String {
        self.error.to_string()
    }

    #[must_use]
    pub fn backtrace(&self) -> Option<&[String]> {
        self.backtrace.as_deref()
    }

    #[must_use]
    pub fn error(&self) -> &(dyn Error + 'static) {
        &*self.error
    }

    /// True when the error was produced inside [`silenced`].
    #[must_use]
    pub fn is_silenced(&self) -> bool {
        self.error().is::<Silenced>()
    }

    /// Walks the cause chain starting at this exception.
    ///
    /// Follows `source()` while the cause exists, differs from the current error and has not
    /// been seen yet, so cyclic graphs terminate with every distinct error visited once.
    /// Errors are told apart by address and vtable: a wrapper and the field it returns as
    /// its source may share an address.
    #[must_use]
    pub fn chain(&self) -> Vec<ChainLink<'_>> {
        let mut links = vec![ChainLink {
            class_name: self.class_name.clone(),
            message: self.message(),
            backtrace: self.backtrace(),
        }];

        let mut current = self.error();
        let mut visited: HashSet<*const (dyn Error + 'static)> = HashSet::new();
        visited.insert(current);

        while let Some(cause) = current.source() {
            if ptr::eq(cause, current) || !visited.insert(cause) {
                break;
            }
            links.push(ChainLink {
                class_name: dyn_class_name(cause),
                message: cause.to_string(),
                backtrace: None,
            });
            current = cause;
        }

        links
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exception")
            .field("class_name", &self.class_name)
            .field("message", &self.message())
            .field("frames", &self.backtrace.as_ref().map_or(0, Vec::len))
            .finish()
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class_name, self.error)
    }
}

impl<E> From<E> for Exception
where
    E: Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Exception::new(error)
    }
}

/// One error in a cause chain.
#[derive(Debug, Clone)]
pub struct ChainLink<'a> {
    pub class_name: String,
    pub message: String,
    pub backtrace: Option<&'a [String]>,
}

/// Class name of an error known only as a trait object.
fn dyn_class_name(error: &(dyn Error + 'static)) -> String {
    if error.is::<io::Error>() {
        return IO_ERROR_CLASS.to_string();
    }
    parse_type_from_debug(&format!("{error:?}")).to_string()
}

/// Returns the last path segment of a type name, without generic arguments.
fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Recovers a type name from a `Debug` rendering such as `ParseIntError { kind: Empty }`.
#[must_use]
pub fn parse_type_from_debug(debug: &str) -> &str {
    debug
        .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == ':'))
        .next()
        .filter(|name| !name.is_empty())
        .map_or("Error", |name| name.rsplit("::").next().unwrap_or(name))
}

/// A stack frame in the shape the collector expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Frame {
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lineno: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub colno: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

#[allow(clippy::expect_used)]
fn frame_regex() -> &'static Regex {
    static FRAME: OnceLock<Regex> = OnceLock::new();
    FRAME.get_or_init(|| {
        Regex::new(r"^(?P<file>.+?):(?P<lineno>\d+)(?::(?P<colno>\d+))?(?: in (?P<method>.+))?$")
            .expect("frame pattern is valid")
    })
}

/// Parses a frame line. Lines that do not match keep their raw text as the method.
#[must_use]
pub fn parse_frame(line: &str) -> Frame {
    match frame_regex().captures(line.trim()) {
        Some(caps) => Frame {
            filename: caps["file"].to_string(),
            lineno: caps["lineno"].parse().ok(),
            colno: caps.name("colno").and_then(|c| c.as_str().parse().ok()),
            method: caps.name("method").map(|m| m.as_str().to_string()),
        },
        None => Frame {
            filename: String::new(),
            lineno: None,
            colno: None,
            method: Some(line.to_string()),
        },
    }
}

/// Captures the current call stack as frame lines, innermost first.
///
/// Frames belonging to the backtrace machinery and to this crate are dropped from the top
/// so the first line points at the caller.
#[must_use]
pub fn current_backtrace() -> Vec<String> {
    let backtrace = backtrace::Backtrace::new();
    let mut lines = Vec::new();
    for frame in backtrace.frames() {
        for symbol in frame.symbols() {
            let method = symbol.name().map(|name| format!("{name:#}"));
            let filename = symbol.filename().map(path_to_string);
            let line = match (filename, symbol.lineno()) {
                (Some(file), Some(lineno)) => match (symbol.colno(), &method) {
                    (Some(col), Some(m)) => format!("{file}:{lineno}:{col} in {m}"),
                    (None, Some(m)) => format!("{file}:{lineno} in {m}"),
                    (Some(col), None) => format!("{file}:{lineno}:{col}"),
                    (None, None) => format!("{file}:{lineno}"),
                },
                _ => match method {
                    Some(m) => m,
                    None => continue,
                },
            };
            lines.push((symbol_is_internal(symbol), line));
        }
    }

    lines
        .into_iter()
        .skip_while(|(internal, _)| *internal)
        .map(|(_, line)| line)
        .collect()
}

fn symbol_is_internal(symbol: &backtrace::BacktraceSymbol) -> bool {
    symbol.name().is_some_and(|name| {
        let name = format!("{name:#}");
        let name = name.trim_start_matches('<');
        INTERNAL_FRAME_PREFIXES.iter().any(|p| name.starts_with(p))
    })
}

#[cfg(unix)]
fn path_to_string(path: &std::path::Path) -> String {
    use std::os::unix::ffi::OsStrExt;
    sanitize_utf8(path.as_os_str().as_bytes())
}

#[cfg(not(unix))]
fn path_to_string(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Error wrapper marking a failure that must not be reported.
///
/// Produced by [`silenced`]; [`Exception::is_silenced`] recognizes it.
#[derive(Debug)]
pub struct Silenced(BoxError);

impl Silenced {
    #[must_use]
    pub fn into_inner(self) -> BoxError {
        self.0
    }

    #[must_use]
    pub fn inner(&self) -> &(dyn Error + Send + Sync + 'static) {
        &*self.0
    }
}

impl fmt::Display for Silenced {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Error for Silenced {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.0.source()
    }
}

/// Runs `f`, tagging any error it returns as "do not report" before handing it back.
pub fn silenced<T, E, F>(f: F) -> Result<T, Silenced>
where
    F: FnOnce() -> Result<T, E>,
    E: Into<BoxError>,
{
    f().map_err(|e| Silenced(e.into()))
}
