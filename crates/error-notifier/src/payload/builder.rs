// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Assembles report documents from a level, message, exception and extra data.

use crate::config::{Config, CustomDataContext};
use crate::encoding::{deep_merge, is_blank};
use crate::error::{BoxError, BuildError};
use crate::exception::{current_backtrace, parse_frame, ChainLink, Exception, Frame};
use crate::hostname::get_hostname;
use crate::level::Level;
use crate::notifier::{instance_url, LogOutcome, Notifier};
use crate::payload::Payload;
use serde_json::{json, Map, Value};
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error};
use uuid::Uuid;

pub const NOTIFIER_NAME: &str = "error-notifier";
pub const NOTIFIER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const LANGUAGE: &str = "rust";
pub const EMPTY_MESSAGE: &str = "Empty message";
/// Key of the `extra` entry linking to the report of a failed custom data provider.
pub const CUSTOM_DATA_ERROR_KEY: &str = "_error_in_custom_data_method";

/// Inputs of a single report.
#[derive(Debug, Clone, Copy)]
pub struct ReportInput<'a> {
    pub level: Level,
    pub message: Option<&'a str>,
    pub exception: Option<&'a Exception>,
    pub extra: Option<&'a Map<String, Value>>,
}

pub struct PayloadBuilder<'a> {
    notifier: &'a Notifier,
}

impl<'a> PayloadBuilder<'a> {
    #[must_use]
    pub fn new(notifier: &'a Notifier) -> Self {
        PayloadBuilder { notifier }
    }

    fn config(&self) -> &Arc<Config> {
        self.notifier.config()
    }

    /// Builds the payload, reporting a failing custom data provider on the side.
    ///
    /// Fails only when user code invoked during assembly panics.
    pub async fn build(&self, input: ReportInput<'_>) -> Result<Payload, BuildError> {
        let custom = match self.call_custom_data(&input) {
            None => None,
            Some(Ok(data)) => Some(data),
            Some(Err(e)) if self.config().safely => {
                debug!("Custom data provider failed while reporting safely: {}", e);
                Some(Map::new())
            }
            Some(Err(e)) => Some(self.report_custom_data_error(e).await),
        };
        self.assemble(input, custom)
    }

    /// Like [`PayloadBuilder::build`] but never reports anything: a failing custom data
    /// provider contributes nothing.
    pub fn build_safely(&self, input: ReportInput<'_>) -> Result<Payload, BuildError> {
        let custom = match self.call_custom_data(&input) {
            None => None,
            Some(Ok(data)) => Some(data),
            Some(Err(e)) => {
                debug!("Custom data provider failed while reporting safely: {}", e);
                None
            }
        };
        self.assemble(input, custom)
    }

    fn call_custom_data(
        &self,
        input: &ReportInput<'_>,
    ) -> Option<Result<Map<String, Value>, BoxError>> {
        let provider = self.config().custom_data_method.as_ref()?;
        let context = CustomDataContext {
            level: input.level,
            message: input.message,
            exception: input.exception,
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| provider(&context)))
            .unwrap_or_else(|panic| Err(panic_message(panic).into()));
        Some(result)
    }

    /// Reports the provider failure with a safely-scoped notifier and returns a link to it.
    fn report_custom_data_error(
        &self,
        error: BoxError,
    ) -> Pin<Box<dyn Future<Output = Map<String, Value>> + Send + '_>> {
        Box::pin(async move {
            error!("Error in custom data provider: {}", error);
            let exception = Exception::from_boxed(error);
            let mut marker = Map::new();
            if let LogOutcome::Reported(data) = self.notifier.safely().error(exception).await {
                if let Some(uuid) = data.get("uuid").and_then(Value::as_str) {
                    marker.insert(
                        CUSTOM_DATA_ERROR_KEY.to_string(),
                        json!(instance_url(&self.config().web_base, uuid)),
                    );
                }
            }
            marker
        })
    }

    fn assemble(
        &self,
        input: ReportInput<'_>,
        custom: Option<Map<String, Value>>,
    ) -> Result<Payload, BuildError> {
        let data = panic::catch_unwind(AssertUnwindSafe(|| self.build_data(input, custom)))
            .map_err(|panic| BuildError::Panic(panic_message(panic)))?;
        Ok(Payload::new(data, Arc::clone(self.config())))
    }

    fn build_data(&self, input: ReportInput<'_>, custom: Option<Map<String, Value>>) -> Value {
        let config = self.config();
        let mut data = Map::new();

        data.insert("timestamp".to_string(), json!(unix_timestamp()));
        data.insert(
            "environment".to_string(),
            json!(config.environment_name()),
        );
        data.insert("level".to_string(), json!(input.level));
        data.insert("language".to_string(), json!(LANGUAGE));
        if let Some(framework) = &config.framework {
            data.insert("framework".to_string(), json!(framework));
        }
        data.insert("server".to_string(), server_data(config));
        data.insert(
            "notifier".to_string(),
            json!({"name": NOTIFIER_NAME, "version": NOTIFIER_VERSION}),
        );
        data.insert("body".to_string(), self.build_body(input, custom));
        if !config.project_package_paths.is_empty() {
            data.insert(
                "project_package_paths".to_string(),
                json!(config.project_package_paths),
            );
        }
        if let Some(code_version) = &config.code_version {
            data.insert("code_version".to_string(), json!(code_version));
        }
        data.insert("uuid".to_string(), json!(Uuid::new_v4().to_string()));

        deep_merge(&mut data, config.payload_options.values());
        for (key, generate) in config.payload_options.computed() {
            data.insert(key.to_string(), generate());
        }
        if data.get("context").is_some_and(is_blank) {
            data.remove("context");
        }

        Value::Object(data)
    }

    fn build_body(&self, input: ReportInput<'_>, custom: Option<Map<String, Value>>) -> Value {
        let extra = merge_extra(custom, input.extra);

        let Some(exception) = input.exception else {
            let mut message = Map::new();
            message.insert(
                "body".to_string(),
                json!(input.message.unwrap_or(EMPTY_MESSAGE)),
            );
            if let Some(extra) = extra {
                message.insert("extra".to_string(), Value::Object(extra));
            }
            return json!({ "message": message });
        };

        let mut traces: Vec<Value> = exception
            .chain()
            .iter()
            .enumerate()
            .map(|(i, link)| self.trace_data(link, i == 0))
            .collect();

        if let Some(Value::Object(first)) = traces.first_mut() {
            if let Some(description) = input.message {
                if let Some(Value::Object(exc)) = first.get_mut("exception") {
                    exc.insert("description".to_string(), json!(description));
                }
            }
            if let Some(extra) = extra {
                first.insert("extra".to_string(), Value::Object(extra));
            }
        }

        if traces.len() > 1 {
            json!({ "trace_chain": traces })
        } else {
            json!({ "trace": traces.pop().unwrap_or_default() })
        }
    }

    /// Trace record of one link. A missing backtrace is only synthesized for the outermost
    /// link, since the current stack says nothing about where a cause was created.
    fn trace_data(&self, link: &ChainLink<'_>, outermost: bool) -> Value {
        let frames: Vec<Frame> = match link.backtrace {
            Some(lines) => lines.iter().rev().map(|line| parse_frame(line)).collect(),
            None if outermost && self.config().populate_empty_backtraces => current_backtrace()
                .iter()
                .rev()
                .map(|line| parse_frame(line))
                .collect(),
            None => Vec::new(),
        };

        json!({
            "frames": frames,
            "exception": {
                "class": link.class_name,
                "message": link.message,
            },
        })
    }
}

/// Custom data with the caller's extra deep-merged on top. Empty results are dropped.
fn merge_extra(
    custom: Option<Map<String, Value>>,
    extra: Option<&Map<String, Value>>,
) -> Option<Map<String, Value>> {
    let mut merged = custom.unwrap_or_default();
    if let Some(extra) = extra {
        deep_merge(&mut merged, extra);
    }
    (!merged.is_empty()).then_some(merged)
}

fn server_data(config: &Config) -> Value {
    let mut server = Map::new();
    let host = config.host.clone().unwrap_or_else(get_hostname);
    server.insert("host".to_string(), json!(host));
    server.insert("pid".to_string(), json!(std::process::id()));
    if let Some(root) = &config.root {
        server.insert("root".to_string(), json!(root));
    }
    if let Some(branch) = &config.branch {
        server.insert("branch".to_string(), json!(branch));
    }
    Value::Object(server)
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
