// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reporting entry points and the delivery pipeline.
//!
//! A [`Notifier`] owns an immutable configuration snapshot. Reports go through
//! filter, build, ignore check and schedule; scheduling either delivers inline or hands the
//! payload to an [`AsyncHandler`](crate::handlers::AsyncHandler). Failures inside the
//! pipeline never reach the caller: they end up as an internal error report or, when that
//! fails too, as a minimal failsafe message.

use crate::config::{Config, FilterAction, PayloadOptions};
use crate::error::{BoxError, DeliveryError, TruncationError};
use crate::exception::{self, Exception, Silenced};
use crate::global;
use crate::handlers::AsyncHandler;
use crate::http;
use crate::level::Level;
use crate::payload::builder::{PayloadBuilder, ReportInput, NOTIFIER_NAME, NOTIFIER_VERSION};
use crate::payload::Payload;
use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const FAILSAFE_PREFIX: &str = "Failsafe from error-notifier.";

/// Serializes appends to the payload file across every notifier in the process.
static FILE_LOCK: Mutex<()> = Mutex::new(());

/// Link to a report in the collector UI.
#[must_use]
pub fn instance_url(web_base: &str, uuid: &str) -> String {
    format!(
        "{}/instance/uuid?uuid={}",
        web_base.trim_end_matches('/'),
        uuid
    )
}

/// One positional argument of [`Notifier::log`].
#[derive(Debug, Clone)]
pub enum LogArg {
    Message(String),
    Exception(Exception),
    Extra(Map<String, Value>),
}

impl From<&str> for LogArg {
    fn from(message: &str) -> Self {
        LogArg::Message(message.to_string())
    }
}

impl From<String> for LogArg {
    fn from(message: String) -> Self {
        LogArg::Message(message)
    }
}

impl From<Exception> for LogArg {
    fn from(exception: Exception) -> Self {
        LogArg::Exception(exception)
    }
}

impl From<Map<String, Value>> for LogArg {
    fn from(extra: Map<String, Value>) -> Self {
        LogArg::Extra(extra)
    }
}

/// Arguments of a report, classified by kind.
///
/// Built from any mix of [`LogArg`]s; when a kind appears more than once the last one wins.
#[derive(Debug, Clone, Default)]
pub struct LogArgs {
    pub message: Option<String>,
    pub exception: Option<Exception>,
    pub extra: Option<Map<String, Value>>,
    /// Apply `exception_level_filters` to this report
    pub use_exception_level_filters: bool,
}

impl LogArgs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn exception(mut self, exception: impl Into<Exception>) -> Self {
        self.exception = Some(exception.into());
        self
    }

    #[must_use]
    pub fn extra(mut self, extra: Map<String, Value>) -> Self {
        self.extra = Some(extra);
        self
    }

    #[must_use]
    pub fn use_exception_level_filters(mut self, enabled: bool) -> Self {
        self.use_exception_level_filters = enabled;
        self
    }

    fn push(&mut self, arg: LogArg) {
        match arg {
            LogArg::Message(message) => self.message = Some(message),
            LogArg::Exception(exception) => self.exception = Some(exception),
            LogArg::Extra(extra) => self.extra = Some(extra),
        }
    }

    fn is_empty(&self) -> bool {
        self.message.is_none() && self.exception.is_none() && self.extra.is_none()
    }
}

impl FromIterator<LogArg> for LogArgs {
    fn from_iter<I: IntoIterator<Item = LogArg>>(iter: I) -> Self {
        let mut args = LogArgs::default();
        for arg in iter {
            args.push(arg);
        }
        args
    }
}

impl From<LogArg> for LogArgs {
    fn from(arg: LogArg) -> Self {
        std::iter::once(arg).collect()
    }
}

impl From<&str> for LogArgs {
    fn from(message: &str) -> Self {
        LogArgs::new().message(message)
    }
}

impl From<String> for LogArgs {
    fn from(message: String) -> Self {
        LogArgs::new().message(message)
    }
}

impl From<Exception> for LogArgs {
    fn from(exception: Exception) -> Self {
        LogArgs::new().exception(exception)
    }
}

impl From<Map<String, Value>> for LogArgs {
    fn from(extra: Map<String, Value>) -> Self {
        LogArgs::new().extra(extra)
    }
}

impl From<Vec<LogArg>> for LogArgs {
    fn from(args: Vec<LogArg>) -> Self {
        args.into_iter().collect()
    }
}

impl<const N: usize> From<[LogArg; N]> for LogArgs {
    fn from(args: [LogArg; N]) -> Self {
        args.into_iter().collect()
    }
}

/// What [`Notifier::log`] did with a report.
#[derive(Debug, Clone, PartialEq)]
pub enum LogOutcome {
    /// Reporting is turned off
    Disabled,
    /// Dropped by a filter, the silenced marker or the ignored person list
    Ignored,
    /// The report could not be built or delivered; details are in the logs
    Error,
    /// The report document as scheduled
    Reported(Value),
}

impl LogOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LogOutcome::Disabled => "disabled",
            LogOutcome::Ignored => "ignored",
            LogOutcome::Error => "error",
            LogOutcome::Reported(_) => "reported",
        }
    }

    #[must_use]
    pub fn data(&self) -> Option<&Value> {
        match self {
            LogOutcome::Reported(data) => Some(data),
            _ => None,
        }
    }

    #[must_use]
    pub fn uuid(&self) -> Option<&str> {
        self.data()?.get("uuid")?.as_str()
    }
}

#[derive(Clone)]
pub struct Notifier {
    config: Arc<Config>,
    client: Arc<OnceLock<reqwest::Client>>,
    last_report: Arc<Mutex<Option<Value>>>,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Notifier {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        Notifier {
            config,
            client: Arc::new(OnceLock::new()),
            last_report: Arc::new(Mutex::new(None)),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Child notifier with `options` deep-merged into the payload overlay.
    ///
    /// The parent is left untouched and the child keeps its own last report.
    #[must_use]
    pub fn scope(&self, options: &PayloadOptions) -> Notifier {
        self.derive(self.config.merged(options))
    }

    /// Merges `options` into this notifier's own configuration.
    pub fn scope_mut(&mut self, options: &PayloadOptions) {
        Arc::make_mut(&mut self.config)
            .payload_options
            .merge(options);
    }

    /// Child notifier whose own failures are never reported again.
    #[must_use]
    pub fn safely(&self) -> Notifier {
        let mut config = (*self.config).clone();
        config.safely = true;
        self.derive(config)
    }

    fn derive(&self, config: Config) -> Notifier {
        Notifier {
            config: Arc::new(config),
            client: Arc::clone(&self.client),
            last_report: Arc::new(Mutex::new(None)),
        }
    }

    /// Runs `f`, marking any error it returns so that reporting it is a no-op.
    pub fn silenced<T, E, F>(f: F) -> Result<T, Silenced>
    where
        F: FnOnce() -> Result<T, E>,
        E: Into<BoxError>,
    {
        exception::silenced(f)
    }

    /// The document of the last report scheduled by this notifier.
    #[must_use]
    pub fn last_report(&self) -> Option<Value> {
        self.last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn debug(&self, args: impl Into<LogArgs>) -> LogOutcome {
        self.log(Level::Debug, args).await
    }

    pub async fn info(&self, args: impl Into<LogArgs>) -> LogOutcome {
        self.log(Level::Info, args).await
    }

    pub async fn warning(&self, args: impl Into<LogArgs>) -> LogOutcome {
        self.log(Level::Warning, args).await
    }

    pub async fn error(&self, args: impl Into<LogArgs>) -> LogOutcome {
        self.log(Level::Error, args).await
    }

    pub async fn critical(&self, args: impl Into<LogArgs>) -> LogOutcome {
        self.log(Level::Critical, args).await
    }

    /// Reports a message, an exception, extra data or any combination of them.
    ///
    /// Never fails: problems along the way are logged and turned into
    /// [`LogOutcome::Error`].
    pub async fn log(&self, level: Level, args: impl Into<LogArgs>) -> LogOutcome {
        if !self.config.enabled {
            return LogOutcome::Disabled;
        }

        let args = args.into();
        let mut level = level;
        if let Some(exception) = &args.exception {
            if exception.is_silenced() {
                debug!("Skipping silenced {}", exception.class_name());
                return LogOutcome::Ignored;
            }
            if args.use_exception_level_filters {
                match self.filter_exception(exception) {
                    Some(FilterAction::Ignore) => return LogOutcome::Ignored,
                    Some(FilterAction::Level(filtered)) => level = filtered,
                    None => {}
                }
            }
        }

        self.report(level, &args).await
    }

    fn filter_exception(&self, exception: &Exception) -> Option<FilterAction> {
        self.config
            .exception_level_filters
            .get(exception.class_name())
            .map(|filter| filter.resolve(exception))
    }

    async fn report(&self, level: Level, args: &LogArgs) -> LogOutcome {
        if args.is_empty() {
            error!("Tried to send a report with no message, exception or extra data.");
            return LogOutcome::Error;
        }

        let input = ReportInput {
            level,
            message: args.message.as_deref(),
            exception: args.exception.as_ref(),
            extra: args.extra.as_ref(),
        };
        let payload = match PayloadBuilder::new(self).build(input).await {
            Ok(payload) => payload,
            Err(e) => {
                error!("Error reporting exception: {}", e);
                self.report_internal_error(&Exception::new(e)).await;
                return LogOutcome::Error;
            }
        };

        if payload.is_ignored() {
            debug!("Report ignored for person in ignored_person_ids");
            return LogOutcome::Ignored;
        }

        if let Err(e) = self.schedule_payload(&payload).await {
            error!("Error reporting exception: {}", e);
            return LogOutcome::Error;
        }

        let data = payload.data().clone();
        self.log_instance_link(&data);
        *self
            .last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(data.clone());
        LogOutcome::Reported(data)
    }

    fn log_instance_link(&self, data: &Value) -> Option<String> {
        let uuid = data.get("uuid").and_then(Value::as_str)?;
        let url = instance_url(&self.config.web_base, uuid);
        info!("Details: {} (only available if report was successful)", url);
        Some(url)
    }

    /// Delivers `payload` inline or hands it to the async backend.
    ///
    /// Only inline delivery can fail; backend failures are handled through the failover
    /// handlers.
    pub async fn schedule_payload(&self, payload: &Payload) -> Result<(), DeliveryError> {
        debug!("Scheduling payload");
        if self.config.use_async {
            self.process_async_payload(payload);
            Ok(())
        } else {
            self.process_payload(payload).await
        }
    }

    fn process_async_payload(&self, payload: &Payload) {
        let handler = self
            .config
            .async_handler
            .clone()
            .unwrap_or(AsyncHandler::Spawn);

        if let Err(e) = handler.call(payload.as_value().clone()) {
            if self.config.failover_handlers.is_empty() {
                error!("Error processing the payload asynchronously: {}", e);
                return;
            }
            warn!("Primary async handler failed: {}. Trying failovers...", e);
            self.async_failover(payload);
        }
    }

    fn async_failover(&self, payload: &Payload) {
        let mut last_error = None;
        for handler in &self.config.failover_handlers {
            match handler.call(payload.as_value().clone()) {
                Ok(()) => return,
                Err(e) => {
                    debug!("Failover handler {:?} failed: {}", handler, e);
                    last_error = Some(e);
                }
            }
        }
        if let Some(e) = last_error {
            error!("All failover handlers failed while processing payload: {}", e);
        }
    }

    /// Writes or sends `payload`.
    ///
    /// A payload that cannot be truncated under the size ceiling is replaced by a failsafe
    /// message describing its size.
    pub async fn process_payload(&self, payload: &Payload) -> Result<(), DeliveryError> {
        match self.deliver(payload).await {
            Err(DeliveryError::TooLarge(e)) => {
                let message = too_large_message(&e, payload);
                self.send_failsafe(&message, None).await;
                Err(DeliveryError::TooLarge(e))
            }
            Err(e) => {
                error!("Error processing the payload: {}", e);
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }

    /// Like [`Notifier::process_payload`] with failures turned into an internal error
    /// report.
    pub async fn process_payload_safely(&self, payload: &Payload) {
        if let Err(e) = self.process_payload_reporting_errors(payload).await {
            debug!("Payload processing failed: {}", e);
        }
    }

    /// Processes a payload coming back from a job queue.
    pub async fn process_raw_safely(&self, payload: Value) {
        let payload = Payload::from_value(payload, Arc::clone(&self.config));
        self.process_payload_safely(&payload).await;
    }

    /// Entry point for async backends and external job queues.
    ///
    /// Rebuilds a notifier from the process-wide configuration and processes `payload`.
    /// Failures are reported internally and also returned, so a job system can retry.
    pub async fn process_from_async_handler(payload: Value) -> Result<(), Exception> {
        let notifier = Notifier::new(global::configuration());
        let payload = Payload::from_value(payload, Arc::clone(&notifier.config));
        notifier.process_payload_reporting_errors(&payload).await
    }

    async fn process_payload_reporting_errors(&self, payload: &Payload) -> Result<(), Exception> {
        match self.process_payload(payload).await {
            Ok(()) => Ok(()),
            // Already replaced by a failsafe.
            Err(e @ DeliveryError::TooLarge(_)) => Err(Exception::new(e)),
            Err(e) => {
                let exception = Exception::new(e);
                self.report_internal_error(&exception).await;
                Err(exception)
            }
        }
    }

    async fn deliver(&self, payload: &Payload) -> Result<(), DeliveryError> {
        let body = payload.dump()?;
        if self.config.write_to_file {
            self.write_payload(&body)
        } else {
            self.send_payload(payload, body).await
        }
    }

    fn write_payload(&self, body: &str) -> Result<(), DeliveryError> {
        let _guard = FILE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.filepath)?;
        writeln!(file, "{body}")?;
        file.flush()?;
        debug!("Payload written to {}", self.config.filepath.display());
        Ok(())
    }

    async fn send_payload(&self, payload: &Payload, body: String) -> Result<(), DeliveryError> {
        let token = payload
            .access_token()
            .ok_or(DeliveryError::MissingAccessToken)?;
        let client = self.client.get_or_init(|| http::get_client(&self.config));

        let response = http::post_payload(client, &self.config.endpoint, token, body).await?;
        let status = response.status();
        if status == StatusCode::OK {
            debug!("Payload delivered");
        } else {
            let text = response.text().await.unwrap_or_default();
            warn!("Got unexpected status code from collector api: {}", status);
            debug!("Response body: {}", text);
        }
        Ok(())
    }

    /// Reports a failure of the pipeline itself.
    ///
    /// Builds (without custom data reporting), delivers and links the report; whichever
    /// phase fails is replaced by a failsafe naming it.
    pub async fn report_internal_error(&self, exception: &Exception) {
        error!(
            "Reporting internal error encountered while sending data: {}",
            exception
        );

        let extra = Map::from_iter([("internal".to_string(), json!(true))]);
        let input = ReportInput {
            level: Level::Error,
            message: None,
            exception: Some(exception),
            extra: Some(&extra),
        };

        let payload = match PayloadBuilder::new(self).build_safely(input) {
            Ok(payload) => payload,
            Err(e) => {
                self.send_failsafe("build_payload in exception_data", Some(&Exception::new(e)))
                    .await;
                error!("Exception: {}", exception);
                return;
            }
        };

        if let Err(e) = self.deliver(&payload).await {
            self.send_failsafe("error in process_payload", Some(&Exception::new(e)))
                .await;
            error!("Payload: {}", payload.as_value());
            return;
        }

        if self.log_instance_link(payload.data()).is_none() {
            self.send_failsafe("error logging instance link", None).await;
            error!("Payload: {}", payload.as_value());
        }
    }

    /// Sends a minimal `error` report describing why the real one could not be sent.
    ///
    /// Never fails; returns the failsafe payload whether or not delivery succeeded.
    pub async fn send_failsafe(&self, message: &str, exception: Option<&Exception>) -> Payload {
        let reason = failsafe_reason(message, exception);
        error!("Sending failsafe response due to {}", reason);

        let data = json!({
            "level": Level::Error,
            "environment": self.config.environment_name(),
            "body": {"message": {"body": format!("{FAILSAFE_PREFIX} {reason}")}},
            "notifier": {"name": NOTIFIER_NAME, "version": NOTIFIER_VERSION},
            "uuid": Uuid::new_v4().to_string(),
            "internal": true,
            "failsafe": true,
        });
        let payload = Payload::new(data, Arc::clone(&self.config));

        match self.deliver(&payload).await {
            Ok(()) => {
                self.log_instance_link(payload.data());
            }
            Err(e) => error!("Error sending failsafe: {}", e),
        }
        payload
    }
}

fn failsafe_reason(message: &str, exception: Option<&Exception>) -> String {
    let Some(exception) = exception else {
        return message.to_string();
    };

    let mut info = exception.class_name().to_string();
    let exception_message = exception.message();
    if exception_message != exception.class_name() {
        info.push_str(&format!(": \"{exception_message}\""));
    }
    if let Some(frame) = exception.backtrace().and_then(<[String]>::first) {
        info.push_str(&format!(" in {frame}"));
    }

    if message.is_empty() {
        info
    } else {
        format!("{message}: {info}")
    }
}

fn too_large_message(error: &TruncationError, payload: &Payload) -> String {
    let TruncationError::TooLarge {
        original_size,
        attempts,
    } = error;
    let host = payload
        .data()
        .pointer("/server/host")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    format!(
        "Could not send payload due to it being too large after truncating attempts. \
         Original size: {} Attempts: {} Uuid: {} Host: {}",
        original_size,
        attempts
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
        payload.uuid().unwrap_or("none"),
        host
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExceptionFilter;
    use crate::error::HandlerError;
    use crate::handlers::JobQueue;
    use std::collections::{HashMap, HashSet};
    use std::path::Path;
    use tracing_test::traced_test;

    #[derive(Debug)]
    struct Timeout;

    impl fmt::Display for Timeout {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "operation timed out")
        }
    }

    impl std::error::Error for Timeout {}

    #[derive(Default)]
    struct CountingQueue {
        fail: bool,
        jobs: Mutex<Vec<Value>>,
    }

    impl CountingQueue {
        fn failing() -> Self {
            CountingQueue {
                fail: true,
                ..Default::default()
            }
        }

        fn count(&self) -> usize {
            self.jobs.lock().expect("lock poisoned").len()
        }
    }

    impl JobQueue for CountingQueue {
        fn enqueue(&self, payload: Value) -> Result<(), HandlerError> {
            if self.fail {
                return Err(HandlerError::Rejected("queue is full".to_string()));
            }
            self.jobs.lock().expect("lock poisoned").push(payload);
            Ok(())
        }
    }

    fn file_config(path: &Path) -> Config {
        Config {
            access_token: Some("token".to_string()),
            write_to_file: true,
            filepath: path.to_path_buf(),
            ..Default::default()
        }
    }

    fn written_lines(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|line| serde_json::from_str(line).expect("each line is json"))
            .collect()
    }

    #[test]
    fn test_log_args_classification() {
        let mut extra = Map::new();
        extra.insert("k".to_string(), json!("v"));
        let args = LogArgs::from([
            LogArg::from("first"),
            LogArg::from(Exception::new(Timeout)),
            LogArg::from(extra.clone()),
            LogArg::from("second".to_string()),
        ]);

        assert_eq!(args.message.as_deref(), Some("second"));
        assert_eq!(
            args.exception.as_ref().map(Exception::class_name),
            Some("Timeout")
        );
        assert_eq!(args.extra, Some(extra));
        assert!(!args.use_exception_level_filters);
    }

    #[test]
    fn test_instance_url() {
        assert_eq!(
            instance_url("https://errors.example.com/", "abc"),
            "https://errors.example.com/instance/uuid?uuid=abc"
        );
    }

    #[test]
    fn test_failsafe_reason() {
        let exception = Exception::new(Timeout).with_backtrace(vec!["src/io.rs:3".to_string()]);
        assert_eq!(
            failsafe_reason("error in process_payload", Some(&exception)),
            "error in process_payload: Timeout: \"operation timed out\" in src/io.rs:3"
        );
        assert_eq!(failsafe_reason("plain", None), "plain");
    }

    #[tokio::test]
    async fn test_disabled_notifier_reports_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        let notifier = Notifier::new(Arc::new(Config {
            enabled: false,
            ..file_config(&path)
        }));

        assert_eq!(notifier.error("boom").await, LogOutcome::Disabled);
        assert!(!path.exists());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_empty_report_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        let notifier = Notifier::new(Arc::new(file_config(&path)));

        assert_eq!(notifier.info(LogArgs::new()).await, LogOutcome::Error);
        assert!(logs_contain("no message, exception or extra data"));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_sync_report_written_and_remembered() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        let notifier = Notifier::new(Arc::new(file_config(&path)));

        let outcome = notifier.info("hello").await;
        let data = outcome.data().expect("reported").clone();
        assert_eq!(data["body"], json!({"message": {"body": "hello"}}));
        assert_eq!(notifier.last_report(), Some(data.clone()));

        let lines = written_lines(&path);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["access_token"], "token");
        assert_eq!(lines[0]["data"]["uuid"], data["uuid"]);
    }

    #[tokio::test]
    async fn test_silenced_exception_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        let notifier = Notifier::new(Arc::new(file_config(&path)));

        let err = Notifier::silenced(|| -> Result<(), Timeout> { Err(Timeout) })
            .expect_err("closure fails");
        assert_eq!(
            notifier.error(Exception::new(err)).await,
            LogOutcome::Ignored
        );
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_exception_level_filters_are_opt_in() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        let notifier = Notifier::new(Arc::new(Config {
            exception_level_filters: HashMap::from([(
                "Timeout".to_string(),
                ExceptionFilter::Static(FilterAction::Ignore),
            )]),
            ..file_config(&path)
        }));

        let filtered = LogArgs::new()
            .exception(Timeout)
            .use_exception_level_filters(true);
        assert_eq!(notifier.error(filtered).await, LogOutcome::Ignored);

        let unfiltered = notifier.error(Exception::new(Timeout)).await;
        assert!(matches!(unfiltered, LogOutcome::Reported(_)));
        assert_eq!(written_lines(&path).len(), 1);
    }

    #[tokio::test]
    async fn test_exception_level_filter_overrides_level() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        let notifier = Notifier::new(Arc::new(Config {
            exception_level_filters: HashMap::from([(
                "Timeout".to_string(),
                ExceptionFilter::Computed(Arc::new(|_: &Exception| {
                    FilterAction::Level(Level::Warning)
                })),
            )]),
            ..file_config(&path)
        }));

        let args = LogArgs::new()
            .exception(Timeout)
            .use_exception_level_filters(true);
        let outcome = notifier.critical(args).await;
        assert_eq!(outcome.data().expect("reported")["level"], "warning");
    }

    #[tokio::test]
    async fn test_ignored_person_is_not_sent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        let notifier = Notifier::new(Arc::new(Config {
            ignored_person_ids: HashSet::from(["42".to_string()]),
            payload_options: PayloadOptions::new().with("person", json!({"id": 42})),
            ..file_config(&path)
        }));

        assert_eq!(notifier.error("boom").await, LogOutcome::Ignored);
        assert!(notifier.last_report().is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_async_report_enqueued_once() {
        let queue = Arc::new(CountingQueue::default());
        let notifier = Notifier::new(Arc::new(Config {
            access_token: Some("token".to_string()),
            use_async: true,
            async_handler: Some(AsyncHandler::Custom(queue.clone())),
            ..Default::default()
        }));

        let outcome = notifier.error("boom").await;
        assert!(matches!(outcome, LogOutcome::Reported(_)));
        assert_eq!(queue.count(), 1);

        let job = &queue.jobs.lock().expect("lock poisoned")[0];
        assert_eq!(job["access_token"], "token");
        assert_eq!(job["data"]["uuid"].as_str(), outcome.uuid());
    }

    #[tokio::test]
    async fn test_failover_handlers_tried_in_order() {
        let primary = Arc::new(CountingQueue::failing());
        let broken = Arc::new(CountingQueue::failing());
        let backup = Arc::new(CountingQueue::default());
        let unused = Arc::new(CountingQueue::default());
        let notifier = Notifier::new(Arc::new(Config {
            use_async: true,
            async_handler: Some(AsyncHandler::Custom(primary)),
            failover_handlers: vec![
                AsyncHandler::Custom(broken),
                AsyncHandler::Custom(backup.clone()),
                AsyncHandler::Custom(unused.clone()),
            ],
            ..Default::default()
        }));

        notifier.error("boom").await;
        assert_eq!(backup.count(), 1);
        assert_eq!(unused.count(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_all_failovers_failing_is_logged() {
        let notifier = Notifier::new(Arc::new(Config {
            use_async: true,
            async_handler: Some(AsyncHandler::Custom(Arc::new(CountingQueue::failing()))),
            failover_handlers: vec![AsyncHandler::Custom(Arc::new(CountingQueue::failing()))],
            ..Default::default()
        }));

        let outcome = notifier.error("boom").await;
        assert!(matches!(outcome, LogOutcome::Reported(_)));
        assert!(logs_contain("All failover handlers failed"));
    }

    #[tokio::test]
    async fn test_oversized_payload_replaced_by_failsafe() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        let custom: Map<String, Value> = (0..300).map(|i| (format!("k_{i}"), json!(i))).collect();
        let notifier = Notifier::new(Arc::new(Config {
            max_payload_size: 1_500,
            payload_options: PayloadOptions::new().with("custom", Value::Object(custom)),
            ..file_config(&path)
        }));

        assert_eq!(notifier.error("boom").await, LogOutcome::Error);

        let lines = written_lines(&path);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["data"]["failsafe"], true);
        let body = lines[0]["data"]["body"]["message"]["body"]
            .as_str()
            .expect("failsafe body");
        assert!(body.starts_with(FAILSAFE_PREFIX));
        assert!(body.contains("too large after truncating attempts"));
    }

    #[tokio::test]
    async fn test_send_failsafe_shape() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        let notifier = Notifier::new(Arc::new(file_config(&path)));

        let payload = notifier
            .send_failsafe("error in process_payload", Some(&Exception::new(Timeout)))
            .await;

        let data = payload.data();
        assert_eq!(data["level"], "error");
        assert_eq!(data["internal"], true);
        assert_eq!(
            data["body"]["message"]["body"],
            "Failsafe from error-notifier. error in process_payload: Timeout: \"operation timed out\""
        );
        assert_eq!(written_lines(&path), vec![payload.as_value().clone()]);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_internal_error_falls_back_to_failsafe() {
        // No token and no file output: every delivery attempt fails before any I/O.
        let notifier = Notifier::new(Arc::new(Config::default()));

        notifier
            .report_internal_error(&Exception::new(Timeout))
            .await;

        assert!(logs_contain("Reporting internal error"));
        assert!(logs_contain(
            "Sending failsafe response due to error in process_payload"
        ));
        assert!(logs_contain("Error sending failsafe"));
    }

    #[tokio::test]
    async fn test_internal_error_report_marked_internal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        let notifier = Notifier::new(Arc::new(file_config(&path)));

        notifier
            .report_internal_error(&Exception::new(Timeout))
            .await;

        let lines = written_lines(&path);
        assert_eq!(lines.len(), 1);
        let trace = &lines[0]["data"]["body"]["trace"];
        assert_eq!(trace["exception"]["class"], "Timeout");
        assert_eq!(trace["extra"], json!({"internal": true}));
    }

    #[tokio::test]
    async fn test_process_raw_safely_reports_delivery_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing_dir = dir.path().join("missing").join("out.json");
        let notifier = Notifier::new(Arc::new(file_config(&missing_dir)));

        // The parent directory does not exist, so every write fails and nothing panics.
        notifier
            .process_raw_safely(json!({"access_token": "token", "data": {"level": "info"}}))
            .await;
        assert!(!missing_dir.exists());
    }

    #[tokio::test]
    async fn test_scope_leaves_parent_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        let parent = Notifier::new(Arc::new(file_config(&path)));
        let child = parent.scope(&PayloadOptions::new().with("person", json!({"id": "7"})));

        let child_data = child.info("from child").await;
        assert_eq!(child_data.data().expect("reported")["person"]["id"], "7");
        assert!(parent.config().payload_options.get("person").is_none());
        assert!(parent.last_report().is_none());

        let parent_data = parent.info("from parent").await;
        assert!(parent_data.data().expect("reported").get("person").is_none());
    }

    #[tokio::test]
    async fn test_nested_scopes_merge_into_report() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        let parent = Notifier::new(Arc::new(file_config(&path)));
        let child = parent
            .scope(&PayloadOptions::new().with("request", json!({"url": "/checkout"})))
            .scope(&PayloadOptions::new().with("person", json!({"id": "42"})));

        let outcome = child.error("payment failed").await;
        let data = outcome.data().expect("reported");
        assert_eq!(data["request"], json!({"url": "/checkout"}));
        assert_eq!(data["person"], json!({"id": "42"}));

        assert!(parent.config().payload_options.is_empty());
        let parent_data = parent.info("from parent").await;
        let parent_data = parent_data.data().expect("reported");
        assert!(parent_data.get("request").is_none());
        assert!(parent_data.get("person").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_file_writes_keep_whole_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        let notifier = Notifier::new(Arc::new(file_config(&path)));

        let writers: Vec<_> = (0..8)
            .map(|writer| {
                let notifier = notifier.clone();
                tokio::spawn(async move {
                    for report in 0..25 {
                        let mut extra = Map::new();
                        extra.insert("writer".to_string(), json!(writer));
                        extra.insert("padding".to_string(), json!("x".repeat(4096)));
                        let args = LogArgs::new()
                            .message(format!("report {report}"))
                            .extra(extra);
                        assert!(matches!(notifier.info(args).await, LogOutcome::Reported(_)));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.expect("writer task");
        }

        let lines = written_lines(&path);
        assert_eq!(lines.len(), 200);
        let uuids: HashSet<_> = lines
            .iter()
            .map(|line| line["data"]["uuid"].as_str().expect("uuid").to_string())
            .collect();
        assert_eq!(uuids.len(), 200);
    }

    #[tokio::test]
    async fn test_scope_mut_changes_only_this_notifier() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        let original = Notifier::new(Arc::new(file_config(&path)));
        let mut scoped = original.clone();
        scoped.scope_mut(&PayloadOptions::new().with("context", json!("checkout")));

        assert_eq!(
            scoped.config().payload_options.get("context"),
            Some(&json!("checkout"))
        );
        assert!(original.config().payload_options.get("context").is_none());
    }

    #[test]
    fn test_safely_sets_flag() {
        let notifier = Notifier::new(Arc::new(Config::default()));
        assert!(!notifier.config().safely);
        assert!(notifier.safely().config().safely);
    }

    #[test]
    fn test_log_outcome_names() {
        assert_eq!(LogOutcome::Disabled.as_str(), "disabled");
        assert_eq!(LogOutcome::Ignored.as_str(), "ignored");
        assert_eq!(LogOutcome::Error.as_str(), "error");
        assert_eq!(LogOutcome::Reported(json!({})).as_str(), "reported");
        assert!(LogOutcome::Ignored.uuid().is_none());
    }
}
