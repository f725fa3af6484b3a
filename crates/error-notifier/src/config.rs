// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::encoding::deep_merge;
use crate::error::{BoxError, ConfigError};
use crate::exception::Exception;
use crate::handlers::AsyncHandler;
use crate::level::Level;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "https://api.rollbar.com/api/1/item/";
pub const DEFAULT_WEB_BASE: &str = "https://rollbar.com";
pub const DEFAULT_FILEPATH: &str = "error_notifier.json";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 128 * 1024;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Zero-argument generator for a payload option, resolved each time a report is built.
pub type ValueFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// Provider of extra data merged into every report.
pub type CustomDataFn =
    Arc<dyn Fn(&CustomDataContext<'_>) -> Result<Map<String, Value>, BoxError> + Send + Sync>;

/// What a custom data provider gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct CustomDataContext<'a> {
    pub level: Level,
    pub message: Option<&'a str>,
    pub exception: Option<&'a Exception>,
}

/// Outcome of an exception level filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Ignore,
    Level(Level),
}

/// Per-class override of the report level, keyed by [`Exception::class_name`].
#[derive(Clone)]
pub enum ExceptionFilter {
    Static(FilterAction),
    Computed(Arc<dyn Fn(&Exception) -> FilterAction + Send + Sync>),
}

impl ExceptionFilter {
    #[must_use]
    pub fn resolve(&self, exception: &Exception) -> FilterAction {
        match self {
            ExceptionFilter::Static(action) => *action,
            ExceptionFilter::Computed(f) => f(exception),
        }
    }
}

impl fmt::Debug for ExceptionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionFilter::Static(action) => f.debug_tuple("Static").field(action).finish(),
            ExceptionFilter::Computed(_) => f.write_str("Computed"),
        }
    }
}

/// Overlay deep-merged into every built report.
///
/// Static entries are plain JSON; computed entries (typically `person`, `request` and
/// `context`) are generated when the report is built. Setting a key in one form replaces
/// the other form of the same key.
#[derive(Clone, Default)]
pub struct PayloadOptions {
    values: Map<String, Value>,
    computed: BTreeMap<String, ValueFn>,
}

impl PayloadOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_map(values: Map<String, Value>) -> Self {
        Self {
            values,
            computed: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        let key = key.into();
        self.computed.remove(&key);
        self.values.insert(key, value);
        self
    }

    #[must_use]
    pub fn with_computed<F>(mut self, key: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        let key = key.into();
        self.values.remove(&key);
        self.computed.insert(key, Arc::new(f));
        self
    }

    /// Deep-merges `other` on top of these options.
    pub fn merge(&mut self, other: &PayloadOptions) {
        for key in other.values.keys() {
            self.computed.remove(key);
        }
        deep_merge(&mut self.values, &other.values);
        for (key, f) in &other.computed {
            self.values.remove(key);
            self.computed.insert(key.clone(), Arc::clone(f));
        }
    }

    #[must_use]
    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn computed(&self) -> impl Iterator<Item = (&str, &ValueFn)> {
        self.computed.iter().map(|(k, f)| (k.as_str(), f))
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    #[must_use]
    pub fn is_computed(&self, key: &str) -> bool {
        self.computed.contains_key(key)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.computed.is_empty()
    }
}

impl fmt::Debug for PayloadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadOptions")
            .field("values", &self.values)
            .field("computed", &self.computed.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Notifier configuration
#[derive(Clone)]
pub struct Config {
    /// Token attached to every payload
    pub access_token: Option<String>,
    /// Collector endpoint receiving POSTed payloads
    pub endpoint: String,
    /// Base URL of the collector UI, used to build instance links
    pub web_base: String,
    /// Environment name, "unspecified" when empty
    pub environment: Option<String>,
    /// Master switch; a disabled notifier reports nothing
    pub enabled: bool,
    /// Timeout of a single delivery request
    pub request_timeout: Duration,
    /// HTTPS proxy URL
    pub proxy: Option<String>,
    pub use_async: bool,
    /// Backend used when `use_async` is set; defaults to [`AsyncHandler::Spawn`]
    pub async_handler: Option<AsyncHandler>,
    /// Backends tried in order when the primary one fails
    pub failover_handlers: Vec<AsyncHandler>,
    /// Append payloads to `filepath` instead of sending them
    pub write_to_file: bool,
    pub filepath: PathBuf,
    pub populate_empty_backtraces: bool,
    pub exception_level_filters: HashMap<String, ExceptionFilter>,
    pub ignored_person_ids: HashSet<String>,
    /// Field of the `person` document holding its id
    pub person_id_field: String,
    pub custom_data_method: Option<CustomDataFn>,
    pub payload_options: PayloadOptions,
    /// Set on notifiers reporting their own failures, to stop recursion
    pub safely: bool,
    pub project_package_paths: Vec<String>,
    pub code_version: Option<String>,
    /// Overrides the detected host name
    pub host: Option<String>,
    pub root: Option<String>,
    pub branch: Option<String>,
    pub framework: Option<String>,
    /// Size ceiling of a serialized payload, in bytes
    pub max_payload_size: usize,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            access_token: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            web_base: DEFAULT_WEB_BASE.to_string(),
            environment: None,
            enabled: true,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            proxy: None,
            use_async: false,
            async_handler: None,
            failover_handlers: Vec::new(),
            write_to_file: false,
            filepath: PathBuf::from(DEFAULT_FILEPATH),
            populate_empty_backtraces: false,
            exception_level_filters: HashMap::new(),
            ignored_person_ids: HashSet::new(),
            person_id_field: "id".to_string(),
            custom_data_method: None,
            payload_options: PayloadOptions::new(),
            safely: false,
            project_package_paths: Vec::new(),
            code_version: None,
            host: None,
            root: None,
            branch: None,
            framework: None,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let access_token = env::var("NOTIFIER_ACCESS_TOKEN").ok();
        let endpoint = env::var("NOTIFIER_ENDPOINT").unwrap_or(defaults.endpoint.clone());
        let environment = env::var("NOTIFIER_ENVIRONMENT").ok();
        let enabled = env::var("NOTIFIER_ENABLED")
            .map(|val| val.to_lowercase() != "false")
            .unwrap_or(true);
        let use_async = env::var("NOTIFIER_USE_ASYNC")
            .map(|val| val.to_lowercase() == "true")
            .unwrap_or(false);
        let request_timeout = match env::var("NOTIFIER_REQUEST_TIMEOUT_SECS") {
            Ok(val) => val.parse::<u64>().map(Duration::from_secs).map_err(|_| {
                ConfigError::InvalidConfig(format!(
                    "NOTIFIER_REQUEST_TIMEOUT_SECS must be a number of seconds, got '{val}'"
                ))
            })?,
            Err(_) => defaults.request_timeout,
        };
        let code_version = env::var("NOTIFIER_CODE_VERSION").ok();
        let proxy = env::var("NOTIFIER_PROXY_HTTPS")
            .or_else(|_| env::var("HTTPS_PROXY"))
            .ok();
        let log_level = env::var("NOTIFIER_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or_else(|_| "info".to_string());

        let config = Self {
            access_token,
            endpoint,
            environment,
            enabled,
            use_async,
            request_timeout,
            code_version,
            proxy,
            log_level,
            ..defaults
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoint = self.endpoint.trim();
        if endpoint.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "endpoint cannot be empty".to_string(),
            ));
        }
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(ConfigError::InvalidConfig(format!(
                "endpoint must be an http or https URL, got '{endpoint}'"
            )));
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "request timeout must be greater than 0".to_string(),
            ));
        }

        if self.max_payload_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "max payload size must be greater than 0".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log_level.clone()));
        }

        Ok(())
    }

    /// Clone of this configuration with `options` deep-merged into the payload overlay.
    #[must_use]
    pub fn merged(&self, options: &PayloadOptions) -> Self {
        let mut config = self.clone();
        config.payload_options.merge(options);
        config
    }

    #[must_use]
    pub fn environment_name(&self) -> &str {
        match self.environment.as_deref() {
            Some(env) if !env.trim().is_empty() => env,
            _ => "unspecified",
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("endpoint", &self.endpoint)
            .field("environment", &self.environment)
            .field("enabled", &self.enabled)
            .field("request_timeout", &self.request_timeout)
            .field("use_async", &self.use_async)
            .field("async_handler", &self.async_handler)
            .field("failover_handlers", &self.failover_handlers)
            .field("write_to_file", &self.write_to_file)
            .field("filepath", &self.filepath)
            .field("exception_level_filters", &self.exception_level_filters)
            .field("ignored_person_ids", &self.ignored_person_ids)
            .field("custom_data_method", &self.custom_data_method.is_some())
            .field("payload_options", &self.payload_options)
            .field("safely", &self.safely)
            .field("max_payload_size", &self.max_payload_size)
            .finish_non_exhaustive()
    }
}
