// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Boxed error type used at the seams where callers hand us their own failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur when loading or validating the notifier configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid log level '{0}'. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),
}

/// Errors returned by `Notifier::process_payload`
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to write payload to file: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    TooLarge(#[from] TruncationError),

    #[error("No access token configured")]
    MissingAccessToken,
}

/// Returned when no truncation strategy brings a payload under the size ceiling
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TruncationError {
    #[error("Payload too large after truncation. Original size: {original_size} Attempts: {}", format_attempts(.attempts))]
    TooLarge {
        original_size: usize,
        attempts: Vec<usize>,
    },
}

fn format_attempts(attempts: &[usize]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors raised while assembling a report
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Panic while building payload: {0}")]
    Panic(String),
}

/// Errors raised by an async backend when it cannot accept a job
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Async handler unavailable: {0}")]
    Unavailable(String),

    #[error("Async handler rejected job: {0}")]
    Rejected(String),
}
