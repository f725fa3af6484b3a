// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log output for the notifier's own diagnostics.
//!
//! Lines are prefixed with `ERROR_NOTIFIER` so they can be told apart from the host
//! application's logs:
//!
//! ```text
//! ERROR_NOTIFIER | WARN | Got unexpected status code from collector api: 429 Too Many Requests
//! ```

use crate::config::Config;
use crate::error::BoxError;
use std::fmt;
use tracing::debug;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

pub const LOG_PREFIX: &str = "ERROR_NOTIFIER";

#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(&mut writer, "{LOG_PREFIX} | {} | ", event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Filter directive for `log_level`, with the HTTP stack silenced.
#[must_use]
pub fn env_filter_directive(log_level: &str) -> String {
    format!("h2=off,hyper=off,reqwest=off,rustls=off,{log_level}")
}

/// Installs a global subscriber writing prefixed lines to stdout.
///
/// Meant for binaries that do not set up `tracing` themselves. Fails if the level is not a
/// valid filter or a global subscriber is already installed.
pub fn init(config: &Config) -> Result<(), BoxError> {
    let filter = EnvFilter::try_new(env_filter_directive(&config.log_level))?;
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_ansi(false)
        .event_format(Formatter)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    debug!("Logging subsystem enabled");
    Ok(())
}
