// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Error Notifier
//!
//! Reports application errors and messages to a Rollbar-compatible collector.
//!
//! A report goes through the same pipeline whatever its origin:
//! - [`notifier`]: filtering, ignore rules and scheduling
//! - [`payload::builder`]: assembly of the report document
//! - [`truncation`]: shrinking documents over the size ceiling
//! - [`handlers`]: asynchronous delivery backends
//! - [`http`]: the collector transport
//!
//! [`global`] keeps a process-wide configuration and a default notifier per thread.
//!
//! ```rust,ignore
//! use error_notifier::{global, Level};
//!
//! global::configure(|config| {
//!     config.access_token = Some(token);
//!     config.environment = Some("production".to_string());
//! });
//!
//! if let Err(e) = save_order(&order) {
//!     global::log(Level::Error, error_notifier::Exception::capture(e)).await;
//! }
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod encoding;
pub mod error;
pub mod exception;
pub mod global;
pub mod handlers;
pub mod hostname;
pub mod http;
pub mod level;
pub mod logger;
pub mod notifier;
pub mod payload;
pub mod truncation;

pub use config::{Config, PayloadOptions};
pub use exception::{silenced, Exception};
pub use level::Level;
pub use notifier::{LogArg, LogArgs, LogOutcome, Notifier};
