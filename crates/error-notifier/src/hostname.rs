// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hostname detection for the `server` section of reports

use std::env;
use std::sync::OnceLock;
use tracing::warn;

static DETECTED: OnceLock<String> = OnceLock::new();

/// Get the host name reported in `server.host`
///
/// Tries, in order:
/// 1. NOTIFIER_HOSTNAME environment variable
/// 2. HOSTNAME environment variable
/// 3. System hostname via nix::unistd::gethostname()
/// 4. "unknown"
///
/// The result of the system lookup is cached for the life of the process.
#[must_use]
pub fn get_hostname() -> String {
    for var in ["NOTIFIER_HOSTNAME", "HOSTNAME"] {
        if let Ok(hostname) = env::var(var) {
            if !hostname.is_empty() {
                return hostname;
            }
        }
    }

    DETECTED.get_or_init(system_hostname).clone()
}

fn system_hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(hostname) => {
            let hostname = hostname.to_string_lossy().into_owned();
            if !hostname.is_empty() {
                return hostname;
            }
        }
        Err(e) => {
            warn!("Failed to get system hostname: {}", e);
        }
    }

    warn!("Could not determine hostname, using 'unknown'");
    "unknown".to_string()
}
