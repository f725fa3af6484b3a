// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide configuration and the per-thread default notifier.
//!
//! The configuration is a snapshot swapped atomically by [`configure`]; a notifier built
//! before the swap keeps the snapshot it was built with. Each thread lazily builds its own
//! default notifier, which [`scoped`] replaces for the duration of a closure.

use crate::config::{Config, PayloadOptions};
use crate::level::Level;
use crate::notifier::{LogArgs, LogOutcome, Notifier};
use serde_json::Value;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

static CONFIGURATION: OnceLock<RwLock<Arc<Config>>> = OnceLock::new();
static GENERATION: AtomicU64 = AtomicU64::new(0);

/// Default notifier of a thread. Pinned entries come from [`scoped`] and survive
/// reconfiguration until the scope ends.
struct Installed {
    generation: u64,
    notifier: Notifier,
    pinned: bool,
}

thread_local! {
    static CURRENT: RefCell<Option<Installed>> = const { RefCell::new(None) };
}

fn cell() -> &'static RwLock<Arc<Config>> {
    CONFIGURATION.get_or_init(|| RwLock::new(Arc::new(Config::default())))
}

/// The current process-wide configuration.
#[must_use]
pub fn configuration() -> Arc<Config> {
    Arc::clone(&cell().read().unwrap_or_else(PoisonError::into_inner))
}

/// Applies `f` to a copy of the current configuration and installs the result.
pub fn configure<F>(f: F)
where
    F: FnOnce(&mut Config),
{
    let mut guard = cell().write().unwrap_or_else(PoisonError::into_inner);
    let mut config = (**guard).clone();
    f(&mut config);
    *guard = Arc::new(config);
    GENERATION.fetch_add(1, Ordering::SeqCst);
}

/// Like [`configure`] but starting from the defaults.
pub fn reconfigure<F>(f: F)
where
    F: FnOnce(&mut Config),
{
    let mut guard = cell().write().unwrap_or_else(PoisonError::into_inner);
    let mut config = Config::default();
    f(&mut config);
    *guard = Arc::new(config);
    GENERATION.fetch_add(1, Ordering::SeqCst);
}

/// This thread's default notifier.
///
/// Rebuilt from the process-wide configuration after every [`configure`]; a notifier
/// installed by [`scoped`] is returned as is until the closure ends.
#[must_use]
pub fn notifier() -> Notifier {
    let generation = GENERATION.load(Ordering::SeqCst);
    CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        match current.as_ref() {
            Some(installed) if installed.pinned || installed.generation == generation => {
                installed.notifier.clone()
            }
            _ => {
                let notifier = Notifier::new(configuration());
                *current = Some(Installed {
                    generation,
                    notifier: notifier.clone(),
                    pinned: false,
                });
                notifier
            }
        }
    })
}

/// Restores the previous default notifier when dropped, panics included.
struct ScopeGuard {
    previous: Option<Installed>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// Runs `f` with a scoped notifier installed as this thread's default.
///
/// The scoped notifier is also passed to `f`, which is handy for async code that hops
/// threads.
pub fn scoped<R, F>(options: &PayloadOptions, f: F) -> R
where
    F: FnOnce(Notifier) -> R,
{
    let scoped = notifier().scope(options);
    let installed = Installed {
        generation: GENERATION.load(Ordering::SeqCst),
        notifier: scoped.clone(),
        pinned: true,
    };
    let previous = CURRENT.with(|current| current.borrow_mut().replace(installed));
    let _guard = ScopeGuard { previous };
    f(scoped)
}

/// Reports through this thread's default notifier.
pub async fn log(level: Level, args: impl Into<LogArgs>) -> LogOutcome {
    notifier().log(level, args).await
}

/// Last report of this thread's default notifier.
#[must_use]
pub fn last_report() -> Option<Value> {
    notifier().last_report()
}
