// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Backends running payload delivery off the caller's path.
//!
//! Every backend receives the payload as plain JSON and, when the job runs, hands it to
//! [`Notifier::process_from_async_handler`], which rebuilds a notifier from the process-wide
//! configuration. Jobs may run more than once; the payload `uuid` is fixed at build time so
//! the collector can deduplicate.

use crate::config::Config;
use crate::error::HandlerError;
use crate::notifier::Notifier;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

/// External job queue accepting serialized payloads.
///
/// Implementations typically persist the payload and, on execution, call
/// [`Notifier::process_from_async_handler`].
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, payload: Value) -> Result<(), HandlerError>;
}

/// Async backend selected by configuration.
#[derive(Clone)]
pub enum AsyncHandler {
    /// One tokio task per job. Falls back to [`AsyncHandler::Thread`] outside a runtime.
    Spawn,
    /// One OS thread per job, each driving a current-thread runtime.
    Thread,
    /// Single worker draining a channel, see [`QueueService`].
    Queue(QueueHandle),
    Custom(Arc<dyn JobQueue>),
}

impl AsyncHandler {
    /// Hands `payload` to the backend. Returns once the job is accepted, not when it ran.
    pub fn call(&self, payload: Value) -> Result<(), HandlerError> {
        match self {
            AsyncHandler::Spawn => spawn_job(payload),
            AsyncHandler::Thread => thread_job(payload),
            AsyncHandler::Queue(handle) => handle.enqueue(payload),
            AsyncHandler::Custom(queue) => queue.enqueue(payload),
        }
    }
}

impl fmt::Debug for AsyncHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsyncHandler::Spawn => f.write_str("Spawn"),
            AsyncHandler::Thread => f.write_str("Thread"),
            AsyncHandler::Queue(_) => f.write_str("Queue"),
            AsyncHandler::Custom(_) => f.write_str("Custom"),
        }
    }
}

fn spawn_job(payload: Value) -> Result<(), HandlerError> {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(run_job(payload));
            Ok(())
        }
        Err(_) => {
            debug!("No tokio runtime available, running job on a dedicated thread");
            thread_job(payload)
        }
    }
}

fn thread_job(payload: Value) -> Result<(), HandlerError> {
    std::thread::Builder::new()
        .name("error-notifier-job".to_string())
        .spawn(move || {
            match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime.block_on(run_job(payload)),
                Err(e) => error!("Failed to build runtime for async job: {}", e),
            }
        })
        .map(|_| ())
        .map_err(|e| HandlerError::Unavailable(format!("failed to spawn job thread: {e}")))
}

async fn run_job(payload: Value) {
    // Already reported internally; nothing here can retry.
    if let Err(e) = Notifier::process_from_async_handler(payload).await {
        debug!("Async job failed: {}", e);
    }
}

#[derive(Debug)]
pub enum QueueCommand {
    Process(Value),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<QueueCommand>,
}

impl QueueHandle {
    pub fn enqueue(&self, payload: Value) -> Result<(), HandlerError> {
        self.tx
            .send(QueueCommand::Process(payload))
            .map_err(|_| HandlerError::Unavailable("queue service stopped".to_string()))
    }

    /// Waits until every job enqueued before this call has been processed.
    pub async fn flush(&self) -> Result<(), String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(QueueCommand::Flush(response_tx))
            .map_err(|e| format!("Failed to send flush command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive flush response: {}", e))
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<QueueCommand>> {
        self.tx.send(QueueCommand::Shutdown)
    }
}

/// Worker owning the receiving end of a [`QueueHandle`].
pub struct QueueService {
    rx: mpsc::UnboundedReceiver<QueueCommand>,
    config: Option<Arc<Config>>,
}

impl QueueService {
    /// Service processing jobs with the process-wide configuration.
    #[must_use]
    pub fn new() -> (Self, QueueHandle) {
        Self::build(None)
    }

    /// Service processing jobs with a fixed configuration.
    #[must_use]
    pub fn with_config(config: Arc<Config>) -> (Self, QueueHandle) {
        Self::build(Some(config))
    }

    fn build(config: Option<Arc<Config>>) -> (Self, QueueHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx, config }, QueueHandle { tx })
    }

    pub async fn run(mut self) {
        debug!("Queue service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                QueueCommand::Process(payload) => match &self.config {
                    Some(config) => {
                        Notifier::new(Arc::clone(config))
                            .process_raw_safely(payload)
                            .await;
                    }
                    None => run_job(payload).await,
                },

                QueueCommand::Flush(response_tx) => {
                    if response_tx.send(()).is_err() {
                        error!("Failed to send flush response - receiver dropped");
                    }
                }

                QueueCommand::Shutdown => {
                    debug!("Queue service shutting down");
                    break;
                }
            }
        }

        debug!("Queue service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingQueue {
        jobs: Mutex<Vec<Value>>,
    }

    impl JobQueue for RecordingQueue {
        fn enqueue(&self, payload: Value) -> Result<(), HandlerError> {
            self.jobs.lock().expect("lock poisoned").push(payload);
            Ok(())
        }
    }

    #[test]
    fn test_custom_handler_receives_plain_payload() {
        let queue = Arc::new(RecordingQueue::default());
        let handler = AsyncHandler::Custom(queue.clone());
        let payload = json!({"access_token": "t", "data": {"level": "error"}});

        handler.call(payload.clone()).expect("enqueue should succeed");

        assert_eq!(*queue.jobs.lock().expect("lock poisoned"), vec![payload]);
    }

    #[tokio::test]
    async fn test_queue_handle_fails_after_shutdown() {
        let (service, handle) = QueueService::new();
        let service_task = tokio::spawn(service.run());

        handle.shutdown().expect("Failed to shutdown");
        service_task.await.expect("Service task failed");

        let result = AsyncHandler::Queue(handle).call(json!({}));
        assert!(matches!(result, Err(HandlerError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_queue_service_processes_jobs_before_flush() {
        let dir = tempfile::tempdir().expect("tempdir");
        let filepath = dir.path().join("queued.json");
        let config = Arc::new(Config {
            access_token: Some("token".to_string()),
            write_to_file: true,
            filepath: filepath.clone(),
            ..Default::default()
        });

        let (service, handle) = QueueService::with_config(config);
        let service_task = tokio::spawn(service.run());

        let handler = AsyncHandler::Queue(handle.clone());
        for i in 0..3 {
            handler
                .call(json!({"access_token": "token", "data": {"uuid": i, "level": "info"}}))
                .expect("enqueue should succeed");
        }
        handle.flush().await.expect("Failed to flush");

        let written = std::fs::read_to_string(&filepath).expect("file should exist");
        assert_eq!(written.lines().count(), 3);

        handle.shutdown().expect("Failed to shutdown");
        service_task.await.expect("Service task failed");
    }

    #[test]
    fn test_debug_names_variant() {
        assert_eq!(format!("{:?}", AsyncHandler::Thread), "Thread");
    }
}
