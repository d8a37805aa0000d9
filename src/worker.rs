use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::db::{StoreError, TaskStore};
use crate::events::ServerMessage;
use crate::generator::Generator;
use crate::hub::BroadcastHub;
use crate::task::Task;

/// Tries at recording a task's outcome before it is left as `Processing`.
const FINALIZE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Let an enqueue cut the idle sleep short.
    pub wake_on_enqueue: bool,
    /// Upper bound on one generation call. `None` waits forever.
    pub generation_timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            wake_on_enqueue: true,
            generation_timeout: None,
        }
    }
}

/// What one generation call produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed(String),
    Failed(String),
    TimedOut(Duration),
}

/// The single sequential consumer of the task queue.
///
/// Claims the oldest pending task, announces it, runs the generator, records
/// the result and announces that too. Exactly one generation is in flight.
pub struct Worker {
    store: Arc<dyn TaskStore>,
    generator: Arc<dyn Generator>,
    hub: BroadcastHub,
    wake: Arc<Notify>,
    config: WorkerConfig,
}

/// Running worker. Dropping it without calling [`WorkerHandle::shutdown_and_join`]
/// stops the loop at its next idle point.
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: Option<JoinHandle<Result<(), StoreError>>>,
}

impl WorkerHandle {
    /// Resolves when the loop exits on its own, which only happens on a
    /// fatal storage error or a panic. Pending forever after it has resolved.
    pub async fn finished(&mut self) -> Result<(), StoreError> {
        let Some(join) = self.join.as_mut() else {
            return std::future::pending().await;
        };
        let result = join.await;
        self.join = None;
        flatten(result)
    }

    /// Ask the loop to stop after any in-flight task and wait for it.
    pub async fn shutdown_and_join(mut self) -> Result<(), StoreError> {
        let _ = self.shutdown_tx.send(true);
        match self.join.take() {
            Some(join) => flatten(join.await),
            None => Ok(()),
        }
    }
}

fn log_outcome(task: &Task, outcome: &GenerationOutcome) {
    match outcome {
        GenerationOutcome::Completed(artifact) => {
            tracing::info!(task_id = task.id, artifact = %artifact, "Task completed")
        }
        GenerationOutcome::Failed(reason) => {
            tracing::error!(task_id = task.id, "Task failed: {}", reason)
        }
        GenerationOutcome::TimedOut(limit) => {
            tracing::error!(task_id = task.id, ?limit, "Task timed out")
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

fn flatten(
    result: Result<Result<(), StoreError>, tokio::task::JoinError>,
) -> Result<(), StoreError> {
    match result {
        Ok(inner) => inner,
        Err(e) => {
            tracing::error!("Worker task panicked: {}", e);
            Ok(())
        }
    }
}

impl Worker {
    pub fn new(
        store: Arc<dyn TaskStore>,
        generator: Arc<dyn Generator>,
        hub: BroadcastHub,
        wake: Arc<Notify>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            generator,
            hub,
            wake,
            config,
        }
    }

    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(shutdown_rx));
        WorkerHandle {
            shutdown_tx,
            join: Some(join),
        }
    }

    /// Drain the queue until shutdown is signalled.
    ///
    /// Returns `Err` only when the store is unusable.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), StoreError> {
        tracing::info!(
            poll_ms = self.config.poll_interval.as_millis() as u64,
            wake_on_enqueue = self.config.wake_on_enqueue,
            "Worker started, polling for tasks..."
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) if e.is_fatal() => {
                    tracing::error!("Task store is unusable, stopping worker: {}", e);
                    return Err(e);
                }
                Err(e) => tracing::warn!("Failed to claim task, will retry: {}", e),
            }

            if self.idle(&mut shutdown).await {
                break;
            }
        }

        tracing::info!("Worker stopped");
        Ok(())
    }

    /// Process at most one task. `Ok(false)` means the queue was empty.
    pub async fn run_once(&self) -> Result<bool, StoreError> {
        let Some(task) = self.store.claim_next()? else {
            return Ok(false);
        };

        tracing::info!(task_id = task.id, "Processing task");
        self.hub.publish(&ServerMessage::Update(task.clone()));

        let outcome = self.generate(&task).await;
        log_outcome(&task, &outcome);

        let mut attempt = 1;
        loop {
            match self.finalize(&task, &outcome) {
                Ok(done) => {
                    self.hub.publish(&ServerMessage::Update(done));
                    break;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e @ StoreError::InvalidTransition { .. }) => {
                    tracing::error!(task_id = task.id, "Task outcome rejected: {}", e);
                    break;
                }
                Err(e) if attempt < FINALIZE_ATTEMPTS => {
                    tracing::warn!(
                        task_id = task.id,
                        attempt,
                        "Failed to record task outcome, retrying: {}",
                        e
                    );
                    attempt += 1;
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(e) => {
                    tracing::error!(
                        task_id = task.id,
                        "Failed to record task outcome, left as Processing: {}",
                        e
                    );
                    break;
                }
            }
        }
        Ok(true)
    }

    /// Run the generator with panics and the optional time limit mapped to
    /// outcomes. Dropping the call on timeout kills any child process.
    async fn generate(&self, task: &Task) -> GenerationOutcome {
        let call = AssertUnwindSafe(self.generator.generate(&task.prompt, task.id)).catch_unwind();
        let result = match self.config.generation_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => return GenerationOutcome::TimedOut(limit),
            },
            None => call.await,
        };

        match result {
            Ok(Ok(artifact)) => GenerationOutcome::Completed(artifact),
            Ok(Err(e)) => GenerationOutcome::Failed(e.to_string()),
            Err(panic) => GenerationOutcome::Failed(format!(
                "generator panicked: {}",
                panic_message(panic.as_ref())
            )),
        }
    }

    fn finalize(&self, task: &Task, outcome: &GenerationOutcome) -> Result<Task, StoreError> {
        match outcome {
            GenerationOutcome::Completed(artifact) => self.store.complete(task, artifact),
            GenerationOutcome::Failed(reason) => self.store.fail(task, reason),
            GenerationOutcome::TimedOut(limit) => self
                .store
                .fail(task, &format!("timed out after {}s", limit.as_secs_f64())),
        }
    }

    /// Wait for the next poll. Returns true when the worker should stop.
    async fn idle(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => false,
            _ = self.wake.notified(), if self.config.wake_on_enqueue => false,
            changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        }
    }
}
