//! Bounded worker pool.
//!
//! `worker_count` consumers drain one shared queue. Each attempt runs the
//! handler in its own spawned task, so a panic is contained to that task and
//! reported as [`FailureKind::Internal`]. Failed attempts are re-enqueued
//! after a backoff when [`retry_decision`] allows it. Every submitted task
//! yields exactly one [`TaskOutcome`].

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::backoff::RetryBackoff;
use crate::error::{retry_decision, FailureKind, PipelineError, RetryDecision, TaskFailure};

/// Completed tasks between progress log lines.
const PROGRESS_INTERVAL: usize = 10;

/// Position of a task in the submitted batch.
pub type TaskId = usize;

// ============================================================================
// Tasks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

/// One unit of work, owned by the pool until its outcome is recorded.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub target_id: String,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub assigned_proxy: Option<String>,
    pub status: TaskStatus,
}

impl Task {
    pub fn new(id: TaskId, target_id: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            id,
            target_id: target_id.into(),
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            assigned_proxy: None,
            status: TaskStatus::Pending,
        }
    }
}

/// What the handler is told about the attempt it runs.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub target_id: String,
    /// 1-based
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Result of one handler invocation.
#[derive(Debug)]
pub struct Attempt<T> {
    /// Relay used, if any
    pub proxy: Option<String>,
    pub result: Result<T, TaskFailure>,
}

impl<T> Attempt<T> {
    pub fn direct(result: Result<T, TaskFailure>) -> Self {
        Self { proxy: None, result }
    }

    pub fn via(proxy: impl Into<String>, result: Result<T, TaskFailure>) -> Self {
        Self {
            proxy: Some(proxy.into()),
            result,
        }
    }
}

/// Terminal result of a task.
#[derive(Debug)]
pub struct TaskOutcome<T> {
    pub target_id: String,
    pub attempts: u32,
    pub last_proxy: Option<String>,
    pub result: Result<T, TaskFailure>,
}

impl<T> TaskOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Triggers cancellation of a batch.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        // Receivers may all be gone already
        let _ = self.0.send(true);
    }
}

/// Observes cancellation of a batch.
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        Self(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once cancellation is requested; pend forever otherwise.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                if *self.0.borrow() {
                    return;
                }
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a linked handle/signal pair.
pub fn cancel_channel() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelSignal(rx))
}

// ============================================================================
// Worker Pool
// ============================================================================

struct Finished<T> {
    task: Task,
    attempt: Attempt<T>,
}

/// Fixed-size pool of queue consumers.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    worker_count: usize,
    backoff: RetryBackoff,
    cancel_grace: Duration,
}

impl WorkerPool {
    pub fn new(worker_count: usize) -> Result<Self, PipelineError> {
        if worker_count == 0 {
            return Err(PipelineError::Init {
                component: "worker pool",
                reason: "worker_count must be greater than zero".into(),
            });
        }
        Ok(Self {
            worker_count,
            backoff: RetryBackoff::default(),
            cancel_grace: Duration::from_secs(5),
        })
    }

    pub fn with_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// How long in-flight attempts may keep running after cancellation.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Run every task to a terminal outcome.
    pub async fn submit_tasks<T, H, Fut>(&self, tasks: Vec<Task>, handler: H) -> BTreeMap<TaskId, TaskOutcome<T>>
    where
        T: Send + 'static,
        H: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Attempt<T>> + Send + 'static,
    {
        self.submit_tasks_with_cancel(tasks, handler, CancelSignal::never()).await
    }

    /// Like [`Self::submit_tasks`]; once `cancel` fires no new attempt
    /// starts, queued and backing-off tasks fail with `Cancelled`, and
    /// in-flight attempts get the grace period to finish.
    pub async fn submit_tasks_with_cancel<T, H, Fut>(
        &self,
        tasks: Vec<Task>,
        handler: H,
        mut cancel: CancelSignal,
    ) -> BTreeMap<TaskId, TaskOutcome<T>>
    where
        T: Send + 'static,
        H: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Attempt<T>> + Send + 'static,
    {
        let total = tasks.len();
        let mut outcomes = BTreeMap::new();
        if total == 0 {
            return outcomes;
        }

        let started = Instant::now();
        let handler = Arc::new(handler);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel::<Task>();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Finished<T>>();
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        let mut targets: HashMap<TaskId, String> = HashMap::with_capacity(total);
        for task in tasks {
            targets.insert(task.id, task.target_id.clone());
            // The receiver lives in `queue_rx` until the workers exit
            let _ = queue_tx.send(task);
        }

        let mut workers = JoinSet::new();
        for worker_id in 0..self.worker_count.min(total) {
            workers.spawn(run_worker(
                worker_id,
                Arc::clone(&queue_rx),
                event_tx.clone(),
                Arc::clone(&handler),
                cancel.clone(),
                self.cancel_grace,
            ));
        }
        drop(event_tx);

        let mut progress = Progress::new(total);
        let mut backing_off: HashMap<TaskId, Task> = HashMap::new();
        let mut retries: JoinSet<TaskId> = JoinSet::new();
        let mut cancelled = cancel.is_cancelled();

        while progress.completed < total {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(Finished { mut task, attempt }) = event else {
                        break;
                    };
                    task.assigned_proxy = attempt.proxy;

                    let failure = match attempt.result {
                        Ok(value) => {
                            task.status = TaskStatus::Succeeded;
                            progress.record(&mut outcomes, task, Ok(value));
                            continue;
                        }
                        Err(failure) => failure,
                    };

                    let decision = retry_decision(failure.kind, task.attempt_count, task.max_attempts);
                    if !cancelled && decision == RetryDecision::Retry {
                        let delay = self.backoff.delay_for(task.attempt_count);
                        debug!(
                            target_id = %task.target_id,
                            attempt = task.attempt_count,
                            max_attempts = task.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %failure,
                            "Attempt failed, retrying"
                        );
                        task.status = TaskStatus::Pending;
                        let id = task.id;
                        backing_off.insert(id, task);
                        retries.spawn(async move {
                            tokio::time::sleep(delay).await;
                            id
                        });
                    } else {
                        task.status = TaskStatus::Failed;
                        progress.record(&mut outcomes, task, Err(failure));
                    }
                }
                Some(joined) = retries.join_next(), if !retries.is_empty() => {
                    let Ok(id) = joined else { continue };
                    if let Some(task) = backing_off.remove(&id) {
                        let _ = queue_tx.send(task);
                    }
                }
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    warn!(
                        completed = progress.completed,
                        total,
                        backing_off = backing_off.len(),
                        "Batch cancelled"
                    );
                    retries.abort_all();
                    for (_, mut task) in backing_off.drain() {
                        task.status = TaskStatus::Failed;
                        progress.record(&mut outcomes, task, Err(TaskFailure::cancelled()));
                    }
                }
            }
        }

        // Only reachable if every worker died; nothing left can finish
        if progress.completed < total {
            for (id, target_id) in targets {
                if outcomes.contains_key(&id) {
                    continue;
                }
                error!(target_id = %target_id, "Task lost by worker pool");
                outcomes.insert(
                    id,
                    TaskOutcome {
                        target_id,
                        attempts: 0,
                        last_proxy: None,
                        result: Err(TaskFailure::new(FailureKind::Internal, "worker pool stopped")),
                    },
                );
            }
        }

        drop(queue_tx);
        while workers.join_next().await.is_some() {}

        info!(
            total,
            succeeded = progress.succeeded,
            failed = progress.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "All tasks finished"
        );
        outcomes
    }
}

struct Progress {
    total: usize,
    completed: usize,
    succeeded: usize,
    failed: usize,
}

impl Progress {
    fn new(total: usize) -> Self {
        Self {
            total,
            completed: 0,
            succeeded: 0,
            failed: 0,
        }
    }

    fn record<T>(&mut self, outcomes: &mut BTreeMap<TaskId, TaskOutcome<T>>, task: Task, result: Result<T, TaskFailure>) {
        match &result {
            Ok(_) => self.succeeded += 1,
            Err(failure) => {
                self.failed += 1;
                debug!(
                    target_id = %task.target_id,
                    attempts = task.attempt_count,
                    error = %failure,
                    "Task failed"
                );
            }
        }
        self.completed += 1;

        outcomes.insert(
            task.id,
            TaskOutcome {
                target_id: task.target_id,
                attempts: task.attempt_count,
                last_proxy: task.assigned_proxy,
                result,
            },
        );

        if self.completed % PROGRESS_INTERVAL == 0 {
            info!(
                completed = self.completed,
                total = self.total,
                succeeded = self.succeeded,
                failed = self.failed,
                "Batch progress"
            );
        }
    }
}

async fn run_worker<T, H, Fut>(
    worker_id: usize,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<Task>>>,
    events: mpsc::UnboundedSender<Finished<T>>,
    handler: Arc<H>,
    mut cancel: CancelSignal,
    grace: Duration,
) where
    T: Send + 'static,
    H: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Attempt<T>> + Send + 'static,
{
    loop {
        let next = queue.lock().await.recv().await;
        let Some(mut task) = next else {
            break;
        };

        if cancel.is_cancelled() {
            task.status = TaskStatus::Failed;
            if events
                .send(Finished {
                    task,
                    attempt: Attempt::direct(Err(TaskFailure::cancelled())),
                })
                .is_err()
            {
                break;
            }
            continue;
        }

        task.status = TaskStatus::InFlight;
        task.attempt_count += 1;
        let context = TaskContext {
            task_id: task.id,
            target_id: task.target_id.clone(),
            attempt: task.attempt_count,
            max_attempts: task.max_attempts,
        };

        let mut handle = tokio::spawn(handler.as_ref()(context));
        let attempt = tokio::select! {
            joined = &mut handle => from_join(joined),
            _ = cancel.cancelled() => match tokio::time::timeout(grace, &mut handle).await {
                Ok(joined) => from_join(joined),
                Err(_) => {
                    handle.abort();
                    warn!(
                        worker_id,
                        target_id = %task.target_id,
                        "In-flight task abandoned after cancel grace period"
                    );
                    Attempt::direct(Err(TaskFailure::cancelled()))
                }
            },
        };

        if events.send(Finished { task, attempt }).is_err() {
            break;
        }
    }
    debug!(worker_id, "Worker stopped");
}

fn from_join<T>(joined: Result<Attempt<T>, JoinError>) -> Attempt<T> {
    joined.unwrap_or_else(|e| {
        let detail = if e.is_panic() { "handler panicked" } else { "handler aborted" };
        error!(error = %e, "{}", detail);
        Attempt::direct(Err(TaskFailure::new(FailureKind::Internal, detail)))
    })
}

// ============================================================================
// Tests
// ============================================================================
