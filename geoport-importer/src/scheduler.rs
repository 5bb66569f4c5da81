//! In-process job scheduler with named queues.
//!
//! Every queue is bounded by its own semaphore. Jobs are tracked so callers
//! can drain outstanding work with [`Scheduler::wait_idle`]. A chord runs a
//! group of header jobs concurrently and then either submits its body or
//! reports the first failure, once.
#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use geoport_core::{ExecutionId, ExecutionLedger, LayerRef, LayerState};
use log::{debug, error, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::task::TaskTracker;

use crate::error::TaskError;

/// Concurrency applied to queues without an explicit limit.
pub const DEFAULT_QUEUE_CONCURRENCY: usize = 4;

/// Attempts made to record a failure before giving up.
const FAILURE_RECORD_ATTEMPTS: u32 = 5;

const FAILURE_RECORD_BACKOFF: Duration = Duration::from_millis(100);

/// Future produced by one job attempt.
pub type JobFuture = BoxFuture<'static, Result<(), TaskError>>;

type JobFn = dyn Fn() -> JobFuture + Send + Sync;

/// A unit of work bound to a queue and an execution.
///
/// The closure is called once per attempt, so retries start from scratch.
#[derive(Clone)]
pub struct Job {
    queue: String,
    exec_id: ExecutionId,
    label: String,
    run: Arc<JobFn>,
}

impl Job {
    /// Build a job running `run` on `queue`.
    #[must_use]
    pub fn new<F, Fut>(
        queue: impl Into<String>,
        exec_id: ExecutionId,
        label: impl Into<String>,
        run: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Self {
            queue: queue.into(),
            exec_id,
            label: label.into(),
            run: Arc::new(move || run().boxed()),
        }
    }

    /// Queue the job runs on.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Execution the job belongs to.
    #[must_use]
    pub const fn exec_id(&self) -> ExecutionId {
        self.exec_id
    }

    /// Human readable description used in logs.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("queue", &self.queue)
            .field("exec_id", &self.exec_id)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// How often a failed job is attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first failure.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 1 }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Concurrency of queues without an override.
    pub default_concurrency: usize,
    /// Per-queue concurrency overrides.
    pub queue_concurrency: BTreeMap<String, usize>,
    /// Retry behaviour shared by every queue.
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_concurrency: DEFAULT_QUEUE_CONCURRENCY,
            queue_concurrency: BTreeMap::new(),
            retry: RetryPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    fn concurrency(&self, queue: &str) -> usize {
        self.queue_concurrency
            .get(queue)
            .copied()
            .unwrap_or(self.default_concurrency)
            .max(1)
    }
}

/// Counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Jobs handed to the queue.
    pub submitted: u64,
    /// Jobs that eventually succeeded.
    pub succeeded: u64,
    /// Jobs that exhausted their attempts.
    pub failed: u64,
    /// Attempts repeated after a retryable failure.
    pub retried: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> QueueStats {
        QueueStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct Queue {
    permits: Semaphore,
    counters: Counters,
}

/// Reacts to a job that failed for good.
#[async_trait]
pub trait FailureHook: Send + Sync {
    /// Called once per failed job, or once per failed chord.
    async fn on_failure(&self, exec_id: ExecutionId, queue: &str, error: &TaskError);
}

/// [`FailureHook`] that marks the execution failed in the ledger.
///
/// When built [`for_layer`](Self::for_layer), the layer's progress row is
/// also marked failed.
#[derive(Clone)]
pub struct LedgerFailureHook {
    ledger: Arc<dyn ExecutionLedger>,
    layer: Option<(LayerRef, String)>,
}

impl LedgerFailureHook {
    /// Hook writing to `ledger`.
    #[must_use]
    pub fn new(ledger: Arc<dyn ExecutionLedger>) -> Self {
        Self {
            ledger,
            layer: None,
        }
    }

    /// The same hook, additionally marking `layer` failed at `stage`.
    #[must_use]
    pub fn for_layer(&self, layer: LayerRef, stage: impl Into<String>) -> Self {
        Self {
            ledger: Arc::clone(&self.ledger),
            layer: Some((layer, stage.into())),
        }
    }
}

impl fmt::Debug for LedgerFailureHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerFailureHook")
            .field("layer", &self.layer)
            .finish_non_exhaustive()
    }
}

impl LedgerFailureHook {
    async fn record(&self, exec_id: ExecutionId, detail: &str) -> Result<bool, TaskError> {
        let ledger = Arc::clone(&self.ledger);
        let layer = self.layer.clone();
        let detail = detail.to_owned();
        run_blocking(move || {
            if let Some((layer, stage)) = &layer {
                ledger.record_layer_stage(exec_id, layer, stage, LayerState::Failed)?;
            }
            ledger.set_failed(exec_id, &detail)
        })
        .await
    }
}

#[async_trait]
impl FailureHook for LedgerFailureHook {
    async fn on_failure(&self, exec_id: ExecutionId, queue: &str, error: &TaskError) {
        let detail = error.to_string();
        error!("task failed for execution {exec_id} on {queue}: {detail}");
        let mut attempt: u32 = 1;
        loop {
            match self.record(exec_id, &detail).await {
                Ok(true) => return,
                Ok(false) => {
                    debug!("execution {exec_id} was already terminal");
                    return;
                }
                Err(err) if err.is_retryable() && attempt < FAILURE_RECORD_ATTEMPTS => {
                    warn!("retrying failure record of execution {exec_id} after: {err}");
                    tokio::time::sleep(FAILURE_RECORD_BACKOFF.saturating_mul(attempt)).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(err) => {
                    error!(
                        "could not record failure of execution {exec_id} after {attempt} attempts: {err}"
                    );
                    return;
                }
            }
        }
    }
}

/// Run a synchronous store call on the blocking pool.
pub(crate) async fn run_blocking<T, E, F>(call: F) -> Result<T, TaskError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<TaskError> + Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|source| TaskError::Join { source })?
        .map_err(Into::into)
}

struct Inner {
    config: SchedulerConfig,
    queues: Mutex<HashMap<String, Arc<Queue>>>,
    hook: Arc<dyn FailureHook>,
    tracker: TaskTracker,
}

impl Inner {
    fn queue(&self, name: &str) -> Arc<Queue> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = queues.entry(name.to_owned()).or_insert_with(|| {
            Arc::new(Queue {
                permits: Semaphore::new(self.config.concurrency(name)),
                counters: Counters::default(),
            })
        });
        Arc::clone(queue)
    }

    async fn execute(&self, queue: &Queue, job: &Job) -> Result<(), TaskError> {
        // The semaphore is never closed, so a failed acquire cannot happen.
        let _permit = queue.permits.acquire().await.ok();
        let mut attempt: u32 = 0;
        loop {
            debug!("running {} on {} (attempt {})", job.label, job.queue, attempt + 1);
            // A panicking job surfaces as a join error instead of tearing down
            // the tracker task.
            let outcome = match tokio::spawn((job.run)()).await {
                Ok(outcome) => outcome,
                Err(source) => Err(TaskError::Join { source }),
            };
            match outcome {
                Ok(()) => {
                    Counters::bump(&queue.counters.succeeded);
                    return Ok(());
                }
                Err(err) if err.is_retryable() && attempt < self.config.retry.max_retries => {
                    attempt = attempt.saturating_add(1);
                    Counters::bump(&queue.counters.retried);
                    warn!("retrying {} on {} after: {err}", job.label, job.queue);
                }
                Err(err) => {
                    Counters::bump(&queue.counters.failed);
                    return Err(err);
                }
            }
        }
    }
}

/// Runs jobs on named, bounded queues.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.inner.config)
            .field("outstanding", &self.inner.tracker.len())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Scheduler reporting failed jobs to `hook`.
    #[must_use]
    pub fn new(config: SchedulerConfig, hook: Arc<dyn FailureHook>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                queues: Mutex::new(HashMap::new()),
                hook,
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Queue `job` without waiting for it.
    ///
    /// A job that exhausts its attempts is reported to the failure hook.
    pub fn submit(&self, job: Job) {
        let queue = self.inner.queue(job.queue());
        Counters::bump(&queue.counters.submitted);
        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(async move {
            if let Err(err) = inner.execute(&queue, &job).await {
                inner.hook.on_failure(job.exec_id, &job.queue, &err).await;
            }
        });
    }

    /// Run `header` concurrently, then submit `body` if every header job
    /// succeeded.
    ///
    /// Otherwise `on_error` is called once with the first failure and the
    /// body never runs. Header jobs are not reported to the default hook.
    pub fn chord(&self, header: Vec<Job>, body: Job, on_error: Arc<dyn FailureHook>) {
        let header: Vec<_> = header
            .into_iter()
            .map(|job| {
                let queue = self.inner.queue(job.queue());
                Counters::bump(&queue.counters.submitted);
                (queue, job)
            })
            .collect();
        let scheduler = self.clone();
        self.inner.tracker.spawn(async move {
            let mut running = JoinSet::new();
            for (queue, job) in header {
                let inner = Arc::clone(&scheduler.inner);
                running.spawn(async move {
                    let outcome = inner.execute(&queue, &job).await;
                    (job.queue, outcome)
                });
            }
            let mut first_failure = None;
            while let Some(joined) = running.join_next().await {
                let (queue, outcome) = joined.unwrap_or_else(|source| {
                    (body.queue.clone(), Err(TaskError::Join { source }))
                });
                if let Err(err) = outcome {
                    warn!(
                        "chord member on {queue} failed for execution {}: {err}",
                        body.exec_id
                    );
                    if first_failure.is_none() {
                        first_failure = Some((queue, err));
                    }
                }
            }
            match first_failure {
                None => scheduler.submit(body),
                Some((queue, err)) => on_error.on_failure(body.exec_id, &queue, &err).await,
            }
        });
    }

    /// Wait until every submitted job, including jobs they submit, is done.
    pub async fn wait_idle(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    /// Counters for `queue`; zero for queues never used.
    #[must_use]
    pub fn stats(&self, queue: &str) -> QueueStats {
        let queues = self
            .inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        queues
            .get(queue)
            .map(|queue| queue.counters.snapshot())
            .unwrap_or_default()
    }
}
