//! Worker runtime: owns the queue consumer, its lifecycle, and failure routing.
//!
//! ## Lifecycle
//!
//! `stopped → starting → running → stopping → stopped`. Concurrent `start()` calls share
//! one in-flight start and its result; concurrent `stop()` calls share one shutdown.
//! Both run on spawned tasks, so a caller going away does not leave resources half open.
//!
//! ## Shutdown
//!
//! 1. Cancel the shutdown token: pending lock-held requeue waits abort, dispatch stops.
//! 2. Wait for in-flight sweeps (they are never cancelled).
//! 3. Drain every in-flight failure route (requeue or dead-letter write).
//! 4. Close the job queue, the dead-letter queue, then the connection. Every close runs;
//!    failures are aggregated.

pub mod backend;
pub mod failure;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::jobs::{DeadLetterQueue, Job, JobId, JobQueue, QueueError};
use crate::store::{ConnectionErrorLog, StoreConnection, StoreError};
use crate::sweep::SweepProcessor;

pub use backend::{InMemoryBackend, QueueBackend};
pub use failure::{
    FailureDisposition, FailureRouter, RequeueError, STALLED_ERROR_NAME, lock_held_requeue_count,
    resolve_requeue_delay,
};

/// Wait between connect / readiness attempts during startup.
const RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// Runtime error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("worker startup failed: {0}")]
    Startup(#[source] StoreError),

    #[error("worker not ready after {timeout:?}")]
    StartupTimeout {
        timeout: Duration,
        #[source]
        last_error: Option<StoreError>,
    },

    #[error("worker is stopping")]
    Stopping,

    #[error("failed to close {resource}: {source}")]
    Close {
        resource: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("worker shutdown failed with {} errors: {}", .0.len(), join_errors(.0))]
    Shutdown(Vec<RuntimeError>),

    #[error("worker task failed: {0}")]
    Task(String),
}

fn join_errors(errors: &[RuntimeError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Where the runtime is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub requeued: u64,
    pub current_running: usize,
}

type SharedResult = Shared<BoxFuture<'static, Result<(), RuntimeError>>>;

struct Resources<C> {
    connection: Arc<C>,
    dead_letter: Arc<dyn DeadLetterQueue>,
    queue: Arc<dyn JobQueue>,
    shutdown: CancellationToken,
    dispatcher: JoinHandle<()>,
    jobs: TaskTracker,
    pending: TaskTracker,
}

enum Lifecycle<C> {
    Stopped,
    Starting(SharedResult),
    Running(Resources<C>),
    Stopping(SharedResult),
}

/// Resources opened so far by an in-flight start.
struct Partial<C> {
    connection: Option<Arc<C>>,
    dead_letter: Option<Arc<dyn DeadLetterQueue>>,
    queue: Option<Arc<dyn JobQueue>>,
    last_error: Option<StoreError>,
}

impl<C> Partial<C> {
    fn new() -> Self {
        Self {
            connection: None,
            dead_letter: None,
            queue: None,
            last_error: None,
        }
    }
}

struct RuntimeInner<B: QueueBackend> {
    backend: B,
    processor: SweepProcessor,
    config: WorkerConfig,
    lifecycle: Mutex<Lifecycle<B::Connection>>,
    stats: Arc<Mutex<WorkerStats>>,
    connection_errors: ConnectionErrorLog,
}

/// Runs sweep jobs from a queue.
///
/// Cloning yields another handle to the same runtime.
pub struct WorkerRuntime<B: QueueBackend> {
    inner: Arc<RuntimeInner<B>>,
}

impl<B: QueueBackend> Clone for WorkerRuntime<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

enum StartAction {
    Done,
    Wait(SharedResult),
    Busy,
}

enum StopAction {
    Done,
    WaitForStart(SharedResult),
    Join(SharedResult),
}

impl<B: QueueBackend> WorkerRuntime<B> {
    pub fn new(backend: B, processor: SweepProcessor, config: WorkerConfig) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                backend,
                processor,
                config,
                lifecycle: Mutex::new(Lifecycle::Stopped),
                stats: Arc::new(Mutex::new(WorkerStats::default())),
                connection_errors: ConnectionErrorLog::new(),
            }),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> RuntimeState {
        match &*self.inner.lifecycle.lock().unwrap() {
            Lifecycle::Stopped => RuntimeState::Stopped,
            Lifecycle::Starting(_) => RuntimeState::Starting,
            Lifecycle::Running(_) => RuntimeState::Running,
            Lifecycle::Stopping(_) => RuntimeState::Stopping,
        }
    }

    /// Get current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        self.inner.stats.lock().unwrap().clone()
    }

    /// Connection errors suppressed during the current (or last) unready window.
    pub fn suppressed_connection_errors(&self) -> u64 {
        self.inner.connection_errors.suppressed()
    }

    /// Start the worker. A no-op when already running.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        let action = {
            let mut lifecycle = self.inner.lifecycle.lock().unwrap();
            match &*lifecycle {
                Lifecycle::Running(_) => StartAction::Done,
                Lifecycle::Starting(start) => StartAction::Wait(start.clone()),
                Lifecycle::Stopping(_) => StartAction::Busy,
                Lifecycle::Stopped => {
                    let inner = self.inner.clone();
                    let task = tokio::spawn(inner.start_resources());
                    let start = join_task(task);
                    *lifecycle = Lifecycle::Starting(start.clone());
                    StartAction::Wait(start)
                }
            }
        };

        match action {
            StartAction::Done => Ok(()),
            StartAction::Wait(start) => start.await,
            StartAction::Busy => Err(RuntimeError::Stopping),
        }
    }

    /// Stop the worker and release every resource. A no-op when already stopped.
    pub async fn stop(&self) -> Result<(), RuntimeError> {
        loop {
            let action = {
                let mut lifecycle = self.inner.lifecycle.lock().unwrap();
                match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                    Lifecycle::Stopped => StopAction::Done,
                    Lifecycle::Starting(start) => {
                        *lifecycle = Lifecycle::Starting(start.clone());
                        StopAction::WaitForStart(start)
                    }
                    Lifecycle::Stopping(stop) => {
                        *lifecycle = Lifecycle::Stopping(stop.clone());
                        StopAction::Join(stop)
                    }
                    Lifecycle::Running(resources) => {
                        let inner = self.inner.clone();
                        let task = tokio::spawn(inner.shutdown(resources));
                        let stop = join_task(task);
                        *lifecycle = Lifecycle::Stopping(stop.clone());
                        StopAction::Join(stop)
                    }
                }
            };

            match action {
                StopAction::Done => return Ok(()),
                StopAction::Join(stop) => return stop.await,
                StopAction::WaitForStart(start) => {
                    // A failed start already cleaned up after itself.
                    let _ = start.await;
                }
            }
        }
    }
}

fn join_task(task: JoinHandle<Result<(), RuntimeError>>) -> SharedResult {
    async move {
        match task.await {
            Ok(result) => result,
            Err(err) => Err(RuntimeError::Task(err.to_string())),
        }
    }
    .boxed()
    .shared()
}

/// Keep a reserved job's lease alive until `stop` fires.
async fn renew_lease(
    queue: Arc<dyn JobQueue>,
    id: JobId,
    lease: Duration,
    stop: CancellationToken,
) {
    let every = lease / 3;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = ticker.tick() => match queue.extend_lease(&id, lease).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(job_id = %id, "job lease lost; another worker may pick it up");
                    return;
                }
                Err(err) => warn!(job_id = %id, error = %err, "failed to renew job lease"),
            },
        }
    }
}

impl<B: QueueBackend> RuntimeInner<B> {
    async fn start_resources(self: Arc<Self>) -> Result<(), RuntimeError> {
        self.connection_errors.mark_unready();
        let timeout = self.config.startup_timeout;
        info!(
            queue = %self.config.queue_name,
            concurrency = self.config.concurrency,
            "worker starting"
        );

        let mut partial = Partial::new();
        let result = tokio::time::timeout(timeout, self.open(&mut partial)).await;
        let opened = match result {
            Ok(opened) => opened,
            Err(_) => Err(RuntimeError::StartupTimeout {
                timeout,
                last_error: partial.last_error.clone(),
            }),
        };

        if let Err(err) = opened {
            error!(error = %err, "worker startup failed; closing opened resources");
            self.teardown(partial).await;
            *self.lifecycle.lock().unwrap() = Lifecycle::Stopped;
            return Err(err);
        }

        let (Some(connection), Some(dead_letter), Some(queue)) =
            (partial.connection, partial.dead_letter, partial.queue)
        else {
            *self.lifecycle.lock().unwrap() = Lifecycle::Stopped;
            return Err(RuntimeError::Task("startup finished without resources".to_string()));
        };

        let shutdown = CancellationToken::new();
        let jobs = TaskTracker::new();
        let pending = TaskTracker::new();
        let router = FailureRouter::new(
            queue.clone(),
            dead_letter.clone(),
            shutdown.clone(),
            self.config.lock_held_requeue_max,
            self.stats.clone(),
        );
        let dispatcher = tokio::spawn(self.clone().dispatch(
            queue.clone(),
            router,
            shutdown.clone(),
            jobs.clone(),
            pending.clone(),
        ));

        *self.lifecycle.lock().unwrap() = Lifecycle::Running(Resources {
            connection,
            dead_letter,
            queue,
            shutdown,
            dispatcher,
            jobs,
            pending,
        });
        self.connection_errors.mark_ready();
        info!(queue = %self.config.queue_name, "worker ready");
        Ok(())
    }

    async fn open(&self, partial: &mut Partial<B::Connection>) -> Result<(), RuntimeError> {
        let connection = loop {
            match self.backend.connect().await {
                Ok(connection) => break connection,
                Err(err) => {
                    self.connection_errors.report("connect", &err);
                    partial.last_error = Some(err);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        };
        partial.connection = Some(connection.clone());

        let dead_letter = self
            .backend
            .open_dead_letter(&connection)
            .await
            .map_err(RuntimeError::Startup)?;
        partial.dead_letter = Some(dead_letter);

        let queue = self
            .backend
            .open_queue(&connection)
            .await
            .map_err(RuntimeError::Startup)?;
        partial.queue = Some(queue.clone());

        loop {
            match queue.ping().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    self.connection_errors.report("ready", &err);
                    partial.last_error = Some(err);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    /// Close whatever a failed start opened: consumer, dead-letter queue, connection.
    async fn teardown(&self, partial: Partial<B::Connection>) {
        if let Some(queue) = partial.queue {
            if let Err(err) = queue.close().await {
                warn!(error = %err, "failed to close job queue after startup failure");
            }
        }
        if let Some(dead_letter) = partial.dead_letter {
            if let Err(err) = dead_letter.close().await {
                warn!(error = %err, "failed to close dead-letter queue after startup failure");
            }
        }
        if let Some(connection) = partial.connection {
            if let Err(err) = connection.close().await {
                warn!(error = %err, "failed to close store connection after startup failure");
            }
        }
    }

    async fn dispatch(
        self: Arc<Self>,
        queue: Arc<dyn JobQueue>,
        router: FailureRouter,
        shutdown: CancellationToken,
        jobs: TaskTracker,
        pending: TaskTracker,
    ) {
        let permits = Arc::new(Semaphore::new(self.config.concurrency));
        let recover_every = self.config.job_lease / 2;
        let mut next_recovery = tokio::time::Instant::now();
        debug!(queue = %self.config.queue_name, "dispatch loop started");

        loop {
            if tokio::time::Instant::now() >= next_recovery {
                self.recover_stalled(&queue, &router, &pending).await;
                next_recovery = tokio::time::Instant::now() + recover_every;
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            if shutdown.is_cancelled() {
                break;
            }

            // A reserve in flight is never cancelled: the job would be left active.
            let idle = match queue.reserve(self.config.job_lease).await {
                Ok(Some(job)) => {
                    let inner = self.clone();
                    let queue = queue.clone();
                    let router = router.clone();
                    let pending = pending.clone();
                    jobs.spawn(async move {
                        inner.run_job(job, queue, router, pending).await;
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => self.config.poll_interval,
                Err(QueueError::Store(err)) => {
                    self.connection_errors.report("reserve", &err);
                    RECONNECT_DELAY.max(self.config.poll_interval)
                }
                Err(err) => {
                    error!(error = %err, "failed to reserve job");
                    self.config.poll_interval
                }
            };

            drop(permit);
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(idle.min(recover_every)) => {}
            }
        }

        debug!(queue = %self.config.queue_name, "dispatch loop stopped");
    }

    /// Hand jobs whose lease ran out back to the queue, dead-lettering the repeat offenders.
    async fn recover_stalled(
        &self,
        queue: &Arc<dyn JobQueue>,
        router: &FailureRouter,
        pending: &TaskTracker,
    ) {
        let stalled = match queue.recover_stalled().await {
            Ok(stalled) => stalled,
            Err(QueueError::Store(err)) => {
                self.connection_errors.report("recover_stalled", &err);
                return;
            }
            Err(err) => {
                error!(error = %err, "failed to recover stalled jobs");
                return;
            }
        };

        for id in &stalled.requeued {
            warn!(job_id = %id, "stalled job moved back to waiting");
        }
        for job in stalled.failed {
            warn!(job_id = %job.id, stalled_count = job.stalled_count, "stalled job failed");
            let router = router.clone();
            pending.spawn(async move {
                router.route_stalled(job).await;
            });
        }
    }

    async fn run_job(
        &self,
        job: Job,
        queue: Arc<dyn JobQueue>,
        router: FailureRouter,
        pending: TaskTracker,
    ) {
        {
            let mut stats = self.stats.lock().unwrap();
            stats.processed += 1;
            stats.current_running += 1;
        }

        let renewal = CancellationToken::new();
        let renewing = tokio::spawn(renew_lease(
            queue.clone(),
            job.id.clone(),
            self.config.job_lease,
            renewal.clone(),
        ));
        let result = self.processor.process(&job).await;
        renewal.cancel();
        if let Err(err) = renewing.await {
            warn!(job_id = %job.id, error = %err, "lease renewal task failed");
        }

        {
            let mut stats = self.stats.lock().unwrap();
            stats.current_running = stats.current_running.saturating_sub(1);
            match result {
                Ok(_) => stats.succeeded += 1,
                Err(_) => stats.failed += 1,
            }
        }

        match result {
            Ok(outcome) => {
                let value = match serde_json::to_value(&outcome) {
                    Ok(value) => value,
                    Err(err) => {
                        error!(job_id = %job.id, error = %err, "failed to serialize sweep outcome");
                        serde_json::Value::Null
                    }
                };
                if let Err(err) = queue.complete(&job.id, value).await {
                    error!(job_id = %job.id, error = %err, "failed to mark job completed");
                }
            }
            Err(err) => match queue.fail(&job.id, &err.to_string()).await {
                Ok(updated) => {
                    debug!(
                        job_id = %job.id,
                        error_name = err.name(),
                        attempts_made = updated.attempts_made,
                        "job failed"
                    );
                    pending.spawn(async move {
                        router.route(updated, &err).await;
                    });
                }
                Err(queue_err) => {
                    error!(job_id = %job.id, error = %queue_err, "failed to record job failure");
                }
            },
        }
    }

    async fn shutdown(
        self: Arc<Self>,
        resources: Resources<B::Connection>,
    ) -> Result<(), RuntimeError> {
        info!(queue = %self.config.queue_name, "worker stopping");
        let mut errors = Vec::new();

        resources.shutdown.cancel();
        if let Err(err) = resources.dispatcher.await {
            errors.push(RuntimeError::Task(err.to_string()));
        }

        resources.jobs.close();
        resources.jobs.wait().await;
        resources.pending.close();
        resources.pending.wait().await;

        if let Err(source) = resources.queue.close().await {
            errors.push(RuntimeError::Close {
                resource: "job queue",
                source,
            });
        }
        if let Err(source) = resources.dead_letter.close().await {
            errors.push(RuntimeError::Close {
                resource: "dead-letter queue",
                source,
            });
        }
        if let Err(source) = resources.connection.close().await {
            errors.push(RuntimeError::Close {
                resource: "store connection",
                source,
            });
        }

        *self.lifecycle.lock().unwrap() = Lifecycle::Stopped;

        match errors.len() {
            0 => {
                info!(queue = %self.config.queue_name, "worker stopped");
                Ok(())
            }
            1 => {
                let err = errors.remove(0);
                error!(error = %err, "worker stopped with errors");
                Err(err)
            }
            _ => {
                let err = RuntimeError::Shutdown(errors);
                error!(error = %err, "worker stopped with errors");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobId, JobOptions, JobState, RetryPolicy, SweepEnqueuer};
    use crate::lock::{DistributedLock, InMemoryLockStore, LockToken};
    use crate::sweep::testing::FakeRetention;
    use retention_core::SweepRequest;

    const LOCK_KEY: &str = "retention:sweep:lock";

    fn config() -> WorkerConfig {
        WorkerConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_startup_timeout(Duration::from_secs(1))
    }

    fn runtime(
        backend: &InMemoryBackend,
        retention: FakeRetention,
    ) -> WorkerRuntime<InMemoryBackend> {
        let processor = SweepProcessor::new(Arc::new(retention));
        WorkerRuntime::new(backend.clone(), processor, config())
    }

    async fn enqueue(backend: &InMemoryBackend, request: SweepRequest, retry: RetryPolicy) {
        SweepEnqueuer::new(backend.queue().clone())
            .enqueue(request, Some(JobOptions::default().with_retry(retry)))
            .await
            .unwrap();
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn runs_enqueued_sweep_to_completion() {
        let backend = InMemoryBackend::new("retention-sweep");
        let worker = runtime(&backend, FakeRetention::ok());
        enqueue(
            &backend,
            SweepRequest::manual().idempotency_key("nightly"),
            RetryPolicy::default(),
        )
        .await;

        worker.start().await.unwrap();
        assert_eq!(worker.state(), RuntimeState::Running);
        eventually(|| worker.stats().succeeded == 1).await;
        worker.stop().await.unwrap();

        assert_eq!(worker.state(), RuntimeState::Stopped);
        let stats = worker.stats();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.current_running, 0);

        backend.connection().reopen();
        backend.queue().reopen();
        let counts = backend.queue().counts().await.unwrap();
        assert_eq!(counts.completed, 1);
        let job = backend
            .queue()
            .get(&JobId::new("retention-nightly"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.return_value.unwrap()["totalDeletedRows"], 42);
    }

    #[tokio::test]
    async fn concurrent_starts_share_one_start() {
        let backend = InMemoryBackend::new("retention-sweep");
        let worker = runtime(&backend, FakeRetention::ok());
        let other = worker.clone();

        let (a, b) = tokio::join!(worker.start(), other.start());
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(backend.connect_calls(), 1);

        // Starting a running worker is a no-op.
        worker.start().await.unwrap();
        assert_eq!(backend.connect_calls(), 1);

        worker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failed_start_closes_partial_resources() {
        let backend = InMemoryBackend::new("retention-sweep");
        backend.fail_open_queue(true);
        let worker = runtime(&backend, FakeRetention::ok());

        let err = worker.start().await.unwrap_err();

        assert!(matches!(err, RuntimeError::Startup(_)));
        assert_eq!(worker.state(), RuntimeState::Stopped);
        assert!(backend.connection().is_closed());
        assert!(backend.dead_letter().recent(1).await.is_err());

        // A later start reopens everything.
        backend.fail_open_queue(false);
        worker.start().await.unwrap();
        assert_eq!(worker.state(), RuntimeState::Running);
        worker.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_timeout_tears_down_and_logs_once() {
        let backend = InMemoryBackend::new("retention-sweep");
        backend.connection().unready_for(u32::MAX);
        let worker = runtime(&backend, FakeRetention::ok());

        let err = worker.start().await.unwrap_err();

        match err {
            RuntimeError::StartupTimeout { timeout, last_error } => {
                assert_eq!(timeout, Duration::from_secs(1));
                assert!(matches!(last_error, Some(StoreError::Connection(_))));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(worker.suppressed_connection_errors() > 0);
        assert!(backend.connection().is_closed());
        assert_eq!(worker.state(), RuntimeState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_retried_until_it_succeeds() {
        let backend = InMemoryBackend::new("retention-sweep");
        backend.fail_connects(3);
        let worker = runtime(&backend, FakeRetention::ok());

        worker.start().await.unwrap();

        assert_eq!(backend.connect_calls(), 4);
        assert_eq!(worker.suppressed_connection_errors(), 2);
        worker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_drains_dead_letter_write_before_closing() {
        let backend = InMemoryBackend::new("retention-sweep");
        backend.dead_letter().set_push_delay(Duration::from_millis(200));
        let worker = runtime(&backend, FakeRetention::failing("purge sessions"));
        enqueue(
            &backend,
            SweepRequest::manual(),
            RetryPolicy::fixed(1, Duration::from_millis(1)),
        )
        .await;

        worker.start().await.unwrap();
        eventually(|| worker.stats().failed == 1).await;
        worker.stop().await.unwrap();

        let entries = backend.dead_letter().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].envelope.error.name, "RetentionSweepError");
        assert_eq!(worker.stats().dead_lettered, 1);
    }

    #[tokio::test]
    async fn stop_aborts_pending_lock_held_requeue() {
        let backend = InMemoryBackend::new("retention-sweep");
        let store = InMemoryLockStore::arc();
        let lock = DistributedLock::new(store.clone());
        let token = LockToken::generate();
        assert!(lock.acquire(LOCK_KEY, &token, Duration::from_secs(600)).await);

        let retention = Arc::new(FakeRetention::ok());
        let processor = SweepProcessor::new(retention.clone()).with_lock(
            lock,
            LOCK_KEY,
            Duration::from_secs(30),
        );
        let worker = WorkerRuntime::new(backend.clone(), processor, config());
        enqueue(
            &backend,
            SweepRequest::manual(),
            RetryPolicy::fixed(1, Duration::from_secs(60)),
        )
        .await;

        worker.start().await.unwrap();
        eventually(|| worker.stats().failed == 1).await;
        worker.stop().await.unwrap();

        let names: Vec<_> = backend
            .dead_letter()
            .entries()
            .into_iter()
            .map(|e| e.envelope.error.name)
            .collect();
        assert_eq!(names, vec!["RequeueAbortedError"]);
        assert_eq!(backend.queue().retry_calls(), 0);
        assert_eq!(retention.calls(), 0);
    }

    #[tokio::test]
    async fn close_errors_are_aggregated() {
        let backend = InMemoryBackend::new("retention-sweep");
        backend.connection().fail_on_close();
        backend.dead_letter().fail_on_close();
        let worker = runtime(&backend, FakeRetention::ok());

        worker.start().await.unwrap();
        let err = worker.stop().await.unwrap_err();

        match &err {
            RuntimeError::Shutdown(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("dead-letter queue"));
        assert!(err.to_string().contains("store connection"));
        // Every close ran despite the first failure.
        assert!(backend.connection().is_closed());
        assert_eq!(worker.state(), RuntimeState::Stopped);
    }

    #[tokio::test]
    async fn concurrent_stops_share_one_shutdown() {
        let backend = InMemoryBackend::new("retention-sweep");
        backend.connection().fail_on_close();
        let worker = runtime(&backend, FakeRetention::ok());
        worker.start().await.unwrap();

        let other = worker.clone();
        let (a, b) = tokio::join!(worker.stop(), other.stop());

        for result in [a, b] {
            assert!(matches!(
                result,
                Err(RuntimeError::Close {
                    resource: "store connection",
                    ..
                })
            ));
        }
        assert!(worker.stop().await.is_ok());
    }

    /// Leave `id` active with a lease that has already run out, as a crashed worker would.
    async fn abandon(backend: &InMemoryBackend) -> JobId {
        let job = backend
            .queue()
            .reserve(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        job.id
    }

    #[tokio::test]
    async fn job_abandoned_by_crashed_worker_is_redelivered() {
        let backend = InMemoryBackend::new("retention-sweep");
        enqueue(
            &backend,
            SweepRequest::manual().idempotency_key("nightly"),
            RetryPolicy::default(),
        )
        .await;
        let id = abandon(&backend).await;

        let worker = runtime(&backend, FakeRetention::ok());
        worker.start().await.unwrap();
        eventually(|| worker.stats().succeeded == 1).await;
        worker.stop().await.unwrap();

        backend.queue().reopen();
        let job = backend.queue().get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.stalled_count, 1);
        assert_eq!(job.attempts_made, 0);
        assert!(job.lease_until.is_none());
        assert!(backend.dead_letter().is_empty());
    }

    #[tokio::test]
    async fn job_stalling_repeatedly_is_dead_lettered() {
        let backend = InMemoryBackend::new("retention-sweep");
        enqueue(&backend, SweepRequest::manual(), RetryPolicy::default()).await;
        abandon(&backend).await;
        let recovered = backend.queue().recover_stalled().await.unwrap();
        assert_eq!(recovered.requeued.len(), 1);
        let id = abandon(&backend).await;

        let retention = Arc::new(FakeRetention::ok());
        let worker = WorkerRuntime::new(
            backend.clone(),
            SweepProcessor::new(retention.clone()),
            config(),
        );
        worker.start().await.unwrap();
        eventually(|| worker.stats().dead_lettered == 1).await;
        worker.stop().await.unwrap();

        let entries = backend.dead_letter().entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].envelope.job_id, id);
        assert_eq!(entries[0].envelope.error.name, STALLED_ERROR_NAME);
        assert_eq!(retention.calls(), 0);
        assert_eq!(worker.stats().processed, 0);
    }

    #[tokio::test]
    async fn lease_is_renewed_while_a_long_sweep_runs() {
        let backend = InMemoryBackend::new("retention-sweep");
        enqueue(&backend, SweepRequest::manual(), RetryPolicy::default()).await;
        let retention = FakeRetention::ok().taking(Duration::from_millis(600));
        let processor = SweepProcessor::new(Arc::new(retention));
        let worker = WorkerRuntime::new(
            backend.clone(),
            processor,
            config().with_job_lease(Duration::from_millis(150)),
        );

        worker.start().await.unwrap();
        eventually(|| worker.stats().succeeded == 1).await;
        worker.stop().await.unwrap();

        backend.queue().reopen();
        let counts = backend.queue().counts().await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(worker.stats().processed, 1);
    }

    #[tokio::test]
    async fn panicking_sweep_is_recorded_as_a_failure() {
        let backend = InMemoryBackend::new("retention-sweep");
        let worker = runtime(&backend, FakeRetention::panicking("index out of bounds"));
        enqueue(
            &backend,
            SweepRequest::manual().idempotency_key("nightly"),
            RetryPolicy::fixed(1, Duration::from_millis(1)),
        )
        .await;

        worker.start().await.unwrap();
        eventually(|| worker.stats().dead_lettered == 1).await;
        worker.stop().await.unwrap();

        let stats = worker.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.current_running, 0);

        backend.queue().reopen();
        let job = backend
            .queue()
            .get(&JobId::new("retention-nightly"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.state, JobState::Failed);
        let entry = &backend.dead_letter().entries()[0];
        assert_eq!(entry.envelope.error.name, "RetentionSweepError");
        assert!(entry.envelope.error.message.contains("index out of bounds"));
    }
}
