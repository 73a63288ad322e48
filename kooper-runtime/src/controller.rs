//! The reconciliation loop
//!
//! A [`Controller`] runs one [`EventSource`] task feeding a [`WorkQueue`], and a pool of workers
//! draining it. Every dequeued key is handed to the [`Handler`], unless this replica is not the
//! leader, in which case the key goes back to the queue untouched.
//!
//! Failures are retried with per-key exponential backoff. A key is handled at most
//! `max_retries + 1` times in a row without success, then it is dropped until the event source
//! queues it again.
use std::{future::Future, sync::Arc, time::Instant};

use kooper_core::{Config, ObjectKey};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{field, Instrument};

use crate::{
    handler::Handler,
    informer::{EventSource, SourceError},
    leader::{AlwaysLeader, Leadership},
    metrics::{MetricsRecorder, NoopRecorder, Outcome},
    workqueue::WorkQueue,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("controller {0} is already running")]
    AlreadyRunning(String),
    #[error("failed to initialize the event source: {0}")]
    Initialize(#[source] SourceError),
}

/// Lifecycle of a controller
///
/// The lock around it is only held to check and flip the state, never across an await.
enum RunState {
    Stopped,
    Starting,
    Running(Running),
    Stopping,
}

/// Everything a running controller has to tear down
struct Running {
    shutdown: CancellationToken,
    queue: WorkQueue<String>,
    tasks: Vec<JoinHandle<()>>,
}

/// Resets a controller left in [`RunState::Starting`] to [`RunState::Stopped`] when dropped
struct StartingGuard<'a>(&'a Mutex<RunState>);

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        if matches!(*state, RunState::Starting) {
            *state = RunState::Stopped;
        }
    }
}

/// Drives a [`Handler`] with the keys produced by an [`EventSource`]
pub struct Controller {
    config: Config,
    source: Arc<dyn EventSource>,
    handler: Arc<dyn Handler>,
    leadership: Arc<dyn Leadership>,
    metrics: Arc<dyn MetricsRecorder>,
    state: Mutex<RunState>,
}

impl Controller {
    /// A stopped controller, always leading and recording no metrics
    pub fn new(config: Config, source: impl EventSource + 'static, handler: impl Handler + 'static) -> Self {
        Self {
            config,
            source: Arc::new(source),
            handler: Arc::new(handler),
            leadership: Arc::new(AlwaysLeader),
            metrics: Arc::new(NoopRecorder),
            state: Mutex::new(RunState::Stopped),
        }
    }

    /// Only handle keys while `leadership` says so
    ///
    /// Pass [`LeaderElectorHandle::state`](crate::coordination::LeaderElectorHandle::state) to
    /// gate on a Lease.
    #[must_use]
    pub fn with_leadership(mut self, leadership: impl Leadership + 'static) -> Self {
        self.leadership = Arc::new(leadership);
        self
    }

    /// Report outcomes and durations to `metrics`
    #[must_use]
    pub fn with_metrics(mut self, metrics: impl MetricsRecorder + 'static) -> Self {
        self.metrics = Arc::new(metrics);
        self
    }

    /// The configuration the controller runs with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether the workers are running
    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), RunState::Running(_))
    }

    /// Initialize the event source, then spawn it along with the workers
    ///
    /// Returns as soon as everything is spawned. A stopped controller can be started again.
    ///
    /// # Errors
    /// [`Error::AlreadyRunning`] unless the controller is stopped, and
    /// [`Error::Initialize`] if the event source fails to initialize.
    pub async fn start(&self) -> Result<(), Error> {
        {
            let mut state = self.state.lock();
            if !matches!(*state, RunState::Stopped) {
                return Err(Error::AlreadyRunning(self.config.name().into()));
            }
            *state = RunState::Starting;
        }
        // back to stopped if initialization fails or this future is dropped before running
        let _starting = StartingGuard(&self.state);

        if let Err(err) = self.source.initialize().await {
            tracing::error!(controller = self.config.name(), error = %err, "event source failed to initialize");
            return Err(Error::Initialize(err));
        }

        let queue = WorkQueue::new();
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::with_capacity(self.config.concurrent_workers() + 1);
        tasks.push(tokio::spawn({
            let (source, queue, shutdown) = (self.source.clone(), queue.clone(), shutdown.clone());
            let resync_interval = self.config.resync_interval();
            async move { source.run(queue, resync_interval, shutdown).await }
        }));
        for id in 0..self.config.concurrent_workers() {
            let worker = Worker {
                id,
                config: self.config.clone(),
                queue: queue.clone(),
                handler: self.handler.clone(),
                leadership: self.leadership.clone(),
                metrics: self.metrics.clone(),
                shutdown: shutdown.clone(),
            };
            tasks.push(tokio::spawn(worker.run()));
        }

        *self.state.lock() = RunState::Running(Running { shutdown, queue, tasks });
        tracing::info!(
            controller = self.config.name(),
            workers = self.config.concurrent_workers(),
            "controller started"
        );
        Ok(())
    }

    /// Stop the event source and workers, waiting for handlers in progress to finish
    ///
    /// Does nothing unless the controller is running. In particular, a controller that is still
    /// initializing its event source is not stopped, and comes up running once [`Controller::start`]
    /// completes.
    pub async fn stop(&self) {
        let running = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, RunState::Stopping) {
                RunState::Running(running) => running,
                other => {
                    *state = other;
                    return;
                }
            }
        };

        tracing::info!(controller = self.config.name(), "stopping controller");
        running.shutdown.cancel();
        running.queue.shut_down();
        for task in running.tasks {
            if let Err(err) = task.await {
                tracing::error!(controller = self.config.name(), error = %err, "controller task failed");
            }
        }
        *self.state.lock() = RunState::Stopped;
        tracing::info!(controller = self.config.name(), "controller stopped");
    }

    /// Start, run until `shutdown` resolves, then stop
    ///
    /// # Errors
    /// Fails if the controller could not be started, see [`Controller::start`].
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<(), Error> {
        self.start().await?;
        shutdown.await;
        self.stop().await;
        Ok(())
    }
}

struct Worker {
    id: usize,
    config: Config,
    queue: WorkQueue<String>,
    handler: Arc<dyn Handler>,
    leadership: Arc<dyn Leadership>,
    metrics: Arc<dyn MetricsRecorder>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        tracing::debug!(controller = self.config.name(), worker = self.id, "worker started");
        loop {
            // cancellation is only observed between keys, a running handler is never interrupted
            let key = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                key = self.queue.get() => match key {
                    Some(key) => key,
                    None => break,
                },
            };
            self.process(key).await;
        }
        tracing::debug!(controller = self.config.name(), worker = self.id, "worker stopped");
    }

    async fn process(&self, key: String) {
        if !self.leadership.is_leader() {
            tracing::trace!(controller = self.config.name(), %key, "not leading, requeueing");
            self.queue.done(&key);
            self.queue.add_after(key, self.config.not_leader_requeue());
            return;
        }

        let retries = self.queue.num_requeues(&key);
        let max_retries = self.config.max_retries();
        let object = key.parse::<ObjectKey>().ok();
        let span = tracing::info_span!(
            "reconcile",
            controller = self.config.name(),
            kubernetes.object.key = %key,
            kubernetes.object.namespace = object.as_ref().and_then(|o| o.namespace.as_deref()).unwrap_or_default(),
            kubernetes.object.name = object.as_ref().map_or(key.as_str(), |o| o.name.as_str()),
            processing_retry = retries,
            retries_remaining = max_retries.saturating_sub(retries),
            controller.cfg.max_retries = max_retries,
            controller.cfg.concurrent_workers = self.config.concurrent_workers(),
            controller.cfg.resync_interval = ?self.config.resync_interval(),
            success = field::Empty,
            message = field::Empty,
        );
        let outcome = self.handle(&key, retries).instrument(span).await;
        self.queue.done(&key);
        tracing::trace!(controller = self.config.name(), %key, %outcome, "key done");
    }

    /// Invoke the handler once and decide whether the key is retried
    async fn handle(&self, key: &str, retries: u32) -> Outcome {
        let span = tracing::Span::current();
        let started = Instant::now();
        let result = self.handler.handle(key).await;
        let elapsed = started.elapsed();

        let outcome = match result {
            Ok(()) => {
                self.queue.forget(&key.to_string());
                span.record("success", true);
                tracing::debug!(?elapsed, "processed");
                Outcome::Processed
            }
            Err(err) if retries < self.config.max_retries() => {
                span.record("success", false);
                span.record("message", field::display(&err));
                tracing::warn!(error = %err, "handler failed, retrying");
                self.queue.add_rate_limited(key.to_string());
                Outcome::Retried
            }
            Err(err) => {
                self.queue.forget(&key.to_string());
                span.record("success", false);
                span.record("message", field::display(&err));
                tracing::error!(error = %err, "handler failed, no retries left, dropping key");
                Outcome::Dropped
            }
        };
        self.metrics.observe_outcome(self.config.name(), outcome, key);
        self.metrics.observe_duration(self.config.name(), outcome, elapsed);
        outcome
    }
}
