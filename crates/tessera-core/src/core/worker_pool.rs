use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TryRecvError, bounded, unbounded};

use crate::archive::TileSink;
use crate::config::DownloadConfig;
use crate::core::gate::{GateStatus, PauseResumeGate};
use crate::error::{FailureClass, TesseraError};
use crate::source::{FetchContext, NoopSourceListener, SourceListener, TileSourceResolver};
use crate::telemetry::worker::{DefaultWorkerTelemetry, WorkerTelemetry};
use crate::telemetry::{self, tags};
use crate::types::{DownloadJob, JobOutcome, JobStatus, Result, TileCoord, duration_to_us};

/// Granularity at which idle or paused workers re-check their stop flags.
const WORKER_POLL: Duration = Duration::from_millis(20);

/// Receives what workers did with the jobs of one [`JobScope`].
///
/// Called on worker threads, so implementations must be thread safe and
/// must not call back into blocking pool operations.
pub trait JobListener: Send + Sync {
    /// Every resolved attempt, including retryable failures.
    fn on_outcome(&self, outcome: &JobOutcome);

    /// An error that must abort the whole map.
    fn on_fatal(&self, coord: TileCoord, error: TesseraError);
}

/// Binds jobs to the destination and listener of one map pass.
///
/// Cancelling a scope discards its queued jobs as they are dequeued and
/// drops results of its in-flight jobs, leaving other scopes untouched.
pub struct JobScope {
    sink: Option<Arc<dyn TileSink>>,
    listener: Arc<dyn JobListener>,
    cancelled: AtomicBool,
}

impl JobScope {
    pub fn new(sink: Option<Arc<dyn TileSink>>, listener: Arc<dyn JobListener>) -> Arc<Self> {
        Arc::new(Self {
            sink,
            listener,
            cancelled: AtomicBool::new(false),
        })
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct QueuedJob {
    job: DownloadJob,
    attempt: u32,
    scope: Arc<JobScope>,
}

/// Result of a non-blocking submission attempt.
#[derive(Debug)]
pub enum SubmitOutcome {
    Accepted,
    /// The queue stayed full for the whole timeout; the job is handed back.
    QueueFull(DownloadJob),
}

/// Point-in-time view of the counters the orchestrator polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolState {
    /// Jobs waiting in either queue, including ones held by a paused worker.
    pub queued: usize,
    /// Jobs currently being fetched or stored.
    pub active: usize,
    /// Whether the shared gate is paused.
    pub is_paused: bool,
    /// Whether the pool was terminated or the gate cancelled.
    pub is_cancelled: bool,
}

/// Per-worker runtime statistics.
#[derive(Debug, Clone)]
pub struct WorkerRuntimeSnapshot {
    /// Index of the worker thread.
    pub worker_id: usize,
    /// Jobs this worker has executed, whatever their outcome.
    pub tasks_completed: usize,
    /// Time spent executing jobs.
    pub busy: Duration,
    /// Fraction of the pool lifetime spent busy, between 0.0 and 1.0.
    pub utilization: f64,
}

/// Runtime statistics of the whole pool.
#[derive(Debug, Clone)]
pub struct PoolRuntimeSnapshot {
    /// Time since the pool was spawned.
    pub elapsed: Duration,
    /// Queue and gate state at snapshot time.
    pub state: PoolState,
    /// Jobs claimed by workers since spawn, retries included.
    pub claimed: u64,
    /// Worker threads still running.
    pub live_workers: usize,
    /// One entry per worker, ordered by id.
    pub workers: Vec<WorkerRuntimeSnapshot>,
}

struct PoolShared {
    gate: Arc<PauseResumeGate>,
    resolver: TileSourceResolver,
    telemetry: Arc<dyn WorkerTelemetry>,
    source_listener: Arc<dyn SourceListener>,
    jobs_rx: Receiver<QueuedJob>,
    retry_tx: Sender<QueuedJob>,
    retry_rx: Receiver<QueuedJob>,
    max_retries: u32,
    started_at: Instant,
    queued: AtomicUsize,
    active: AtomicUsize,
    claimed: AtomicU64,
    live_workers: AtomicUsize,
    stopping: AtomicBool,
    terminated: AtomicBool,
    task_counts: Vec<AtomicUsize>,
    worker_busy_us: Vec<AtomicU64>,
    idle_lock: Mutex<()>,
    idle_signal: Condvar,
}

impl PoolShared {
    fn is_idle(&self) -> bool {
        self.queued.load(Ordering::Acquire) == 0 && self.active.load(Ordering::Acquire) == 0
    }

    fn should_exit(&self) -> bool {
        self.stopping.load(Ordering::Acquire) || self.terminated.load(Ordering::Acquire)
    }

    fn release_queued(&self, count: usize) {
        if count == 0 {
            return;
        }
        let _ = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                Some(queued.saturating_sub(count))
            });
        self.notify_if_idle();
    }

    fn notify_if_idle(&self) {
        if self.is_idle() {
            let _guard = lock_unpoisoned(&self.idle_lock);
            self.idle_signal.notify_all();
        }
    }
}

/// Fixed-size set of threads executing [`DownloadJob`]s end to end.
///
/// Fresh jobs flow through a bounded queue, which throttles the producer.
/// Retries go through a separate unbounded queue that workers drain first,
/// so a worker never blocks on a full queue while re-enqueueing.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    jobs_tx: Sender<QueuedJob>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    num_workers: usize,
}

impl WorkerPool {
    pub fn spawn(
        config: &DownloadConfig,
        gate: Arc<PauseResumeGate>,
        resolver: TileSourceResolver,
    ) -> Result<Self> {
        Self::spawn_with(
            config,
            gate,
            resolver,
            Arc::new(DefaultWorkerTelemetry),
            Arc::new(NoopSourceListener),
        )
    }

    pub fn spawn_with(
        config: &DownloadConfig,
        gate: Arc<PauseResumeGate>,
        resolver: TileSourceResolver,
        telemetry: Arc<dyn WorkerTelemetry>,
        source_listener: Arc<dyn SourceListener>,
    ) -> Result<Self> {
        config.validate()?;
        let num_workers = config.workers;
        let (jobs_tx, jobs_rx) = bounded(config.queue_capacity);
        let (retry_tx, retry_rx) = unbounded();

        let shared = Arc::new(PoolShared {
            gate,
            resolver,
            telemetry,
            source_listener,
            jobs_rx,
            retry_tx,
            retry_rx,
            max_retries: config.max_download_retries,
            started_at: Instant::now(),
            queued: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            claimed: AtomicU64::new(0),
            live_workers: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            task_counts: (0..num_workers).map(|_| AtomicUsize::new(0)).collect(),
            worker_busy_us: (0..num_workers).map(|_| AtomicU64::new(0)).collect(),
            idle_lock: Mutex::new(()),
            idle_signal: Condvar::new(),
        });

        let pool = Self {
            shared: Arc::clone(&shared),
            jobs_tx,
            handles: Mutex::new(Vec::with_capacity(num_workers)),
            num_workers,
        };

        for worker_id in 0..num_workers {
            let worker_shared = Arc::clone(&shared);
            worker_shared.live_workers.fetch_add(1, Ordering::AcqRel);
            let spawned = thread::Builder::new()
                .name(format!("tessera-worker-{worker_id}"))
                .spawn(move || run_worker_loop(worker_id, worker_shared));
            match spawned {
                Ok(handle) => lock_unpoisoned(&pool.handles).push(handle),
                Err(error) => {
                    shared.live_workers.fetch_sub(1, Ordering::AcqRel);
                    pool.terminate_all();
                    return Err(TesseraError::Io(error).with_context("spawn worker thread"));
                }
            }
        }

        tracing::debug!(
            target: tags::TARGET_WORKER,
            workers = num_workers,
            queue_capacity = config.queue_capacity,
            max_retries = config.max_download_retries,
            "worker pool started"
        );
        Ok(pool)
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn gate(&self) -> &Arc<PauseResumeGate> {
        &self.shared.gate
    }

    /// Enqueues a job, blocking while the queue is full.
    pub fn submit(&self, job: DownloadJob, scope: &Arc<JobScope>) -> Result<()> {
        self.ensure_accepting()?;
        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        let queued = QueuedJob {
            job,
            attempt: 0,
            scope: Arc::clone(scope),
        };
        if self.jobs_tx.send(queued).is_err() {
            self.shared.release_queued(1);
            return Err(TesseraError::Cancelled);
        }
        Ok(())
    }

    /// Enqueues a job, giving up after `timeout` if the queue stays full.
    pub fn submit_timeout(
        &self,
        job: DownloadJob,
        scope: &Arc<JobScope>,
        timeout: Duration,
    ) -> Result<SubmitOutcome> {
        self.ensure_accepting()?;
        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        let queued = QueuedJob {
            job,
            attempt: 0,
            scope: Arc::clone(scope),
        };
        match self.jobs_tx.send_timeout(queued, timeout) {
            Ok(()) => Ok(SubmitOutcome::Accepted),
            Err(SendTimeoutError::Timeout(queued)) => {
                self.shared.release_queued(1);
                Ok(SubmitOutcome::QueueFull(queued.job))
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                self.shared.release_queued(1);
                Err(TesseraError::Cancelled)
            }
        }
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.shared.should_exit() {
            Err(TesseraError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Drops every queued job without running it and returns how many.
    ///
    /// Jobs already held by a worker waiting on the gate are dropped only
    /// if their scope is cancelled.
    pub fn cancel_outstanding(&self) -> usize {
        let mut drained = 0usize;
        while self.shared.retry_rx.try_recv().is_ok() {
            drained += 1;
        }
        while self.shared.jobs_rx.try_recv().is_ok() {
            drained += 1;
        }
        self.shared.release_queued(drained);
        if drained > 0 {
            tracing::debug!(target: tags::TARGET_WORKER, drained, "outstanding jobs cancelled");
        }
        drained
    }

    /// Hard stop: cancels the gate, aborts fetches, drops queued jobs and
    /// joins every worker. Results arriving afterwards are discarded.
    pub fn terminate_all(&self) {
        self.shared.terminated.store(true, Ordering::Release);
        self.shared.gate.cancel();
        let drained = self.cancel_outstanding();
        self.join_workers();
        tracing::debug!(target: tags::TARGET_WORKER, drained, "worker pool terminated");
    }

    /// Stops the workers once they are between jobs and joins them.
    pub fn shutdown(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.join_workers();
    }

    fn join_workers(&self) {
        let handles: Vec<JoinHandle<()>> = lock_unpoisoned(&self.handles).drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if let Err(payload) = handle.join() {
                let details = if let Some(message) = payload.downcast_ref::<&str>() {
                    (*message).to_string()
                } else if let Some(message) = payload.downcast_ref::<String>() {
                    message.clone()
                } else {
                    "unknown panic payload".to_string()
                };
                tracing::error!(target: tags::TARGET_WORKER, %details, "worker thread panicked");
            }
        }
    }

    /// Blocks until nothing is queued or running, or `timeout` elapses.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = lock_unpoisoned(&self.shared.idle_lock);
        while !self.shared.is_idle() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let wait = (deadline - now).min(WORKER_POLL);
            guard = match self.shared.idle_signal.wait_timeout(guard, wait) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    pub fn is_idle(&self) -> bool {
        self.shared.is_idle()
    }

    pub fn queued_count(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Total jobs claimed by workers since the pool started.
    pub fn claimed_count(&self) -> u64 {
        self.shared.claimed.load(Ordering::Acquire)
    }

    /// Worker threads that have not exited yet.
    pub fn live_workers(&self) -> usize {
        self.shared.live_workers.load(Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::Acquire)
    }

    pub fn state(&self) -> PoolState {
        PoolState {
            queued: self.queued_count(),
            active: self.active_count(),
            is_paused: self.shared.gate.is_paused(),
            is_cancelled: self.is_terminated() || self.shared.gate.is_cancelled(),
        }
    }

    pub fn runtime_snapshot(&self) -> PoolRuntimeSnapshot {
        let elapsed = self.shared.started_at.elapsed();
        let elapsed_us = duration_to_us(elapsed);
        let workers = (0..self.num_workers)
            .map(|worker_id| {
                let busy_us = self.shared.worker_busy_us[worker_id]
                    .load(Ordering::Acquire)
                    .min(elapsed_us);
                WorkerRuntimeSnapshot {
                    worker_id,
                    tasks_completed: self.shared.task_counts[worker_id].load(Ordering::Acquire),
                    busy: Duration::from_micros(busy_us),
                    utilization: if elapsed_us == 0 {
                        0.0
                    } else {
                        busy_us as f64 / elapsed_us as f64
                    },
                }
            })
            .collect();

        PoolRuntimeSnapshot {
            elapsed,
            state: self.state(),
            claimed: self.claimed_count(),
            live_workers: self.live_workers(),
            workers,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.terminated.store(true, Ordering::Release);
        self.cancel_outstanding();
        self.join_workers();
    }
}

enum Claim {
    Run(QueuedJob),
    Skip,
    Exit,
}

fn run_worker_loop(worker_id: usize, shared: Arc<PoolShared>) {
    loop {
        if shared.should_exit() {
            break;
        }
        match shared.gate.wait_timeout(WORKER_POLL) {
            GateStatus::Cancelled => break,
            GateStatus::Paused => continue,
            GateStatus::Runnable => {}
        }

        let Some(queued) = next_job(&shared) else {
            continue;
        };
        shared
            .telemetry
            .on_queue_depth(worker_id, shared.jobs_rx.len() + shared.retry_rx.len());

        match claim(&shared, queued) {
            Claim::Run(queued) => execute(worker_id, &shared, queued),
            Claim::Skip => continue,
            Claim::Exit => break,
        }
    }
    shared.live_workers.fetch_sub(1, Ordering::AcqRel);
    tracing::trace!(target: tags::TARGET_WORKER, worker_id, "worker exited");
}

fn next_job(shared: &PoolShared) -> Option<QueuedJob> {
    match shared.retry_rx.try_recv() {
        Ok(queued) => return Some(queued),
        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
    }
    crossbeam_channel::select! {
        recv(shared.retry_rx) -> queued => queued.ok(),
        recv(shared.jobs_rx) -> queued => queued.ok(),
        default(WORKER_POLL) => None,
    }
}

/// Holds a dequeued job until the gate lets it run.
///
/// The job stays counted as queued while held so the pool never looks
/// drained in between.
fn claim(shared: &PoolShared, queued: QueuedJob) -> Claim {
    loop {
        if shared.terminated.load(Ordering::Acquire) {
            shared.release_queued(1);
            return Claim::Exit;
        }
        if queued.scope.is_cancelled() {
            shared.release_queued(1);
            return Claim::Skip;
        }
        match shared.gate.wait_timeout(WORKER_POLL) {
            GateStatus::Runnable => break,
            GateStatus::Paused => continue,
            GateStatus::Cancelled => {
                shared.release_queued(1);
                return Claim::Exit;
            }
        }
    }

    shared.active.fetch_add(1, Ordering::AcqRel);
    shared.queued.fetch_sub(1, Ordering::AcqRel);
    shared.claimed.fetch_add(1, Ordering::AcqRel);
    Claim::Run(queued)
}

enum Resolution {
    Status(JobStatus),
    Fatal(TesseraError),
}

fn execute(worker_id: usize, shared: &PoolShared, queued: QueuedJob) {
    let coord = queued.job.coord;
    shared.telemetry.on_task_started(worker_id, coord);
    let started_at = Instant::now();

    let resolution = match catch_unwind(AssertUnwindSafe(|| resolve(shared, &queued))) {
        Ok(resolution) => resolution,
        Err(_) => Resolution::Fatal(TesseraError::Other(anyhow::anyhow!(
            "worker panicked while fetching {coord}"
        ))),
    };

    let elapsed = started_at.elapsed();
    shared.worker_busy_us[worker_id].fetch_add(duration_to_us(elapsed), Ordering::AcqRel);
    shared.task_counts[worker_id].fetch_add(1, Ordering::AcqRel);

    let discarded = queued.scope.is_cancelled() || shared.terminated.load(Ordering::Acquire);
    match resolution {
        Resolution::Status(status) => {
            shared
                .telemetry
                .on_task_finished(worker_id, coord, &status, elapsed);
            if !discarded {
                let retry = matches!(status, JobStatus::RetryableFailure(_));
                let outcome = JobOutcome {
                    coord,
                    status,
                    attempt: queued.attempt,
                };
                queued.scope.listener.on_outcome(&outcome);
                if retry {
                    requeue(shared, queued);
                }
            }
        }
        Resolution::Fatal(error) => {
            telemetry::increment_counter(
                tags::METRIC_JOB_FATAL_COUNT,
                1,
                &[("subsystem", "worker"), ("op", "task"), ("result", "fatal")],
            );
            telemetry::sub_gauge_saturating(
                tags::METRIC_WORKER_ACTIVE_COUNT,
                1,
                &[("subsystem", "worker"), ("op", "task_fatal")],
            );
            if !discarded {
                tracing::error!(target: tags::TARGET_WORKER, worker_id, tile = %coord, %error, "fatal job error");
                queued.scope.listener.on_fatal(coord, error);
            }
        }
    }

    shared.active.fetch_sub(1, Ordering::AcqRel);
    shared.notify_if_idle();
}

fn resolve(shared: &PoolShared, queued: &QueuedJob) -> Resolution {
    let ctx = FetchContext::new(shared.source_listener.as_ref(), &shared.terminated);
    let coord = queued.job.coord;

    match shared.resolver.resolve(&queued.job, &ctx) {
        // An empty payload is indistinguishable from the archive's end marker.
        Ok(Some(bytes)) if bytes.is_empty() => {
            tracing::debug!(target: tags::TARGET_WORKER, tile = %coord, "empty payload treated as absent");
            Resolution::Status(JobStatus::Absent)
        }
        Ok(Some(bytes)) => {
            if queued.scope.is_cancelled() || shared.terminated.load(Ordering::Acquire) {
                return Resolution::Status(JobStatus::Success(bytes));
            }
            if let Some(sink) = &queued.scope.sink {
                if let Err(error) = sink.store(coord, &bytes) {
                    return Resolution::Fatal(error.with_context(format!("store tile {coord}")));
                }
            }
            Resolution::Status(JobStatus::Success(bytes))
        }
        Ok(None) => Resolution::Status(JobStatus::Absent),
        Err(error) => match error.class() {
            FailureClass::Retryable if queued.attempt < shared.max_retries => {
                Resolution::Status(JobStatus::RetryableFailure(error))
            }
            FailureClass::Retryable | FailureClass::Permanent => {
                Resolution::Status(JobStatus::PermanentFailure(error))
            }
            FailureClass::Fatal => Resolution::Fatal(TesseraError::Fatal {
                coord,
                source: Box::new(TesseraError::Fetch(error)),
            }),
        },
    }
}

/// Re-enqueues a retryable job. Called while the job still counts as active.
fn requeue(shared: &PoolShared, queued: QueuedJob) {
    shared.queued.fetch_add(1, Ordering::AcqRel);
    let retry = QueuedJob {
        attempt: queued.attempt + 1,
        ..queued
    };
    if shared.retry_tx.send(retry).is_err() {
        shared.release_queued(1);
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
