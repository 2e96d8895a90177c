use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::archive::TileSink;
use crate::core::{GateStatus, JobScope, PauseResumeGate, SubmitOutcome, WorkerPool};
use crate::telemetry::{self, tags};
use crate::types::{DownloadJob, TileCoord};
use crate::{Result, TesseraError};

use super::MapSpec;

/// Totals of one enumeration run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerSummary {
    /// Jobs handed to the pool.
    pub submitted: u64,
    /// Coordinates already present and therefore not queued.
    pub skipped: u64,
    /// Enumeration stopped before the last coordinate.
    pub cancelled: bool,
}

struct ProducerShared {
    cancelled: AtomicBool,
    finished: AtomicBool,
    submitted: AtomicU64,
    skipped: AtomicU64,
}

/// Streams the jobs of one map into a [`WorkerPool`] from its own thread.
///
/// Each coordinate is enumerated once per pass. Coordinates already held
/// by `existing`, or available from the source without a fetch, are
/// skipped. File-based maps produce no jobs at all.
pub struct JobProducer {
    shared: Arc<ProducerShared>,
    handle: Option<JoinHandle<ProducerSummary>>,
}

impl JobProducer {
    pub fn start(
        map: &MapSpec,
        pool: Arc<WorkerPool>,
        scope: Arc<JobScope>,
        existing: Option<Arc<dyn TileSink>>,
        submit_timeout: Duration,
    ) -> Result<Self> {
        let shared = Arc::new(ProducerShared {
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        });

        let map = map.clone();
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("tessera-producer-{}", map.name))
            .spawn(move || {
                let summary = produce(
                    &map,
                    &pool,
                    &scope,
                    existing.as_deref(),
                    submit_timeout,
                    &thread_shared,
                );
                thread_shared.finished.store(true, Ordering::Release);
                summary
            })
            .map_err(|error| TesseraError::Io(error).with_context("spawn producer thread"))?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Stops enumeration at the next coordinate. Queued jobs are untouched.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// True once the last job was handed to the pool or enumeration stopped.
    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    pub fn submitted(&self) -> u64 {
        self.shared.submitted.load(Ordering::Acquire)
    }

    pub fn skipped(&self) -> u64 {
        self.shared.skipped.load(Ordering::Acquire)
    }

    pub fn join(mut self) -> Result<ProducerSummary> {
        let Some(handle) = self.handle.take() else {
            return Ok(self.summary());
        };
        handle
            .join()
            .map_err(|_| TesseraError::Other(anyhow::anyhow!("producer thread panicked")))
    }

    fn summary(&self) -> ProducerSummary {
        ProducerSummary {
            submitted: self.submitted(),
            skipped: self.skipped(),
            cancelled: self.is_cancelled(),
        }
    }
}

impl Drop for JobProducer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cancel();
            let _ = handle.join();
        }
    }
}

fn produce(
    map: &MapSpec,
    pool: &WorkerPool,
    scope: &Arc<JobScope>,
    existing: Option<&dyn TileSink>,
    submit_timeout: Duration,
    shared: &ProducerShared,
) -> ProducerSummary {
    let mut summary = ProducerSummary::default();
    if map.is_file_based() {
        tracing::debug!(target: tags::TARGET_PRODUCER, map = %map.name, "file-based map, nothing to download");
        return summary;
    }

    let gate = pool.gate();
    for coord in map.coords() {
        if !wait_runnable(gate, shared) {
            summary.cancelled = true;
            break;
        }
        if is_present(map, existing, &coord) {
            summary.skipped += 1;
            shared.skipped.fetch_add(1, Ordering::AcqRel);
            continue;
        }

        let job = DownloadJob::new(coord, Arc::clone(&map.source), map.load_method);
        if !submit(pool, scope, job, submit_timeout, shared) {
            summary.cancelled = true;
            break;
        }
        summary.submitted += 1;
        shared.submitted.fetch_add(1, Ordering::AcqRel);
    }

    let labels = [("subsystem", "producer"), ("op", "enumerate")];
    telemetry::increment_counter(tags::METRIC_PRODUCER_SUBMITTED_COUNT, summary.submitted, &labels);
    telemetry::increment_counter(tags::METRIC_PRODUCER_SKIPPED_COUNT, summary.skipped, &labels);
    tracing::debug!(
        target: tags::TARGET_PRODUCER,
        map = %map.name,
        submitted = summary.submitted,
        skipped = summary.skipped,
        cancelled = summary.cancelled,
        "enumeration finished"
    );
    summary
}

fn is_present(map: &MapSpec, existing: Option<&dyn TileSink>, coord: &TileCoord) -> bool {
    existing.is_some_and(|sink| sink.contains(coord)) || map.source.contains(coord)
}

fn wait_runnable(gate: &PauseResumeGate, shared: &ProducerShared) -> bool {
    loop {
        if shared.cancelled.load(Ordering::Acquire) {
            return false;
        }
        match gate.wait_timeout(Duration::from_millis(50)) {
            GateStatus::Runnable => return true,
            GateStatus::Paused => continue,
            GateStatus::Cancelled => return false,
        }
    }
}

fn submit(
    pool: &WorkerPool,
    scope: &Arc<JobScope>,
    mut job: DownloadJob,
    timeout: Duration,
    shared: &ProducerShared,
) -> bool {
    loop {
        if shared.cancelled.load(Ordering::Acquire) {
            return false;
        }
        match pool.submit_timeout(job, scope, timeout) {
            Ok(SubmitOutcome::Accepted) => return true,
            Ok(SubmitOutcome::QueueFull(returned)) => job = returned,
            Err(_) => return false,
        }
    }
}
