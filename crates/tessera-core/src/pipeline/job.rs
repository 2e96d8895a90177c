use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam_channel::Sender;

use crate::core::{JobListener, PauseResumeGate};
use crate::error::TesseraError;
use crate::telemetry::{MapProgress, ProgressEvent, ProgressSink, tags};
use crate::types::{JobOutcome, JobStatus, TileCoord};

/// Wake-up reasons delivered to the orchestrator thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MapSignal {
    RetryThreshold,
    Fatal,
    Control,
}

/// Outcome counters for one map pass, fed by the workers.
///
/// When the number of retryable failures first exceeds the threshold the
/// gate is paused right here on the worker thread, so no further job is
/// claimed while the orchestrator asks for a decision.
pub struct MapCounters {
    map: String,
    tiles_total: u64,
    started_at: Instant,
    completed: AtomicU64,
    succeeded: AtomicU64,
    absent: AtomicU64,
    permanent: AtomicU64,
    retryable: AtomicU64,
    retry_threshold: Option<u64>,
    threshold_crossed: AtomicBool,
    fatal: Mutex<Option<TesseraError>>,
    gate: Arc<PauseResumeGate>,
    progress: Arc<dyn ProgressSink>,
    signals: Sender<MapSignal>,
}

impl MapCounters {
    /// `retry_threshold == None` disables the escalation.
    pub(crate) fn new(
        map: impl Into<String>,
        tiles_total: u64,
        retry_threshold: Option<u64>,
        gate: Arc<PauseResumeGate>,
        progress: Arc<dyn ProgressSink>,
        signals: Sender<MapSignal>,
    ) -> Self {
        Self {
            map: map.into(),
            tiles_total,
            started_at: Instant::now(),
            completed: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            absent: AtomicU64::new(0),
            permanent: AtomicU64::new(0),
            retryable: AtomicU64::new(0),
            retry_threshold,
            threshold_crossed: AtomicBool::new(false),
            fatal: Mutex::new(None),
            gate,
            progress,
            signals,
        }
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Acquire)
    }

    pub fn absent(&self) -> u64 {
        self.absent.load(Ordering::Acquire)
    }

    pub fn permanent_failures(&self) -> u64 {
        self.permanent.load(Ordering::Acquire)
    }

    pub fn retryable_errors(&self) -> u64 {
        self.retryable.load(Ordering::Acquire)
    }

    pub fn threshold_crossed(&self) -> bool {
        self.threshold_crossed.load(Ordering::Acquire)
    }

    /// First fatal error reported by a worker, if any.
    pub fn take_fatal(&self) -> Option<TesseraError> {
        match self.fatal.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    pub fn snapshot(&self) -> MapProgress {
        MapProgress {
            map: self.map.clone(),
            tiles_total: self.tiles_total,
            tiles_completed: self.completed(),
            tiles_archived: self.succeeded(),
            permanent_failures: self.permanent_failures(),
            retryable_errors: self.retryable_errors(),
            elapsed: self.started_at.elapsed(),
        }
    }

    fn record_retryable(&self) {
        let count = self.retryable.fetch_add(1, Ordering::AcqRel) + 1;
        let Some(threshold) = self.retry_threshold else {
            return;
        };
        if count == threshold.saturating_add(1)
            && !self.threshold_crossed.swap(true, Ordering::AcqRel)
        {
            self.gate.pause();
            tracing::warn!(
                target: tags::TARGET_ATLAS,
                map = %self.map,
                retryable_errors = count,
                threshold,
                "retryable error threshold exceeded, pausing downloads"
            );
            let _ = self.signals.send(MapSignal::RetryThreshold);
        }
    }
}

impl JobListener for MapCounters {
    fn on_outcome(&self, outcome: &JobOutcome) {
        match &outcome.status {
            JobStatus::RetryableFailure(_) => {
                self.record_retryable();
                return;
            }
            JobStatus::Success(_) => {
                self.succeeded.fetch_add(1, Ordering::AcqRel);
            }
            JobStatus::Absent => {
                self.absent.fetch_add(1, Ordering::AcqRel);
            }
            JobStatus::PermanentFailure(error) => {
                self.permanent.fetch_add(1, Ordering::AcqRel);
                tracing::debug!(
                    target: tags::TARGET_ATLAS,
                    map = %self.map,
                    tile = %outcome.coord,
                    attempt = outcome.attempt,
                    %error,
                    "tile failed permanently"
                );
            }
        }
        self.completed.fetch_add(1, Ordering::AcqRel);
        self.progress.on_event(&ProgressEvent::TileCompleted {
            coord: outcome.coord,
            progress: self.snapshot(),
        });
    }

    fn on_fatal(&self, coord: TileCoord, error: TesseraError) {
        {
            let mut guard = match self.fatal.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if guard.is_none() {
                *guard = Some(error);
            } else {
                tracing::debug!(target: tags::TARGET_ATLAS, tile = %coord, %error, "additional fatal error");
            }
        }
        let _ = self.signals.send(MapSignal::Fatal);
    }
}
