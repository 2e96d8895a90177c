use std::time::Duration;

use crate::telemetry::{self, tags};
use crate::types::{JobStatus, TileCoord, duration_to_us};

/// Hooks the worker pool calls around every fetch.
///
/// Implementations must be cheap; they run on worker threads between jobs.
pub trait WorkerTelemetry: Send + Sync {
    fn on_queue_depth(&self, worker_id: usize, depth: usize);
    fn on_task_started(&self, worker_id: usize, coord: TileCoord);
    fn on_task_finished(
        &self,
        worker_id: usize,
        coord: TileCoord,
        status: &JobStatus,
        elapsed: Duration,
    );
}

/// Records worker activity into the process-wide metrics registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultWorkerTelemetry;

impl WorkerTelemetry for DefaultWorkerTelemetry {
    fn on_queue_depth(&self, _worker_id: usize, depth: usize) {
        let labels = [("subsystem", "worker"), ("op", "queue_depth")];
        telemetry::increment_counter(tags::METRIC_WORKER_QUEUE_DEPTH_SAMPLES, 1, &labels);
        telemetry::set_gauge(tags::METRIC_WORKER_QUEUE_DEPTH, depth as u64, &labels);
        telemetry::record_histogram(tags::METRIC_WORKER_QUEUE_DEPTH_HIST, depth as u64, &labels);
    }

    fn on_task_started(&self, worker_id: usize, coord: TileCoord) {
        let labels = [("subsystem", "worker"), ("op", "task_start")];
        telemetry::increment_counter(tags::METRIC_WORKER_TASK_START_COUNT, 1, &labels);
        telemetry::add_gauge(tags::METRIC_WORKER_ACTIVE_COUNT, 1, &labels);

        tracing::trace!(
            target: tags::TARGET_WORKER,
            worker_id,
            tile = %coord,
            "fetch started"
        );
    }

    fn on_task_finished(
        &self,
        worker_id: usize,
        coord: TileCoord,
        status: &JobStatus,
        elapsed: Duration,
    ) {
        let elapsed_us = duration_to_us(elapsed);
        let (result, counter) = match status {
            JobStatus::Success(_) => ("ok", tags::METRIC_JOB_SUCCESS_COUNT),
            JobStatus::Absent => ("absent", tags::METRIC_JOB_ABSENT_COUNT),
            JobStatus::RetryableFailure(_) => ("retry", tags::METRIC_JOB_RETRY_COUNT),
            JobStatus::PermanentFailure(_) => ("error", tags::METRIC_JOB_PERMANENT_FAILURE_COUNT),
        };
        let labels = [("subsystem", "worker"), ("op", "task"), ("result", result)];

        let finish_metric = if matches!(status, JobStatus::Success(_) | JobStatus::Absent) {
            tags::METRIC_WORKER_TASK_FINISH_COUNT
        } else {
            tags::METRIC_WORKER_TASK_FAIL_COUNT
        };
        telemetry::increment_counter(finish_metric, 1, &labels);
        telemetry::increment_counter(tags::METRIC_WORKER_TASK_COUNT, 1, &labels);
        telemetry::increment_counter(counter, 1, &labels);
        telemetry::record_histogram(tags::METRIC_WORKER_TASK_LATENCY_US, elapsed_us, &labels);
        telemetry::sub_gauge_saturating(tags::METRIC_WORKER_ACTIVE_COUNT, 1, &labels);

        tracing::trace!(
            target: tags::TARGET_WORKER,
            worker_id,
            tile = %coord,
            result,
            elapsed_us,
            "fetch finished"
        );
    }
}
