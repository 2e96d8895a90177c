/// Tracing target for archive writes, scans and recovery.
pub const TARGET_ARCHIVE: &str = "tessera.archive";
/// Tracing target for the worker pool.
pub const TARGET_WORKER: &str = "tessera.worker";
/// Tracing target for the job producer.
pub const TARGET_PRODUCER: &str = "tessera.producer";
/// Tracing target for map sources and the tile cache.
pub const TARGET_SOURCE: &str = "tessera.source";
/// Tracing target for atlas orchestration.
pub const TARGET_ATLAS: &str = "tessera.atlas";

pub const METRIC_ARCHIVE_APPEND_COUNT: &str = "tessera.archive.append.count";
pub const METRIC_ARCHIVE_APPEND_BYTES: &str = "tessera.archive.append.bytes";
pub const METRIC_ARCHIVE_APPEND_LATENCY_US: &str = "tessera.archive.append.latency_us";
pub const METRIC_ARCHIVE_FINALIZE_COUNT: &str = "tessera.archive.finalize.count";
pub const METRIC_ARCHIVE_RECOVERED_RECORDS: &str = "tessera.archive.recovered.records";

pub const METRIC_WORKER_TASK_COUNT: &str = "tessera.worker.task.count";
pub const METRIC_WORKER_TASK_START_COUNT: &str = "tessera.worker.task.start.count";
pub const METRIC_WORKER_TASK_FINISH_COUNT: &str = "tessera.worker.task.finish.count";
pub const METRIC_WORKER_TASK_FAIL_COUNT: &str = "tessera.worker.task.fail.count";
pub const METRIC_WORKER_TASK_LATENCY_US: &str = "tessera.worker.task.latency_us";
pub const METRIC_WORKER_ACTIVE_COUNT: &str = "tessera.worker.active.count";
pub const METRIC_WORKER_QUEUE_DEPTH: &str = "tessera.worker.queue.depth";
pub const METRIC_WORKER_QUEUE_DEPTH_SAMPLES: &str = "tessera.worker.queue.depth.samples";
pub const METRIC_WORKER_QUEUE_DEPTH_HIST: &str = "tessera.worker.queue.depth.hist";

pub const METRIC_JOB_SUCCESS_COUNT: &str = "tessera.job.success.count";
pub const METRIC_JOB_ABSENT_COUNT: &str = "tessera.job.absent.count";
pub const METRIC_JOB_RETRY_COUNT: &str = "tessera.job.retry.count";
pub const METRIC_JOB_PERMANENT_FAILURE_COUNT: &str = "tessera.job.permanent_failure.count";
pub const METRIC_JOB_FATAL_COUNT: &str = "tessera.job.fatal.count";

pub const METRIC_PRODUCER_SUBMITTED_COUNT: &str = "tessera.producer.submitted.count";
pub const METRIC_PRODUCER_SKIPPED_COUNT: &str = "tessera.producer.skipped.count";

pub const METRIC_SOURCE_FETCH_COUNT: &str = "tessera.source.fetch.count";
pub const METRIC_SOURCE_FETCH_BYTES: &str = "tessera.source.fetch.bytes";
pub const METRIC_SOURCE_FETCH_LATENCY_US: &str = "tessera.source.fetch.latency_us";
pub const METRIC_CACHE_HIT_COUNT: &str = "tessera.cache.hit.count";
pub const METRIC_CACHE_MISS_COUNT: &str = "tessera.cache.miss.count";

pub const METRIC_ATLAS_MAP_COUNT: &str = "tessera.atlas.map.count";
pub const METRIC_ATLAS_MAP_RESTART_COUNT: &str = "tessera.atlas.map.restart.count";
pub const METRIC_ATLAS_MAP_SKIPPED_COUNT: &str = "tessera.atlas.map.skipped.count";
pub const METRIC_ATLAS_MAP_ABORTED_COUNT: &str = "tessera.atlas.map.aborted.count";
