mod support;

#[cfg(feature = "telemetry")]
mod telemetry_enabled_tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};

    use tessera_core::source::{FetchContext, MemoryTileCache, NoopSourceListener};
    use tessera_core::telemetry::{self, tags};
    use tessera_core::{
        DownloadJob, IndexedTileArchive, LoadMethod, TileCache, TileCoord, TileSource,
        TileSourceResolver,
    };

    use crate::support::StubSource;

    static TELEMETRY_TEST_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn records_archive_metrics() -> Result<(), Box<dyn std::error::Error>> {
        let _guard = TELEMETRY_TEST_MUTEX
            .lock()
            .expect("telemetry test lock poisoned");
        telemetry::reset();

        let dir = tempfile::tempdir()?;
        let archive = IndexedTileArchive::create(dir.path().join("metrics.tsra"))?;
        archive.append(TileCoord::new(1, 0, 0), b"abcd")?;
        archive.append(TileCoord::new(1, 1, 0), b"efghij")?;
        archive.finalize()?;

        let snapshot = telemetry::snapshot();
        assert_eq!(snapshot.counter(tags::METRIC_ARCHIVE_APPEND_COUNT), Some(2));
        assert_eq!(snapshot.counter(tags::METRIC_ARCHIVE_APPEND_BYTES), Some(10));
        assert_eq!(snapshot.counter(tags::METRIC_ARCHIVE_FINALIZE_COUNT), Some(1));
        let latency = snapshot
            .histogram(tags::METRIC_ARCHIVE_APPEND_LATENCY_US)
            .expect("append latency histogram missing");
        assert_eq!(latency.count, 2);
        Ok(())
    }

    #[test]
    fn records_cache_and_source_metrics() -> Result<(), Box<dyn std::error::Error>> {
        let _guard = TELEMETRY_TEST_MUTEX
            .lock()
            .expect("telemetry test lock poisoned");
        telemetry::reset();

        let cache = Arc::new(MemoryTileCache::new());
        cache.put(TileCoord::new(2, 0, 0), "osm", b"cached")?;
        let resolver = TileSourceResolver::with_cache(cache);
        let source: Arc<dyn TileSource> = Arc::new(StubSource::healthy("osm"));
        let cancelled = AtomicBool::new(false);
        let ctx = FetchContext::new(&NoopSourceListener, &cancelled);

        for x in 0..3 {
            let job = DownloadJob::new(TileCoord::new(2, x, 0), source.clone(), LoadMethod::Default);
            resolver.resolve(&job, &ctx)?;
        }

        let snapshot = telemetry::snapshot();
        assert_eq!(snapshot.counter(tags::METRIC_CACHE_HIT_COUNT), Some(1));
        assert_eq!(snapshot.counter(tags::METRIC_CACHE_MISS_COUNT), Some(2));
        assert_eq!(snapshot.counter(tags::METRIC_SOURCE_FETCH_COUNT), Some(2));
        assert!(snapshot.counter(tags::METRIC_SOURCE_FETCH_BYTES).unwrap_or(0) > 0);
        Ok(())
    }

    #[test]
    fn reset_clears_every_metric() {
        let _guard = TELEMETRY_TEST_MUTEX
            .lock()
            .expect("telemetry test lock poisoned");
        telemetry::increment_counter(tags::METRIC_JOB_RETRY_COUNT, 3, &[]);
        telemetry::set_gauge(tags::METRIC_WORKER_QUEUE_DEPTH, 9, &[]);
        telemetry::sub_gauge_saturating(tags::METRIC_WORKER_ACTIVE_COUNT, 5, &[]);
        telemetry::reset();

        let snapshot = telemetry::snapshot();
        assert!(snapshot.counters.is_empty());
        assert!(snapshot.gauges.is_empty());
        assert!(snapshot.histograms.is_empty());
    }

    #[test]
    fn since_reports_only_new_activity() {
        let _guard = TELEMETRY_TEST_MUTEX
            .lock()
            .expect("telemetry test lock poisoned");
        telemetry::reset();

        telemetry::increment_counter(tags::METRIC_JOB_SUCCESS_COUNT, 5, &[]);
        telemetry::increment_counter(tags::METRIC_JOB_ABSENT_COUNT, 1, &[]);
        telemetry::record_histogram(tags::METRIC_WORKER_TASK_LATENCY_US, 100, &[]);
        let baseline = telemetry::snapshot();

        telemetry::increment_counter(tags::METRIC_JOB_SUCCESS_COUNT, 3, &[]);
        telemetry::record_histogram(tags::METRIC_WORKER_TASK_LATENCY_US, 40, &[]);
        telemetry::record_histogram(tags::METRIC_WORKER_TASK_LATENCY_US, 60, &[]);
        telemetry::set_gauge(tags::METRIC_WORKER_QUEUE_DEPTH, 7, &[]);

        let delta = telemetry::snapshot().since(&baseline);
        assert_eq!(delta.counter(tags::METRIC_JOB_SUCCESS_COUNT), Some(3));
        assert_eq!(delta.counter(tags::METRIC_JOB_ABSENT_COUNT), None);
        assert_eq!(delta.counter_or_zero(tags::METRIC_JOB_ABSENT_COUNT), 0);
        assert_eq!(delta.gauge(tags::METRIC_WORKER_QUEUE_DEPTH), Some(7));
        let latency = delta
            .histogram(tags::METRIC_WORKER_TASK_LATENCY_US)
            .expect("latency histogram missing");
        assert_eq!((latency.count, latency.total), (2, 100));
        assert!((latency.mean - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn gauges_never_underflow() {
        let _guard = TELEMETRY_TEST_MUTEX
            .lock()
            .expect("telemetry test lock poisoned");
        telemetry::reset();

        telemetry::add_gauge(tags::METRIC_WORKER_ACTIVE_COUNT, 2, &[]);
        telemetry::sub_gauge_saturating(tags::METRIC_WORKER_ACTIVE_COUNT, 5, &[]);
        assert_eq!(
            telemetry::snapshot().gauge(tags::METRIC_WORKER_ACTIVE_COUNT),
            Some(0)
        );
    }
}
