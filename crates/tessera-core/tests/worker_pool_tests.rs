mod support;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use support::{RecordingListener, StubSource, tile_bytes};
use tessera_core::{
    DownloadConfig, DownloadJob, FetchError, IndexedTileArchive, JobScope, JobStatus,
    LoadMethod, PauseResumeGate, TesseraError, TileCoord, TileSink, TileSource,
    TileSourceResolver, WorkerPool,
};

const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

fn config(workers: usize, retries: u32) -> DownloadConfig {
    DownloadConfig {
        workers,
        max_download_retries: retries,
        ..DownloadConfig::default()
    }
}

fn spawn(config: &DownloadConfig) -> Result<WorkerPool, TesseraError> {
    WorkerPool::spawn(
        config,
        Arc::new(PauseResumeGate::new()),
        TileSourceResolver::new(),
    )
}

fn submit_all(
    pool: &WorkerPool,
    source: &Arc<StubSource>,
    scope: &Arc<JobScope>,
    coords: impl IntoIterator<Item = TileCoord>,
) -> Result<(), TesseraError> {
    for coord in coords {
        let source: Arc<dyn TileSource> = source.clone();
        pool.submit(DownloadJob::new(coord, source, LoadMethod::Source), scope)?;
    }
    Ok(())
}

fn grid(zoom: u32, count: u32) -> Vec<TileCoord> {
    let side = 1u32 << zoom;
    (0..count).map(|i| TileCoord::new(zoom, i % side, i / side)).collect()
}

#[test]
fn every_job_is_fetched_once_and_archived() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let archive = Arc::new(IndexedTileArchive::create(dir.path().join("pool.tsra"))?);
    let sink: Arc<dyn TileSink> = archive.clone();
    let source = Arc::new(StubSource::healthy("osm").with_delay(Duration::from_millis(1)));
    let listener = Arc::new(RecordingListener::default());
    let scope = JobScope::new(Some(sink), listener.clone());

    let pool = spawn(&config(4, 1))?;
    let coords = grid(8, 200);
    submit_all(&pool, &source, &scope, coords.clone())?;
    assert!(pool.wait_idle(IDLE_TIMEOUT));

    assert_eq!(listener.successes(), 200);
    assert_eq!(archive.entry_count(), 200);
    assert_eq!(source.fetches(), 200);
    assert!(!source.saw_concurrent_duplicate());
    for coord in coords {
        assert_eq!(archive.read_coord(&coord)?, Some(tile_bytes(coord)));
    }

    let snapshot = pool.runtime_snapshot();
    assert_eq!(snapshot.claimed, 200);
    assert_eq!(
        snapshot.workers.iter().map(|w| w.tasks_completed).sum::<usize>(),
        200
    );
    pool.shutdown();
    assert_eq!(pool.live_workers(), 0);
    Ok(())
}

#[test]
fn transient_failures_stop_after_max_retries_plus_one_attempts()
-> Result<(), Box<dyn std::error::Error>> {
    let source = Arc::new(StubSource::failing("flaky"));
    let listener = Arc::new(RecordingListener::default());
    let scope = JobScope::new(None, listener.clone());
    let coord = TileCoord::new(4, 3, 3);

    let pool = spawn(&config(2, 2))?;
    submit_all(&pool, &source, &scope, [coord])?;
    assert!(pool.wait_idle(IDLE_TIMEOUT));

    assert_eq!(source.attempts(coord), 3);
    let outcomes = listener.outcomes();
    let attempts: Vec<u32> = outcomes.iter().map(|outcome| outcome.attempt).collect();
    assert_eq!(attempts, vec![0, 1, 2]);
    assert_eq!(listener.retryable_failures(), 2);
    assert_eq!(listener.permanent_failures(), 1);
    assert!(matches!(
        outcomes.last().map(|outcome| &outcome.status),
        Some(JobStatus::PermanentFailure(FetchError::Transient(_)))
    ));
    Ok(())
}

#[test]
fn flaky_tiles_recover_within_the_retry_budget() -> Result<(), Box<dyn std::error::Error>> {
    let flaky = [TileCoord::new(5, 1, 0), TileCoord::new(5, 7, 0)];
    let source = Arc::new(StubSource::new("mixed", move |coord, attempt| {
        if flaky.contains(&coord) && attempt < 2 {
            Err(FetchError::Transient("connection reset".into()))
        } else {
            Ok(Some(Bytes::from(tile_bytes(coord))))
        }
    }));
    let listener = Arc::new(RecordingListener::default());
    let scope = JobScope::new(None, listener.clone());

    let pool = spawn(&config(4, 3))?;
    submit_all(&pool, &source, &scope, grid(5, 20))?;
    assert!(pool.wait_idle(IDLE_TIMEOUT));

    assert_eq!(listener.successes(), 20);
    assert_eq!(listener.permanent_failures(), 0);
    assert_eq!(listener.retryable_failures(), 4);
    for coord in flaky {
        assert_eq!(source.attempts(coord), 3);
    }
    Ok(())
}

#[test]
fn absent_and_not_found_tiles_complete_without_retry() -> Result<(), Box<dyn std::error::Error>> {
    let missing = TileCoord::new(3, 0, 0);
    let source = Arc::new(StubSource::new("sparse", move |coord, _| {
        if coord == missing {
            Err(FetchError::NotFound("404".into()))
        } else {
            Ok(None)
        }
    }));
    let listener = Arc::new(RecordingListener::default());
    let scope = JobScope::new(None, listener.clone());

    let pool = spawn(&config(2, 5))?;
    submit_all(&pool, &source, &scope, [missing, TileCoord::new(3, 1, 0)])?;
    assert!(pool.wait_idle(IDLE_TIMEOUT));

    assert_eq!(source.attempts(missing), 1);
    assert_eq!(listener.completions(), 2);
    assert_eq!(listener.permanent_failures(), 1);
    assert!(
        listener
            .outcomes()
            .iter()
            .any(|outcome| matches!(outcome.status, JobStatus::Absent))
    );
    Ok(())
}

#[test]
fn empty_payloads_complete_as_absent_without_reaching_the_archive()
-> Result<(), Box<dyn std::error::Error>> {
    let hollow = TileCoord::new(4, 2, 0);
    let dir = tempfile::tempdir()?;
    let archive = Arc::new(IndexedTileArchive::create(dir.path().join("hollow.tsra"))?);
    let sink: Arc<dyn TileSink> = archive.clone();
    let source = Arc::new(StubSource::new("hollow", move |coord, _| {
        if coord == hollow {
            Ok(Some(Bytes::new()))
        } else {
            Ok(Some(Bytes::from(tile_bytes(coord))))
        }
    }));
    let listener = Arc::new(RecordingListener::default());
    let scope = JobScope::new(Some(sink), listener.clone());

    let pool = spawn(&config(2, 3))?;
    let coords: Vec<TileCoord> = (0..5u32)
        .flat_map(|x| (0..2u32).map(move |y| TileCoord::new(4, x, y)))
        .collect();
    submit_all(&pool, &source, &scope, coords)?;
    assert!(pool.wait_idle(IDLE_TIMEOUT));

    assert!(listener.fatals().is_empty());
    assert_eq!(listener.completions(), 10);
    assert_eq!(listener.successes(), 9);
    assert_eq!(source.attempts(hollow), 1);
    assert!(listener.outcomes().iter().any(|outcome| {
        outcome.coord == hollow && matches!(outcome.status, JobStatus::Absent)
    }));
    assert_eq!(archive.entry_count(), 9);
    assert!(!archive.contains(&hollow));
    Ok(())
}

#[test]
fn paused_gate_holds_back_new_work() -> Result<(), Box<dyn std::error::Error>> {
    let source = Arc::new(StubSource::healthy("paused"));
    let listener = Arc::new(RecordingListener::default());
    let scope = JobScope::new(None, listener.clone());

    let pool = spawn(&config(3, 1))?;
    pool.gate().pause();
    submit_all(&pool, &source, &scope, grid(4, 10))?;

    thread::sleep(Duration::from_millis(100));
    assert_eq!(source.fetches(), 0);
    assert_eq!(pool.queued_count(), 10);
    assert!(!pool.wait_idle(Duration::from_millis(50)));
    assert!(pool.state().is_paused);

    pool.gate().resume();
    assert!(pool.wait_idle(IDLE_TIMEOUT));
    assert_eq!(listener.successes(), 10);
    Ok(())
}

#[test]
fn cancelled_scope_is_discarded_while_other_scopes_run() -> Result<(), Box<dyn std::error::Error>>
{
    let source = Arc::new(StubSource::healthy("scoped"));
    let stale = Arc::new(RecordingListener::default());
    let fresh = Arc::new(RecordingListener::default());
    let stale_scope = JobScope::new(None, stale.clone());
    let fresh_scope = JobScope::new(None, fresh.clone());

    let pool = spawn(&config(2, 1))?;
    pool.gate().pause();
    submit_all(&pool, &source, &stale_scope, grid(4, 5))?;
    submit_all(&pool, &source, &fresh_scope, grid(5, 5))?;
    stale_scope.cancel();
    pool.gate().resume();

    assert!(pool.wait_idle(IDLE_TIMEOUT));
    assert!(stale.outcomes().is_empty());
    assert_eq!(fresh.successes(), 5);
    Ok(())
}

#[test]
fn cancel_outstanding_drops_queued_jobs() -> Result<(), Box<dyn std::error::Error>> {
    let source = Arc::new(StubSource::healthy("drained"));
    let listener = Arc::new(RecordingListener::default());
    let scope = JobScope::new(None, listener.clone());

    let pool = spawn(&config(2, 1))?;
    pool.gate().pause();
    submit_all(&pool, &source, &scope, grid(5, 12))?;
    thread::sleep(Duration::from_millis(60));

    let dropped = pool.cancel_outstanding();
    assert!((10..=12).contains(&dropped), "dropped {dropped}");
    scope.cancel();
    assert!(pool.wait_idle(IDLE_TIMEOUT));
    pool.gate().resume();
    assert!(listener.outcomes().is_empty());
    assert_eq!(source.fetches(), 0);
    Ok(())
}

#[test]
fn terminate_all_stops_workers_and_discards_results() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let archive = Arc::new(IndexedTileArchive::create(dir.path().join("doomed.tsra"))?);
    let sink: Arc<dyn TileSink> = archive.clone();
    let source = Arc::new(StubSource::healthy("slow").with_delay(Duration::from_millis(40)));
    let listener = Arc::new(RecordingListener::default());
    let scope = JobScope::new(Some(sink), listener.clone());

    let pool = spawn(&config(4, 1))?;
    submit_all(&pool, &source, &scope, grid(7, 100))?;
    thread::sleep(Duration::from_millis(100));

    // Active is read first so a job finishing in between is counted twice, never zero times.
    let in_flight = pool.active_count();
    let delivered = listener.outcomes().len();
    assert!(in_flight <= 4, "in flight {in_flight}");
    pool.terminate_all();
    archive.abort()?;

    assert!(pool.is_terminated());
    assert_eq!(pool.live_workers(), 0);
    assert_eq!(pool.queued_count(), 0);
    let outcomes = listener.outcomes().len();
    assert!(
        outcomes <= delivered + in_flight,
        "{outcomes} outcomes after terminate, bound {delivered} + {in_flight}"
    );
    assert!(outcomes < 100);
    assert!(source.fetches() < 100);
    assert!(!archive.path().exists());

    let late: Arc<dyn TileSource> = source.clone();
    assert!(matches!(
        pool.submit(
            DownloadJob::new(TileCoord::new(0, 0, 0), late, LoadMethod::Source),
            &scope
        ),
        Err(TesseraError::Cancelled)
    ));
    Ok(())
}

#[test]
fn misconfigured_sources_surface_as_fatal() -> Result<(), Box<dyn std::error::Error>> {
    let source = Arc::new(StubSource::new("broken", |_, _| {
        Err(FetchError::Misconfigured("no api key".into()))
    }));
    let listener = Arc::new(RecordingListener::default());
    let scope = JobScope::new(None, listener.clone());

    let pool = spawn(&config(1, 3))?;
    submit_all(&pool, &source, &scope, [TileCoord::new(2, 1, 1)])?;
    assert!(pool.wait_idle(IDLE_TIMEOUT));

    let fatals = listener.fatals();
    assert_eq!(fatals.len(), 1);
    assert_eq!(fatals[0].0, TileCoord::new(2, 1, 1));
    assert!(fatals[0].1.contains("no api key"));
    assert!(listener.outcomes().is_empty());
    Ok(())
}

#[test]
fn panicking_fetch_does_not_kill_the_worker() -> Result<(), Box<dyn std::error::Error>> {
    let bomb = TileCoord::new(3, 2, 2);
    let source = Arc::new(StubSource::new("panicky", move |coord, _| {
        if coord == bomb {
            panic!("decoder exploded");
        }
        Ok(Some(Bytes::from_static(b"ok")))
    }));
    let listener = Arc::new(RecordingListener::default());
    let scope = JobScope::new(None, listener.clone());

    let pool = spawn(&config(1, 0))?;
    submit_all(&pool, &source, &scope, [bomb, TileCoord::new(3, 3, 3)])?;
    assert!(pool.wait_idle(IDLE_TIMEOUT));

    assert_eq!(listener.fatals().len(), 1);
    assert_eq!(listener.successes(), 1);
    assert_eq!(pool.live_workers(), 1);
    Ok(())
}

#[test]
fn queue_full_hands_the_job_back() -> Result<(), Box<dyn std::error::Error>> {
    let source = Arc::new(StubSource::healthy("tight"));
    let listener = Arc::new(RecordingListener::default());
    let scope = JobScope::new(None, listener.clone());
    let config = DownloadConfig {
        workers: 1,
        queue_capacity: 1,
        ..DownloadConfig::default()
    };

    let pool = spawn(&config)?;
    pool.gate().pause();
    let job = |coord| {
        let source: Arc<dyn TileSource> = source.clone();
        DownloadJob::new(coord, source, LoadMethod::Source)
    };

    let mut accepted = 0;
    let mut rejected = None;
    for coord in grid(3, 4) {
        match pool.submit_timeout(job(coord), &scope, Duration::from_millis(20))? {
            tessera_core::SubmitOutcome::Accepted => accepted += 1,
            tessera_core::SubmitOutcome::QueueFull(job) => {
                rejected = Some(job.coord);
                break;
            }
        }
    }
    assert!(accepted >= 1);
    assert!(rejected.is_some());
    assert_eq!(pool.queued_count(), accepted);

    pool.gate().resume();
    assert!(pool.wait_idle(IDLE_TIMEOUT));
    assert_eq!(listener.successes(), accepted);
    Ok(())
}
