mod support;

use std::sync::Arc;
use std::time::Duration;

use support::{RecordingListener, StubSource, tile_bytes};
use tessera_core::{
    DownloadConfig, IndexedTileArchive, JobProducer, JobScope, MapSpec, PauseResumeGate,
    TileCoord, TileRange, TileSink, TileSourceResolver, WorkerPool,
};

const SUBMIT_TIMEOUT: Duration = Duration::from_millis(20);

fn pool(workers: usize) -> Result<Arc<WorkerPool>, Box<dyn std::error::Error>> {
    let config = DownloadConfig {
        workers,
        queue_capacity: 8,
        ..DownloadConfig::default()
    };
    Ok(Arc::new(WorkerPool::spawn(
        &config,
        Arc::new(PauseResumeGate::new()),
        TileSourceResolver::new(),
    )?))
}

#[test]
fn enumerates_every_tile_of_every_range() -> Result<(), Box<dyn std::error::Error>> {
    let source = Arc::new(StubSource::healthy("ranges"));
    let map = MapSpec::new(
        "two zooms",
        source.clone(),
        vec![
            TileRange::new(3, 0, 3, 0, 3)?,
            TileRange::new(4, 2, 5, 2, 3)?,
        ],
    );
    let listener = Arc::new(RecordingListener::default());
    let scope = JobScope::new(None, listener.clone());
    let pool = pool(3)?;

    let producer = JobProducer::start(&map, pool.clone(), scope, None, SUBMIT_TIMEOUT)?;
    let summary = producer.join()?;
    assert!(pool.wait_idle(Duration::from_secs(10)));

    assert_eq!(summary.submitted, 24);
    assert_eq!(summary.skipped, 0);
    assert!(!summary.cancelled);
    assert_eq!(listener.successes(), 24);
    assert_eq!(source.fetches(), 24);
    Ok(())
}

#[test]
fn overlapping_ranges_enqueue_each_tile_once() -> Result<(), Box<dyn std::error::Error>> {
    let source = Arc::new(StubSource::healthy("overlap").with_delay(Duration::from_millis(20)));
    let square = TileRange::new(3, 0, 1, 0, 1)?;
    let map = MapSpec::new(
        "overlap",
        source.clone(),
        vec![square, square, TileRange::new(3, 1, 2, 1, 2)?],
    );
    assert_eq!(map.tile_count(), 7);
    assert_eq!(map.coords().count(), 7);

    let listener = Arc::new(RecordingListener::default());
    let scope = JobScope::new(None, listener.clone());
    let pool = pool(4)?;

    let summary = JobProducer::start(&map, pool.clone(), scope, None, SUBMIT_TIMEOUT)?.join()?;
    assert!(pool.wait_idle(Duration::from_secs(10)));

    assert_eq!(summary.submitted, 7);
    assert_eq!(source.fetches(), 7);
    assert!(!source.saw_concurrent_duplicate());
    for coord in map.coords() {
        assert_eq!(source.attempts(coord), 1, "{coord}");
    }
    assert_eq!(source.attempts(TileCoord::new(3, 1, 1)), 1);
    assert_eq!(listener.successes(), 7);
    Ok(())
}

#[test]
fn tiles_already_in_the_sink_are_not_requeued() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let archive = Arc::new(IndexedTileArchive::create(dir.path().join("resume.tsra"))?);
    let range = TileRange::new(4, 0, 3, 0, 3)?;
    for coord in range.iter().take(6) {
        archive.append(coord, &tile_bytes(coord))?;
    }

    let source = Arc::new(StubSource::healthy("resume"));
    let map = MapSpec::new("resume", source.clone(), vec![range]);
    let sink: Arc<dyn TileSink> = archive.clone();
    let listener = Arc::new(RecordingListener::default());
    let scope = JobScope::new(Some(sink.clone()), listener.clone());
    let pool = pool(2)?;

    let first = JobProducer::start(&map, pool.clone(), scope.clone(), Some(sink.clone()), SUBMIT_TIMEOUT)?
        .join()?;
    assert!(pool.wait_idle(Duration::from_secs(10)));
    assert_eq!(first.submitted, 10);
    assert_eq!(first.skipped, 6);
    assert_eq!(archive.entry_count(), 16);

    let second = JobProducer::start(&map, pool.clone(), scope, Some(sink), SUBMIT_TIMEOUT)?.join()?;
    assert!(pool.wait_idle(Duration::from_secs(10)));
    assert_eq!(second.submitted, 0);
    assert_eq!(second.skipped, 16);
    assert_eq!(source.fetches(), 10);
    Ok(())
}

#[test]
fn file_based_maps_produce_no_jobs() -> Result<(), Box<dyn std::error::Error>> {
    let source = Arc::new(StubSource::healthy("local").file_based());
    let map = MapSpec::new("local", source.clone(), vec![TileRange::new(2, 0, 3, 0, 3)?]);
    let scope = JobScope::new(None, Arc::new(RecordingListener::default()));

    let summary = JobProducer::start(&map, pool(1)?, scope, None, SUBMIT_TIMEOUT)?.join()?;
    assert_eq!(summary.submitted, 0);
    assert_eq!(source.fetches(), 0);
    Ok(())
}

#[test]
fn cancel_stops_enumeration_on_a_paused_pool() -> Result<(), Box<dyn std::error::Error>> {
    let source = Arc::new(StubSource::healthy("big"));
    let map = MapSpec::new("big", source, vec![TileRange::new(10, 0, 99, 0, 99)?]);
    let listener = Arc::new(RecordingListener::default());
    let scope = JobScope::new(None, listener.clone());
    let pool = pool(2)?;
    pool.gate().pause();

    let producer = JobProducer::start(&map, pool.clone(), scope.clone(), None, SUBMIT_TIMEOUT)?;
    std::thread::sleep(Duration::from_millis(80));
    assert!(!producer.is_finished());
    producer.cancel();
    let summary = producer.join()?;

    assert!(summary.cancelled);
    assert!(summary.submitted < 10_000);

    scope.cancel();
    pool.cancel_outstanding();
    pool.gate().resume();
    assert!(pool.wait_idle(Duration::from_secs(10)));
    assert!(listener.outcomes().is_empty());
    assert_eq!(map.tile_count(), 10_000);
    assert!(map.contains(&TileCoord::new(10, 99, 99)));
    Ok(())
}
