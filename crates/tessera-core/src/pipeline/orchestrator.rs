use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::Serialize;

use crate::archive::{IndexedTileArchive, TileSink};
use crate::config::DownloadConfig;
use crate::core::{JobScope, PauseResumeGate, WorkerPool};
use crate::source::{
    CacheSink, NoopSourceListener, SourceListener, TileCache, TileSourceResolver,
};
use crate::telemetry::{
    self, DefaultWorkerTelemetry, NoopProgressSink, ProgressEvent, ProgressSink,
    TelemetrySnapshot, WorkerTelemetry, tags,
};
use crate::{Result, TesseraError};

use super::builder::{ArchiveTileProvider, MapBuilder, SourceTileProvider};
use super::decision::{
    DecisionHandler, HeadlessPolicy, MapErrorDecision, MissingTiles, MissingTilesDecision,
    RetryDecision,
};
use super::job::{MapCounters, MapSignal};
use super::map::{AtlasSpec, LayerSpec, MapSpec};
use super::producer::JobProducer;

static ARCHIVE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrchestratorState {
    Idle,
    DownloadingMap,
    AwaitingDrain,
    Assembling,
    LayerDone,
    Skipped,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MapOutcome {
    Completed { tiles_archived: u64, missing: u64 },
    Skipped,
    /// A fatal error ended the map and the run continued with the next one.
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct MapReport {
    pub layer: String,
    pub map: String,
    pub outcome: MapOutcome,
    /// Distinct tiles the map covers.
    pub tiles_total: u64,
    /// Tiles stored by the last pass.
    pub tiles_archived: u64,
    /// Tiles the source reported as not existing.
    pub absent: u64,
    pub permanent_failures: u64,
    /// Retryable failures of the last pass, including ones later recovered.
    pub retryable_errors: u64,
    /// Download passes, counting restarts.
    pub passes: u32,
    pub elapsed: Duration,
}

/// Result of a whole atlas run.
#[derive(Debug, Clone, Serialize)]
pub struct AtlasReport {
    pub atlas: String,
    /// One report per map, in atlas order.
    pub maps: Vec<MapReport>,
    pub elapsed: Duration,
    /// Metrics recorded during this run only.
    pub telemetry: TelemetrySnapshot,
}

impl AtlasReport {
    pub fn completed(&self) -> usize {
        self.count(|outcome| matches!(outcome, MapOutcome::Completed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|outcome| matches!(outcome, MapOutcome::Skipped))
    }

    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, MapOutcome::Failed { .. }))
    }

    fn count(&self, predicate: impl Fn(&MapOutcome) -> bool) -> usize {
        self.maps.iter().filter(|map| predicate(&map.outcome)).count()
    }
}

/// Cross-thread handle to a running orchestrator.
#[derive(Clone)]
pub struct AtlasController {
    gate: Arc<PauseResumeGate>,
    aborted: Arc<AtomicBool>,
    state: Arc<Mutex<OrchestratorState>>,
    signals: Sender<MapSignal>,
}

impl AtlasController {
    /// Toggles the pause state and returns whether downloads are now paused.
    pub fn pause_resume(&self) -> bool {
        let paused = self.gate.toggle();
        let _ = self.signals.send(MapSignal::Control);
        paused
    }

    pub fn pause(&self) {
        self.gate.pause();
    }

    pub fn resume(&self) {
        self.gate.resume();
        let _ = self.signals.send(MapSignal::Control);
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    /// Requests cancellation; the run stops at its next poll.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        let _ = self.signals.send(MapSignal::Control);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn state(&self) -> OrchestratorState {
        *lock_unpoisoned(&self.state)
    }
}

enum Destination {
    Archive,
    Cache(Arc<dyn TileCache>),
}

enum Verdict {
    Drained,
    Restart,
    Skip,
    Abort,
    Fatal(TesseraError),
}

enum PassResult {
    Finished {
        archive: Arc<IndexedTileArchive>,
        counters: Arc<MapCounters>,
    },
    /// Cache-only pass; `already_cached` tiles were skipped by the producer.
    Cached {
        counters: Arc<MapCounters>,
        already_cached: u64,
    },
    Restart,
    Skipped(Arc<MapCounters>),
    Failed(TesseraError, Arc<MapCounters>),
}

struct NoAssembly;

impl MapBuilder for NoAssembly {
    fn build_map(&mut self, _map: &MapSpec, _tiles: &dyn super::TileProvider) -> Result<()> {
        Ok(())
    }
}

/// Drives an atlas through download and assembly, map by map.
///
/// One worker pool is shared by all maps of a run. Each map gets a fresh
/// temporary archive that is deleted once the map was handed to the
/// [`MapBuilder`], skipped, or aborted.
pub struct AtlasCreationOrchestrator {
    config: DownloadConfig,
    work_dir: PathBuf,
    resolver: TileSourceResolver,
    decisions: Arc<dyn DecisionHandler>,
    progress: Arc<dyn ProgressSink>,
    worker_telemetry: Arc<dyn WorkerTelemetry>,
    source_listener: Arc<dyn SourceListener>,
    gate: Arc<PauseResumeGate>,
    aborted: Arc<AtomicBool>,
    state: Arc<Mutex<OrchestratorState>>,
    signals_tx: Sender<MapSignal>,
    signals_rx: Receiver<MapSignal>,
}

impl AtlasCreationOrchestrator {
    pub fn new(config: DownloadConfig) -> Result<Self> {
        config.validate()?;
        let (signals_tx, signals_rx) = unbounded();
        Ok(Self {
            work_dir: config.work_dir(),
            config,
            resolver: TileSourceResolver::new(),
            decisions: Arc::new(HeadlessPolicy::default()),
            progress: Arc::new(NoopProgressSink),
            worker_telemetry: Arc::new(DefaultWorkerTelemetry),
            source_listener: Arc::new(NoopSourceListener),
            gate: Arc::new(PauseResumeGate::new()),
            aborted: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(OrchestratorState::Idle)),
            signals_tx,
            signals_rx,
        })
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn with_resolver(mut self, resolver: TileSourceResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_decision_handler(mut self, decisions: Arc<dyn DecisionHandler>) -> Self {
        self.decisions = decisions;
        self
    }

    pub fn with_progress_sink(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_worker_telemetry(mut self, telemetry: Arc<dyn WorkerTelemetry>) -> Self {
        self.worker_telemetry = telemetry;
        self
    }

    pub fn with_source_listener(mut self, listener: Arc<dyn SourceListener>) -> Self {
        self.source_listener = listener;
        self
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    pub fn controller(&self) -> AtlasController {
        AtlasController {
            gate: Arc::clone(&self.gate),
            aborted: Arc::clone(&self.aborted),
            state: Arc::clone(&self.state),
            signals: self.signals_tx.clone(),
        }
    }

    pub fn state(&self) -> OrchestratorState {
        *lock_unpoisoned(&self.state)
    }

    /// Downloads every map of `atlas` and hands it to `builder`.
    ///
    /// Returns `Err(TesseraError::Cancelled)` when the run was aborted by the
    /// controller or a decision handler.
    pub fn run(&self, atlas: &AtlasSpec, builder: &mut dyn MapBuilder) -> Result<AtlasReport> {
        self.run_with(atlas, builder, Destination::Archive)
    }

    /// Downloads every map of `atlas` into `cache` without assembling.
    pub fn run_cache_only(
        &self,
        atlas: &AtlasSpec,
        cache: Arc<dyn TileCache>,
    ) -> Result<AtlasReport> {
        self.run_with(atlas, &mut NoAssembly, Destination::Cache(cache))
    }

    /// Rejects atlases that cannot be built before any thread is started.
    pub fn check_atlas(&self, atlas: &AtlasSpec, builder: &dyn MapBuilder) -> Result<()> {
        let online = atlas.online_tile_count();
        if online > self.config.max_online_tiles {
            return Err(TesseraError::TooManyTiles {
                requested: online,
                limit: self.config.max_online_tiles,
            });
        }
        for map in atlas.maps() {
            if !builder.supports_source(map.source.as_ref()) {
                return Err(TesseraError::UnsupportedSource {
                    map: map.name.clone(),
                    source_name: map.source.name().to_owned(),
                });
            }
        }
        Ok(())
    }

    fn run_with(
        &self,
        atlas: &AtlasSpec,
        builder: &mut dyn MapBuilder,
        destination: Destination,
    ) -> Result<AtlasReport> {
        self.check_atlas(atlas, builder)?;
        self.aborted.store(false, Ordering::Release);
        self.gate.reset();
        while self.signals_rx.try_recv().is_ok() {}

        let started_at = Instant::now();
        let baseline = telemetry::snapshot();
        self.progress.on_event(&ProgressEvent::AtlasStarted {
            atlas: atlas.name.clone(),
            maps: atlas.map_count(),
            online_tiles: atlas.online_tile_count(),
        });
        tracing::info!(
            target: tags::TARGET_ATLAS,
            atlas = %atlas.name,
            maps = atlas.map_count(),
            tiles = atlas.tile_count(),
            workers = self.config.workers,
            "atlas creation started"
        );

        let mut pool = None;
        let mut reports = Vec::with_capacity(atlas.map_count());
        let result = self.run_layers(atlas, builder, &destination, &mut pool, &mut reports);

        if let Some(pool) = pool.take() {
            if result.is_ok() {
                pool.shutdown();
            } else {
                pool.terminate_all();
            }
        }

        match result.and_then(|()| builder.finish_atlas()) {
            Ok(()) => {
                self.set_state(OrchestratorState::Idle);
                let elapsed = started_at.elapsed();
                self.progress.on_event(&ProgressEvent::AtlasFinished {
                    atlas: atlas.name.clone(),
                    elapsed,
                });
                tracing::info!(
                    target: tags::TARGET_ATLAS,
                    atlas = %atlas.name,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "atlas creation finished"
                );
                Ok(AtlasReport {
                    atlas: atlas.name.clone(),
                    maps: reports,
                    elapsed,
                    telemetry: telemetry::snapshot().since(&baseline),
                })
            }
            Err(error) => {
                builder.abort();
                self.set_state(OrchestratorState::Aborted);
                tracing::warn!(target: tags::TARGET_ATLAS, atlas = %atlas.name, %error, "atlas creation aborted");
                Err(error)
            }
        }
    }

    fn run_layers(
        &self,
        atlas: &AtlasSpec,
        builder: &mut dyn MapBuilder,
        destination: &Destination,
        pool: &mut Option<Arc<WorkerPool>>,
        reports: &mut Vec<MapReport>,
    ) -> Result<()> {
        for layer in &atlas.layers {
            self.check_abort()?;
            self.progress.on_event(&ProgressEvent::LayerStarted {
                layer: layer.name.clone(),
            });
            builder.begin_layer(layer)?;

            for map in &layer.maps {
                self.check_abort()?;
                let report = self.process_map(layer, map, builder, destination, pool)?;
                telemetry::increment_counter(
                    tags::METRIC_ATLAS_MAP_COUNT,
                    1,
                    &[("subsystem", "atlas"), ("op", "map")],
                );
                self.progress.on_event(&ProgressEvent::MapFinished {
                    map: map.name.clone(),
                    outcome: report.outcome.clone(),
                });
                reports.push(report);
            }

            builder.finish_layer(layer)?;
            self.set_state(OrchestratorState::LayerDone);
            self.progress.on_event(&ProgressEvent::LayerFinished {
                layer: layer.name.clone(),
            });
        }
        Ok(())
    }

    fn process_map(
        &self,
        layer: &LayerSpec,
        map: &MapSpec,
        builder: &mut dyn MapBuilder,
        destination: &Destination,
        pool_slot: &mut Option<Arc<WorkerPool>>,
    ) -> Result<MapReport> {
        let started_at = Instant::now();
        let report = |outcome: MapOutcome, counters: Option<&MapCounters>, passes: u32| MapReport {
            layer: layer.name.clone(),
            map: map.name.clone(),
            outcome,
            tiles_total: map.tile_count(),
            tiles_archived: counters.map_or(0, MapCounters::succeeded),
            absent: counters.map_or(0, MapCounters::absent),
            permanent_failures: counters.map_or(0, MapCounters::permanent_failures),
            retryable_errors: counters.map_or(0, MapCounters::retryable_errors),
            passes,
            elapsed: started_at.elapsed(),
        };

        if map.is_file_based() {
            let outcome = match destination {
                Destination::Cache(_) => MapOutcome::Skipped,
                Destination::Archive => {
                    if let Err(error) = initialize_source(map) {
                        let outcome = self.handle_map_error(map, error)?;
                        return Ok(report(outcome, None, 0));
                    }
                    self.set_state(OrchestratorState::Assembling);
                    self.progress.on_event(&ProgressEvent::MapAssembling {
                        map: map.name.clone(),
                        tiles_archived: 0,
                    });
                    match builder.build_map(map, &SourceTileProvider::new(map.source.as_ref())) {
                        Ok(()) => MapOutcome::Completed {
                            tiles_archived: 0,
                            missing: 0,
                        },
                        Err(error) => self.handle_map_error(map, error)?,
                    }
                }
            };
            return Ok(report(outcome, None, 0));
        }

        let mut passes = 0u32;
        loop {
            passes += 1;
            self.check_abort()?;
            if let Err(error) = initialize_source(map) {
                let outcome = self.handle_map_error(map, error)?;
                return Ok(report(outcome, None, passes));
            }
            let pool = self.ensure_pool(pool_slot)?;

            match self.download_pass(layer, map, &pool, destination, passes)? {
                PassResult::Restart => {
                    telemetry::increment_counter(
                        tags::METRIC_ATLAS_MAP_RESTART_COUNT,
                        1,
                        &[("subsystem", "atlas"), ("op", "restart")],
                    );
                    tracing::info!(target: tags::TARGET_ATLAS, map = %map.name, pass = passes, "restarting map download");
                }
                PassResult::Skipped(counters) => {
                    self.set_state(OrchestratorState::Skipped);
                    telemetry::increment_counter(
                        tags::METRIC_ATLAS_MAP_SKIPPED_COUNT,
                        1,
                        &[("subsystem", "atlas"), ("op", "skip")],
                    );
                    tracing::info!(target: tags::TARGET_ATLAS, map = %map.name, "map skipped");
                    return Ok(report(MapOutcome::Skipped, Some(&counters), passes));
                }
                PassResult::Failed(error, counters) => {
                    *pool_slot = None;
                    let outcome = self.handle_map_error(map, error)?;
                    return Ok(report(outcome, Some(&counters), passes));
                }
                PassResult::Cached {
                    counters,
                    already_cached,
                } => {
                    let outcome = MapOutcome::Completed {
                        tiles_archived: counters.succeeded(),
                        missing: map
                            .tile_count()
                            .saturating_sub(counters.succeeded())
                            .saturating_sub(already_cached),
                    };
                    return Ok(report(outcome, Some(&counters), passes));
                }
                PassResult::Finished { archive, counters } => {
                    let tiles_archived = archive.entry_count() as u64;
                    self.set_state(OrchestratorState::Assembling);
                    self.progress.on_event(&ProgressEvent::MapAssembling {
                        map: map.name.clone(),
                        tiles_archived,
                    });
                    let built = builder.build_map(map, &ArchiveTileProvider::new(&archive));
                    delete_archive(&archive);

                    let outcome = match built {
                        Ok(()) => MapOutcome::Completed {
                            tiles_archived,
                            missing: map.tile_count().saturating_sub(tiles_archived),
                        },
                        Err(error) => self.handle_map_error(map, error)?,
                    };
                    return Ok(report(outcome, Some(&counters), passes));
                }
            }
        }
    }

    fn download_pass(
        &self,
        layer: &LayerSpec,
        map: &MapSpec,
        pool: &Arc<WorkerPool>,
        destination: &Destination,
        pass: u32,
    ) -> Result<PassResult> {
        while self.signals_rx.try_recv().is_ok() {}

        let (sink, archive): (Arc<dyn TileSink>, Option<Arc<IndexedTileArchive>>) =
            match destination {
                Destination::Archive => {
                    let archive = Arc::new(IndexedTileArchive::create(self.archive_path(map))?);
                    let sink: Arc<dyn TileSink> = archive.clone();
                    (sink, Some(archive))
                }
                Destination::Cache(cache) => {
                    let sink: Arc<dyn TileSink> =
                        Arc::new(CacheSink::new(Arc::clone(cache), map.source.name()));
                    (sink, None)
                }
            };

        let threshold = if self.decisions.ignore_download_errors() {
            None
        } else {
            Some(self.config.retry_error_threshold)
        };
        let counters = Arc::new(MapCounters::new(
            map.name.clone(),
            map.tile_count(),
            threshold,
            Arc::clone(&self.gate),
            Arc::clone(&self.progress),
            self.signals_tx.clone(),
        ));
        let scope = JobScope::new(Some(Arc::clone(&sink)), counters.clone());

        self.set_state(OrchestratorState::DownloadingMap);
        self.progress.on_event(&ProgressEvent::MapStarted {
            layer: layer.name.clone(),
            map: map.name.clone(),
            tiles_total: map.tile_count(),
            pass,
        });
        tracing::info!(
            target: tags::TARGET_ATLAS,
            layer = %layer.name,
            map = %map.name,
            source = map.source.name(),
            tiles = map.tile_count(),
            pass,
            "downloading map"
        );

        let producer = match JobProducer::start(
            map,
            Arc::clone(pool),
            Arc::clone(&scope),
            Some(sink),
            self.config.poll_interval(),
        ) {
            Ok(producer) => producer,
            Err(error) => {
                if let Some(archive) = &archive {
                    delete_archive(archive);
                }
                return Err(error);
            }
        };

        let verdict = self.await_drain(pool, &producer, &counters);
        match verdict {
            Verdict::Drained => {
                let summary = producer.join()?;
                if let Some(error) = counters.take_fatal() {
                    if let Some(archive) = &archive {
                        delete_archive(archive);
                    }
                    return Ok(PassResult::Failed(error, counters));
                }
                let Some(archive) = archive else {
                    return Ok(PassResult::Cached {
                        counters,
                        already_cached: summary.skipped,
                    });
                };
                if let Err(error) = archive.finalize() {
                    delete_archive(&archive);
                    return Ok(PassResult::Failed(error, counters));
                }
                self.check_missing_tiles(map, archive, counters)
            }
            Verdict::Restart => {
                self.discard_pass(producer, &scope, pool, archive.as_deref());
                Ok(PassResult::Restart)
            }
            Verdict::Skip => {
                self.discard_pass(producer, &scope, pool, archive.as_deref());
                Ok(PassResult::Skipped(counters))
            }
            Verdict::Abort => {
                self.abort_pass(producer, &scope, pool, archive.as_deref());
                Err(TesseraError::Cancelled)
            }
            Verdict::Fatal(error) => {
                self.abort_pass(producer, &scope, pool, archive.as_deref());
                Ok(PassResult::Failed(error, counters))
            }
        }
    }

    /// Polls until the map drained or something demands a decision.
    fn await_drain(
        &self,
        pool: &WorkerPool,
        producer: &JobProducer,
        counters: &MapCounters,
    ) -> Verdict {
        let mut decided = false;
        loop {
            if self.aborted.load(Ordering::Acquire) {
                return Verdict::Abort;
            }
            if let Some(error) = counters.take_fatal() {
                return Verdict::Fatal(error);
            }

            if counters.threshold_crossed() && !decided {
                decided = true;
                let progress = counters.snapshot();
                self.progress
                    .on_event(&ProgressEvent::RetryThresholdReached(progress.clone()));
                match self.decisions.on_retry_threshold(&progress) {
                    RetryDecision::Continue => self.gate.resume(),
                    RetryDecision::Retry => return Verdict::Restart,
                    RetryDecision::Skip => return Verdict::Skip,
                    RetryDecision::Abort => return Verdict::Abort,
                }
                continue;
            }

            if producer.is_finished() {
                self.set_state(OrchestratorState::AwaitingDrain);
                if pool.is_idle() {
                    if counters.threshold_crossed() && !decided {
                        continue;
                    }
                    return Verdict::Drained;
                }
            }

            let _ = self.signals_rx.recv_timeout(self.config.poll_interval());
        }
    }

    fn check_missing_tiles(
        &self,
        map: &MapSpec,
        archive: Arc<IndexedTileArchive>,
        counters: Arc<MapCounters>,
    ) -> Result<PassResult> {
        let missing = MissingTiles {
            map: map.name.clone(),
            expected: map.tile_count(),
            archived: archive.entry_count() as u64,
            permanent_failures: counters.permanent_failures(),
        };
        if missing.missing() == 0 || self.decisions.ignore_download_errors() {
            return Ok(PassResult::Finished { archive, counters });
        }

        tracing::warn!(
            target: tags::TARGET_ATLAS,
            map = %map.name,
            expected = missing.expected,
            archived = missing.archived,
            "map is missing tiles"
        );
        match self.decisions.on_missing_tiles(&missing) {
            MissingTilesDecision::Proceed => Ok(PassResult::Finished { archive, counters }),
            MissingTilesDecision::Skip => {
                delete_archive(&archive);
                Ok(PassResult::Skipped(counters))
            }
            MissingTilesDecision::Abort => {
                delete_archive(&archive);
                Err(TesseraError::Cancelled)
            }
        }
    }

    /// Cooperative teardown of one pass; the pool survives for the next.
    fn discard_pass(
        &self,
        producer: JobProducer,
        scope: &JobScope,
        pool: &WorkerPool,
        archive: Option<&IndexedTileArchive>,
    ) {
        producer.cancel();
        scope.cancel();
        let _ = producer.join();
        pool.cancel_outstanding();
        while !pool.wait_idle(self.config.poll_interval()) {
            if self.aborted.load(Ordering::Acquire) {
                pool.terminate_all();
                break;
            }
        }
        if let Some(archive) = archive {
            delete_archive(archive);
        }
        self.gate.resume();
    }

    /// Hard teardown: the pool is terminated and must be respawned.
    fn abort_pass(
        &self,
        producer: JobProducer,
        scope: &JobScope,
        pool: &WorkerPool,
        archive: Option<&IndexedTileArchive>,
    ) {
        producer.cancel();
        scope.cancel();
        pool.terminate_all();
        let _ = producer.join();
        if let Some(archive) = archive {
            if let Err(error) = archive.abort() {
                tracing::warn!(target: tags::TARGET_ATLAS, path = %archive.path().display(), %error, "failed to delete partial archive");
            }
        }
        telemetry::increment_counter(
            tags::METRIC_ATLAS_MAP_ABORTED_COUNT,
            1,
            &[("subsystem", "atlas"), ("op", "abort")],
        );
    }

    fn handle_map_error(&self, map: &MapSpec, error: TesseraError) -> Result<MapOutcome> {
        if error.is_cancellation() || self.aborted.load(Ordering::Acquire) {
            return Err(error);
        }
        tracing::error!(target: tags::TARGET_ATLAS, map = %map.name, %error, "map failed");
        match self.decisions.on_map_error(&map.name, &error) {
            MapErrorDecision::Continue => {
                self.set_state(OrchestratorState::Aborted);
                Ok(MapOutcome::Failed {
                    error: error.to_string(),
                })
            }
            MapErrorDecision::Abort => Err(error),
        }
    }

    fn ensure_pool(&self, slot: &mut Option<Arc<WorkerPool>>) -> Result<Arc<WorkerPool>> {
        if let Some(pool) = slot.as_ref().filter(|pool| !pool.is_terminated()) {
            return Ok(Arc::clone(pool));
        }
        if self.gate.is_cancelled() {
            self.gate.reset();
        }
        let pool = Arc::new(WorkerPool::spawn_with(
            &self.config,
            Arc::clone(&self.gate),
            self.resolver.clone(),
            Arc::clone(&self.worker_telemetry),
            Arc::clone(&self.source_listener),
        )?);
        *slot = Some(Arc::clone(&pool));
        Ok(pool)
    }

    fn archive_path(&self, map: &MapSpec) -> PathBuf {
        let sequence = ARCHIVE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let name: String = map
            .name
            .chars()
            .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
            .take(48)
            .collect();
        self.work_dir
            .join(format!("tessera-{}-{sequence}-{name}.tsra", std::process::id()))
    }

    fn check_abort(&self) -> Result<()> {
        if self.aborted.load(Ordering::Acquire) {
            Err(TesseraError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: OrchestratorState) {
        *lock_unpoisoned(&self.state) = state;
    }
}

fn initialize_source(map: &MapSpec) -> Result<()> {
    map.source.initialize().map_err(|error| {
        TesseraError::Fetch(error).with_context(format!(
            "initialize source \"{}\" for map \"{}\"",
            map.source.name(),
            map.name
        ))
    })
}

fn delete_archive(archive: &IndexedTileArchive) {
    if let Err(error) = archive.delete_underlying() {
        tracing::warn!(
            target: tags::TARGET_ATLAS,
            path = %archive.path().display(),
            %error,
            "failed to delete archive"
        );
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
