#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tessera_core::pipeline::{
    MapErrorDecision, MissingTiles, MissingTilesDecision, RetryDecision, TileProvider,
};
use tessera_core::source::{FetchContext, SourceKind};
use tessera_core::telemetry::MapProgress;
use tessera_core::{
    DecisionHandler, FetchError, JobListener, JobOutcome, JobStatus, MapBuilder, MapSpec,
    TesseraError, TileCoord, TileSource,
};

/// Deterministic payload for a tile.
pub fn tile_bytes(coord: TileCoord) -> Vec<u8> {
    let mut data = format!("tile {coord}").into_bytes();
    data.extend(std::iter::repeat_n(
        (coord.x ^ coord.y) as u8,
        16 + (coord.x as usize % 13),
    ));
    data
}

type Behaviour = dyn Fn(TileCoord, usize) -> Result<Option<Bytes>, FetchError> + Send + Sync;

/// In-memory source whose answer per tile is scripted by a closure taking
/// the coordinate and the zero-based attempt number.
pub struct StubSource {
    name: String,
    behaviour: Box<Behaviour>,
    delay: Duration,
    attempts: Mutex<HashMap<TileCoord, usize>>,
    in_flight: Mutex<HashSet<TileCoord>>,
    concurrent_duplicate: AtomicBool,
    fetches: AtomicUsize,
    file_based: bool,
    init_error: Option<String>,
    initializations: AtomicUsize,
}

impl StubSource {
    pub fn new(
        name: &str,
        behaviour: impl Fn(TileCoord, usize) -> Result<Option<Bytes>, FetchError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            name: name.to_owned(),
            behaviour: Box::new(behaviour),
            delay: Duration::ZERO,
            attempts: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            concurrent_duplicate: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
            file_based: false,
            init_error: None,
            initializations: AtomicUsize::new(0),
        }
    }

    /// Every tile succeeds with [`tile_bytes`].
    pub fn healthy(name: &str) -> Self {
        Self::new(name, |coord, _| Ok(Some(Bytes::from(tile_bytes(coord)))))
    }

    /// Every tile fails transiently, forever.
    pub fn failing(name: &str) -> Self {
        Self::new(name, |coord, _| {
            Err(FetchError::Transient(format!("{coord} unavailable")))
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn file_based(mut self) -> Self {
        self.file_based = true;
        self
    }

    /// `initialize` fails with a misconfiguration carrying `message`.
    pub fn with_init_error(mut self, message: &str) -> Self {
        self.init_error = Some(message.to_owned());
        self
    }

    pub fn initializations(&self) -> usize {
        self.initializations.load(Ordering::SeqCst)
    }

    pub fn attempts(&self, coord: TileCoord) -> usize {
        self.attempts
            .lock()
            .map(|attempts| attempts.get(&coord).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn saw_concurrent_duplicate(&self) -> bool {
        self.concurrent_duplicate.load(Ordering::SeqCst)
    }
}

impl TileSource for StubSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        if self.file_based {
            SourceKind::FileBased
        } else {
            SourceKind::Http
        }
    }

    fn initialize(&self) -> Result<(), FetchError> {
        self.initializations.fetch_add(1, Ordering::SeqCst);
        match &self.init_error {
            Some(message) => Err(FetchError::Misconfigured(message.clone())),
            None => Ok(()),
        }
    }

    fn tile_location(&self, coord: TileCoord) -> Option<String> {
        Some(format!("stub://{}/{coord}", self.name))
    }

    fn fetch(
        &self,
        coord: TileCoord,
        ctx: &FetchContext<'_>,
    ) -> Result<Option<Bytes>, FetchError> {
        ctx.check_cancelled()?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let attempt = {
            let mut attempts = self.attempts.lock().expect("attempts lock");
            let slot = attempts.entry(coord).or_insert(0);
            *slot += 1;
            *slot - 1
        };
        if !self.in_flight.lock().expect("in-flight lock").insert(coord) {
            self.concurrent_duplicate.store(true, Ordering::SeqCst);
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let result = (self.behaviour)(coord, attempt);
        self.in_flight.lock().expect("in-flight lock").remove(&coord);
        result
    }
}

/// Keeps every outcome and fatal error a pool reports.
#[derive(Default)]
pub struct RecordingListener {
    outcomes: Mutex<Vec<JobOutcome>>,
    fatals: Mutex<Vec<(TileCoord, String)>>,
}

impl RecordingListener {
    pub fn outcomes(&self) -> Vec<JobOutcome> {
        self.outcomes.lock().expect("outcomes lock").clone()
    }

    pub fn fatals(&self) -> Vec<(TileCoord, String)> {
        self.fatals.lock().expect("fatals lock").clone()
    }

    pub fn successes(&self) -> usize {
        self.count(|status| matches!(status, JobStatus::Success(_)))
    }

    pub fn permanent_failures(&self) -> usize {
        self.count(|status| matches!(status, JobStatus::PermanentFailure(_)))
    }

    pub fn retryable_failures(&self) -> usize {
        self.count(|status| matches!(status, JobStatus::RetryableFailure(_)))
    }

    /// Outcomes that finish a job for good.
    pub fn completions(&self) -> usize {
        self.count(JobStatus::is_completion)
    }

    fn count(&self, predicate: impl Fn(&JobStatus) -> bool) -> usize {
        self.outcomes
            .lock()
            .expect("outcomes lock")
            .iter()
            .filter(|outcome| predicate(&outcome.status))
            .count()
    }
}

impl JobListener for RecordingListener {
    fn on_outcome(&self, outcome: &JobOutcome) {
        self.outcomes
            .lock()
            .expect("outcomes lock")
            .push(outcome.clone());
    }

    fn on_fatal(&self, coord: TileCoord, error: TesseraError) {
        self.fatals
            .lock()
            .expect("fatals lock")
            .push((coord, error.to_string()));
    }
}

/// Answers decision points from a script and records what it was asked.
pub struct ScriptedDecisions {
    retry: Mutex<Vec<RetryDecision>>,
    missing: MissingTilesDecision,
    map_error: MapErrorDecision,
    ignore_errors: bool,
    pub retry_calls: Mutex<Vec<MapProgress>>,
    pub missing_calls: Mutex<Vec<MissingTiles>>,
    pub error_calls: Mutex<Vec<String>>,
}

impl ScriptedDecisions {
    /// Retry answers are consumed in order; the last one repeats.
    pub fn new(retry: Vec<RetryDecision>) -> Self {
        Self {
            retry: Mutex::new(retry),
            missing: MissingTilesDecision::Proceed,
            map_error: MapErrorDecision::Abort,
            ignore_errors: false,
            retry_calls: Mutex::new(Vec::new()),
            missing_calls: Mutex::new(Vec::new()),
            error_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_missing(mut self, decision: MissingTilesDecision) -> Self {
        self.missing = decision;
        self
    }

    pub fn with_map_error(mut self, decision: MapErrorDecision) -> Self {
        self.map_error = decision;
        self
    }

    pub fn ignoring_errors(mut self) -> Self {
        self.ignore_errors = true;
        self
    }

    pub fn retry_call_count(&self) -> usize {
        self.retry_calls.lock().expect("retry calls lock").len()
    }

    pub fn missing_call_count(&self) -> usize {
        self.missing_calls.lock().expect("missing calls lock").len()
    }
}

impl DecisionHandler for ScriptedDecisions {
    fn on_retry_threshold(&self, progress: &MapProgress) -> RetryDecision {
        self.retry_calls
            .lock()
            .expect("retry calls lock")
            .push(progress.clone());
        let mut script = self.retry.lock().expect("retry script lock");
        if script.len() > 1 {
            script.remove(0)
        } else {
            script.first().copied().unwrap_or_default()
        }
    }

    fn on_missing_tiles(&self, missing: &MissingTiles) -> MissingTilesDecision {
        self.missing_calls
            .lock()
            .expect("missing calls lock")
            .push(missing.clone());
        self.missing
    }

    fn on_map_error(&self, _map: &str, error: &TesseraError) -> MapErrorDecision {
        self.error_calls
            .lock()
            .expect("error calls lock")
            .push(error.to_string());
        self.map_error
    }

    fn ignore_download_errors(&self) -> bool {
        self.ignore_errors
    }
}

/// Builder that copies every tile of every map into memory.
#[derive(Default)]
pub struct CollectingBuilder {
    pub layers: Vec<String>,
    pub maps: Vec<String>,
    pub tiles: HashMap<(String, TileCoord), Bytes>,
    pub finished_atlas: bool,
    pub aborted: bool,
    pub reject_file_based: bool,
}

impl CollectingBuilder {
    pub fn tiles_of(&self, map: &str) -> usize {
        self.tiles.keys().filter(|(name, _)| name == map).count()
    }
}

impl MapBuilder for CollectingBuilder {
    fn supports_source(&self, source: &dyn TileSource) -> bool {
        !(self.reject_file_based && source.is_file_based())
    }

    fn begin_layer(&mut self, layer: &tessera_core::LayerSpec) -> tessera_core::Result<()> {
        self.layers.push(layer.name.clone());
        Ok(())
    }

    fn build_map(&mut self, map: &MapSpec, tiles: &dyn TileProvider) -> tessera_core::Result<()> {
        self.maps.push(map.name.clone());
        for coord in map.coords() {
            if let Some(data) = tiles.tile(coord)? {
                self.tiles.insert((map.name.clone(), coord), data);
            }
        }
        Ok(())
    }

    fn finish_atlas(&mut self) -> tessera_core::Result<()> {
        self.finished_atlas = true;
        Ok(())
    }

    fn abort(&mut self) {
        self.aborted = true;
    }
}

/// Leftover `.tsra` files in `dir`.
pub fn archive_files(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                .filter(|path| path.extension().is_some_and(|ext| ext == "tsra"))
                .collect()
        })
        .unwrap_or_default()
}
