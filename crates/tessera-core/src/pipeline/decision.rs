use crate::error::TesseraError;
use crate::telemetry::MapProgress;

/// Answer to "too many retryable errors on this map".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryDecision {
    /// Resume downloading and keep counting.
    #[default]
    Continue,
    /// Discard the partial archive and download the map again.
    Retry,
    /// Discard the partial archive and move on to the next map.
    Skip,
    /// Stop the whole atlas.
    Abort,
}

/// Answer to "the finished archive lacks some tiles".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingTilesDecision {
    #[default]
    Proceed,
    Skip,
    Abort,
}

/// Answer to "this map failed with a fatal error".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapErrorDecision {
    Continue,
    #[default]
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingTiles {
    pub map: String,
    /// Distinct tiles the map covers.
    pub expected: u64,
    /// Tiles present in the finalized archive.
    pub archived: u64,
    /// Tiles that failed without retry or ran out of retries.
    pub permanent_failures: u64,
}

impl MissingTiles {
    pub fn missing(&self) -> u64 {
        self.expected.saturating_sub(self.archived)
    }
}

/// Synchronous decision points of an atlas run.
///
/// Each hook is called on the orchestrator thread and blocks it until it
/// returns, so an interactive implementation can prompt the user there.
pub trait DecisionHandler: Send + Sync {
    fn on_retry_threshold(&self, progress: &MapProgress) -> RetryDecision;

    fn on_missing_tiles(&self, _missing: &MissingTiles) -> MissingTilesDecision {
        MissingTilesDecision::Proceed
    }

    fn on_map_error(&self, _map: &str, _error: &TesseraError) -> MapErrorDecision {
        MapErrorDecision::Abort
    }

    /// Suppresses both download-error prompts when true.
    fn ignore_download_errors(&self) -> bool {
        false
    }
}

/// Fixed answers for unattended runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessPolicy {
    pub on_retry_threshold: RetryDecision,
    pub on_missing_tiles: MissingTilesDecision,
    pub on_map_error: MapErrorDecision,
    pub ignore_download_errors: bool,
}

impl HeadlessPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_decision(mut self, decision: RetryDecision) -> Self {
        self.on_retry_threshold = decision;
        self
    }

    pub fn with_missing_tiles_decision(mut self, decision: MissingTilesDecision) -> Self {
        self.on_missing_tiles = decision;
        self
    }

    pub fn with_map_error_decision(mut self, decision: MapErrorDecision) -> Self {
        self.on_map_error = decision;
        self
    }

    pub fn ignoring_download_errors(mut self) -> Self {
        self.ignore_download_errors = true;
        self
    }
}

impl DecisionHandler for HeadlessPolicy {
    fn on_retry_threshold(&self, _progress: &MapProgress) -> RetryDecision {
        self.on_retry_threshold
    }

    fn on_missing_tiles(&self, _missing: &MissingTiles) -> MissingTilesDecision {
        self.on_missing_tiles
    }

    fn on_map_error(&self, _map: &str, _error: &TesseraError) -> MapErrorDecision {
        self.on_map_error
    }

    fn ignore_download_errors(&self) -> bool {
        self.ignore_download_errors
    }
}
