use std::time::Duration;

use crate::pipeline::MapOutcome;
use crate::types::TileCoord;

/// Counters of one map pass as seen by a progress display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapProgress {
    pub map: String,
    /// Distinct tiles the map covers.
    pub tiles_total: u64,
    /// Jobs that reached a final status: success, absence or permanent failure.
    pub tiles_completed: u64,
    /// Tiles handed to the sink.
    pub tiles_archived: u64,
    pub permanent_failures: u64,
    /// Retryable failures recorded during this pass, including ones that
    /// later succeeded.
    pub retryable_errors: u64,
    /// Time since the pass started.
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    AtlasStarted {
        atlas: String,
        maps: usize,
        online_tiles: u64,
    },
    LayerStarted {
        layer: String,
    },
    MapStarted {
        layer: String,
        map: String,
        tiles_total: u64,
        pass: u32,
    },
    TileCompleted {
        coord: TileCoord,
        progress: MapProgress,
    },
    RetryThresholdReached(MapProgress),
    MapAssembling {
        map: String,
        tiles_archived: u64,
    },
    MapFinished {
        map: String,
        outcome: MapOutcome,
    },
    LayerFinished {
        layer: String,
    },
    AtlasFinished {
        atlas: String,
        elapsed: Duration,
    },
}

/// Receives progress from the orchestrator thread and from workers.
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn on_event(&self, _event: &ProgressEvent) {}
}
