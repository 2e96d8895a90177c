pub mod archive;
pub mod config;
pub mod core;
pub mod error;
pub mod format;
pub mod pipeline;
pub mod source;
pub mod telemetry;
pub mod types;

pub use archive::{IndexedTileArchive, TileIndex, TileSink};
pub use config::{DownloadConfig, HttpOptions};
pub use core::{GateStatus, JobListener, JobScope, PauseResumeGate, SubmitOutcome, WorkerPool};
pub use error::{FailureClass, FetchError, TesseraError};
pub use pipeline::{
    AtlasController, AtlasCreationOrchestrator, AtlasReport, AtlasSpec, DecisionHandler,
    HeadlessPolicy, JobProducer, LayerSpec, MapBuilder, MapOutcome, MapReport, MapSpec,
    TileProvider,
};
pub use source::{TileCache, TileSource, TileSourceResolver};
pub use telemetry::worker::{DefaultWorkerTelemetry, WorkerTelemetry};
pub use types::{
    DownloadJob, JobOutcome, JobStatus, LoadMethod, MAX_ZOOM, Result, TileCoord, TileRange,
};
