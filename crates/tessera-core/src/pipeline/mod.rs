pub mod builder;
pub mod decision;
pub mod job;
pub mod map;
pub mod orchestrator;
pub mod producer;

pub use builder::{ArchiveTileProvider, MapBuilder, SourceTileProvider, TileProvider};
pub use decision::{
    DecisionHandler, HeadlessPolicy, MapErrorDecision, MissingTiles, MissingTilesDecision,
    RetryDecision,
};
pub use job::MapCounters;
pub use map::{AtlasSpec, LayerSpec, MapSpec};
pub use orchestrator::{
    AtlasController, AtlasCreationOrchestrator, AtlasReport, MapOutcome, MapReport,
    OrchestratorState,
};
pub use producer::{JobProducer, ProducerSummary};
