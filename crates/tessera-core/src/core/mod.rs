pub mod gate;
pub mod worker_pool;

pub use gate::{GateStatus, PauseResumeGate};
pub use worker_pool::{
    JobListener, JobScope, PoolRuntimeSnapshot, PoolState, SubmitOutcome, WorkerPool,
    WorkerRuntimeSnapshot,
};
