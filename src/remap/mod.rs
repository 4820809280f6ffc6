//! Live PVC identity remapping
//!
//! - [`plan`]: classifies the claim inventory into per-instance refs
//! - [`executor`]: idempotent store primitives
//! - [`orchestrator`]: migrates one instance
//! - [`coordinator`]: drives a whole cluster, replicas before the primary
//! - [`events`]: progress events

pub mod coordinator;
pub mod events;
pub mod executor;
pub mod orchestrator;
pub mod plan;

pub use coordinator::{ClusterRemapCoordinator, RemapSummary, SWITCHOVER_REASON};
pub use events::{RemapEvent, RemapEventRecord, RemapEvents};
pub use executor::{
    CloneOutcome, DeletionOutcome, ExecutorConfig, ProtectionWindow, RemapExecutor,
};
pub use orchestrator::{InstanceOrchestrator, RemapOutcome};
pub use plan::{
    classify, mounted_claims, InstanceVolumeRef, RemapBatch, RemapPlan, VolumeKind,
    VolumeMigrationState,
};
