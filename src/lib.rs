//! PVC Remap Operator
//!
//! Migrates the persistent volume claims of a replicated database cluster
//! from one naming scheme to another while the cluster keeps serving.
//! Every pass is idempotent and safe to interrupt at any point.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 Cluster Remap Coordinator                    │
//! │     replicas first, primary deferred to the switchover       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌────────────────┐  ┌──────────────────┐  ┌──────────────┐  │
//! │  │  Plan Resolver │  │    Instance      │  │  Switchover  │  │
//! │  │   (classify)   │  │   Orchestrator   │  │   Workflow   │  │
//! │  └────────────────┘  └────────┬─────────┘  └──────────────┘  │
//! │                               │                              │
//! │                    ┌──────────┴──────────┐                   │
//! │                    │   Remap Executor    │                   │
//! │                    └──────────┬──────────┘                   │
//! ├───────────────────────────────┼──────────────────────────────┤
//! │                       Object Store port                      │
//! │       ┌─────────────────┐          ┌─────────────────┐       │
//! │       │    KubeStore    │          │   MemoryStore   │       │
//! │       └─────────────────┘          └─────────────────┘       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`remap`]: plan resolution, executor, orchestrator and coordinator
//! - [`store`]: object store adapters
//! - [`switchover`]: role-label switchover workflow
//! - [`domain`]: ports and shared types
//! - [`config`]: naming policy, labels and tuning
//! - [`metrics`]: Prometheus metrics
//! - [`error`]: Error types and handling

pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod remap;
pub mod store;
pub mod switchover;

// Re-export commonly used types
pub use config::{LabelConfig, NamingPolicy, OperatorConfig};

pub use domain::ports::{
    ClusterRef, InstanceStatus, ObjectKey, ObjectStore, ObjectStoreRef, ReclaimPolicy,
    SwitchoverWorkflow, SwitchoverWorkflowRef,
};

pub use error::{Error, ErrorAction, Result};

pub use metrics::RemapMetrics;

pub use remap::{
    classify, ClusterRemapCoordinator, InstanceOrchestrator, InstanceVolumeRef, RemapEvent,
    RemapEvents, RemapExecutor, RemapOutcome, RemapPlan, RemapSummary, VolumeKind,
};

pub use store::{KubeStore, MemoryStore};

pub use switchover::RoleLabelSwitchover;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
