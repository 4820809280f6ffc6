//! Remap Events
//!
//! Events emitted while remapping, for external consumers (metrics,
//! audit logging) to react to migration progress.

use crate::domain::ports::ReclaimPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted by the orchestrator and coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RemapEvent {
    /// A claim was cloned under its expected identity
    ClaimCloned {
        instance: String,
        from: String,
        to: String,
    },

    /// The expected claim already existed and was kept
    CloneSkipped { instance: String, claim: String },

    /// A volume's reclaim policy was changed
    ReclaimPolicyChanged {
        volume: String,
        from: ReclaimPolicy,
        to: ReclaimPolicy,
    },

    /// An instance pod was recreated with rewritten claim references
    PodRecreated { pod: String },

    /// An old claim was removed
    StaleClaimRemoved { instance: String, claim: String },

    /// All of an instance's claims follow the naming policy
    InstanceRemapped { instance: String },

    /// The primary was skipped until the replicas are migrated
    PrimaryDeferred { instance: String },

    /// An instance's pass failed
    InstanceRemapFailed { instance: String, reason: String },

    /// The claim inventory could not be classified
    InventoryRejected { reason: String },

    /// The switchover workflow was invoked for the primary
    SwitchoverRequested { pod: String, done: bool },
}

impl RemapEvent {
    /// Short machine-friendly name
    pub fn kind(&self) -> &'static str {
        match self {
            RemapEvent::ClaimCloned { .. } => "claim_cloned",
            RemapEvent::CloneSkipped { .. } => "clone_skipped",
            RemapEvent::ReclaimPolicyChanged { .. } => "reclaim_policy_changed",
            RemapEvent::PodRecreated { .. } => "pod_recreated",
            RemapEvent::StaleClaimRemoved { .. } => "stale_claim_removed",
            RemapEvent::InstanceRemapped { .. } => "instance_remapped",
            RemapEvent::PrimaryDeferred { .. } => "primary_deferred",
            RemapEvent::InstanceRemapFailed { .. } => "instance_remap_failed",
            RemapEvent::InventoryRejected { .. } => "inventory_rejected",
            RemapEvent::SwitchoverRequested { .. } => "switchover_requested",
        }
    }
}

/// Timestamped event as delivered to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemapEventRecord {
    pub at: DateTime<Utc>,
    pub event: RemapEvent,
}

/// Broadcast sink shared by the remap components
#[derive(Debug, Clone)]
pub struct RemapEvents {
    sender: broadcast::Sender<RemapEventRecord>,
}

impl Default for RemapEvents {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl RemapEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<RemapEventRecord> {
        self.sender.subscribe()
    }

    /// Publish an event; dropped silently when nobody listens
    pub fn emit(&self, event: RemapEvent) {
        let _ = self.sender.send(RemapEventRecord {
            at: Utc::now(),
            event,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscribers() {
        let events = RemapEvents::default();
        let mut rx = events.subscribe();

        events.emit(RemapEvent::PodRecreated { pod: "pg-2".into() });

        let record = rx.recv().await.unwrap();
        assert_eq!(record.event.kind(), "pod_recreated");
    }

    #[test]
    fn test_emit_without_subscribers() {
        let events = RemapEvents::new(4);
        events.emit(RemapEvent::InstanceRemapped {
            instance: "pg-1".into(),
        });
    }
}
