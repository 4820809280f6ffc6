//! Domain Ports - Core trait definitions for the remap operator
//!
//! These traits define the boundaries between the remap logic and external systems.
//! Adapters implement these traits to provide concrete functionality.

use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Object Identity
// =============================================================================

/// Namespace-qualified identity of a stored object
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self::new(String::new(), name)
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Identity of the cluster being reconciled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRef {
    pub namespace: String,
    pub name: String,
}

impl ClusterRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ClusterRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// =============================================================================
// Reclaim Policy
// =============================================================================

/// Persistent volume reclaim policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReclaimPolicy {
    Retain,
    Delete,
    Recycle,
}

impl ReclaimPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReclaimPolicy::Retain => "Retain",
            ReclaimPolicy::Delete => "Delete",
            ReclaimPolicy::Recycle => "Recycle",
        }
    }

    /// Read the policy of a volume; unset means `Delete`
    pub fn of(volume: &PersistentVolume) -> Self {
        match volume
            .spec
            .as_ref()
            .and_then(|spec| spec.persistent_volume_reclaim_policy.as_deref())
        {
            Some("Retain") => ReclaimPolicy::Retain,
            Some("Recycle") => ReclaimPolicy::Recycle,
            _ => ReclaimPolicy::Delete,
        }
    }
}

impl std::fmt::Display for ReclaimPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Store Outcomes
// =============================================================================

/// Result of a create round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Result of a delete round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The object is gone
    Deleted,
    /// Deletion was accepted but the object still exists (finalizers)
    Pending,
    /// Nothing to delete
    NotFound,
    /// The resource-version precondition did not hold
    Conflict,
}

/// Result of a patch round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Patched,
    Conflict,
}

// =============================================================================
// Object Store Port
// =============================================================================

/// Port for the key-addressed store of claims, volumes and pods
///
/// Not-found is reported as `None` / `DeleteOutcome::NotFound`; conflicts
/// and already-exists are outcomes, not errors.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Get a claim
    async fn get_claim(&self, key: &ObjectKey) -> Result<Option<PersistentVolumeClaim>>;

    /// List claims in a namespace matching a label selector
    async fn list_claims(&self, namespace: &str, selector: &str) -> Result<Vec<PersistentVolumeClaim>>;

    /// Create a claim; the object must not carry a resource version
    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<CreateOutcome>;

    /// Delete a claim, optionally only if it is still at `resource_version`
    async fn delete_claim(
        &self,
        key: &ObjectKey,
        resource_version: Option<&str>,
    ) -> Result<DeleteOutcome>;

    /// Get a cluster-scoped volume
    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>>;

    /// Patch a volume's reclaim policy, optionally guarded by `resource_version`
    async fn patch_reclaim_policy(
        &self,
        name: &str,
        policy: ReclaimPolicy,
        resource_version: Option<&str>,
    ) -> Result<PatchOutcome>;

    /// Get a pod
    async fn get_pod(&self, key: &ObjectKey) -> Result<Option<Pod>>;

    /// List pods in a namespace matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    /// Create a pod; the object must not carry a resource version
    async fn create_pod(&self, pod: &Pod) -> Result<CreateOutcome>;

    /// Delete a pod, optionally only if it is still at `resource_version`
    async fn delete_pod(&self, key: &ObjectKey, resource_version: Option<&str>) -> Result<DeleteOutcome>;

    /// Merge labels into a pod
    async fn patch_pod_labels(
        &self,
        key: &ObjectKey,
        labels: &BTreeMap<String, String>,
    ) -> Result<PatchOutcome>;
}

// =============================================================================
// Switchover Port
// =============================================================================

/// Replication status of one instance as seen by the cluster reconciler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub pod_name: String,
    pub is_primary: bool,
    pub is_ready: bool,
    /// Last replayed WAL position, if known
    pub replay_lsn: Option<u64>,
}

impl InstanceStatus {
    /// Derive statuses from pod role labels and `Ready` conditions
    pub fn from_pods(pods: &[Pod], labels: &crate::config::LabelConfig) -> Vec<InstanceStatus> {
        pods.iter()
            .filter_map(|pod| {
                let name = pod.metadata.name.clone()?;
                let is_primary = pod
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(&labels.instance_role))
                    .is_some_and(|role| role == &labels.primary_role);
                let is_ready = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.conditions.as_ref())
                    .is_some_and(|conditions| {
                        conditions
                            .iter()
                            .any(|c| c.type_ == "Ready" && c.status == "True")
                    });
                Some(InstanceStatus {
                    pod_name: name,
                    is_primary,
                    is_ready,
                    replay_lsn: None,
                })
            })
            .collect()
    }
}

/// Port for the primary switchover workflow
#[async_trait]
pub trait SwitchoverWorkflow: Send + Sync {
    /// Move the primary role away from `candidate`
    ///
    /// Returns `Ok(false)` when the switchover could not complete yet and
    /// should be retried on a later pass.
    async fn promote(
        &self,
        cluster: &ClusterRef,
        statuses: &[InstanceStatus],
        candidate: &Pod,
        force_failover: bool,
        force_switchover: bool,
        reason: &str,
    ) -> Result<bool>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ObjectStoreRef = Arc<dyn ObjectStore>;
pub type SwitchoverWorkflowRef = Arc<dyn SwitchoverWorkflow>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LabelConfig;
    use k8s_openapi::api::core::v1::{PersistentVolumeSpec, PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn test_object_key_display() {
        assert_eq!(ObjectKey::new("db", "pg-1").to_string(), "db/pg-1");
        assert_eq!(ObjectKey::cluster_scoped("pv-1").to_string(), "pv-1");
    }

    #[test]
    fn test_reclaim_policy_of_volume() {
        let mut volume = PersistentVolume::default();
        assert_eq!(ReclaimPolicy::of(&volume), ReclaimPolicy::Delete);

        volume.spec = Some(PersistentVolumeSpec {
            persistent_volume_reclaim_policy: Some("Retain".into()),
            ..Default::default()
        });
        assert_eq!(ReclaimPolicy::of(&volume), ReclaimPolicy::Retain);
    }

    #[test]
    fn test_statuses_from_pods() {
        let labels = LabelConfig::default();
        let pod = |name: &str, role: &str, ready: &str| Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                labels: Some(BTreeMap::from([(labels.instance_role.clone(), role.into())])),
                ..Default::default()
            },
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".into(),
                    status: ready.into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let statuses =
            InstanceStatus::from_pods(&[pod("pg-1", "primary", "True"), pod("pg-2", "replica", "False")], &labels);
        assert_eq!(statuses.len(), 2);
        assert!(statuses[0].is_primary && statuses[0].is_ready);
        assert!(!statuses[1].is_primary && !statuses[1].is_ready);
    }
}
