//! Remap Plan Resolver
//!
//! Classifies the raw claim inventory of a cluster into per-instance,
//! per-volume-kind references carrying the current and expected claim
//! identity. The plan is a pure function of the inventory and the naming
//! policy; it is recomputed on every pass and never cached.

use crate::config::{LabelConfig, NamingPolicy};
use crate::domain::ports::ObjectKey;
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// Volume Kind
// =============================================================================

/// Role of a claim within an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    Data,
    Wal,
}

impl VolumeKind {
    /// Parse the PVC role label value
    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "data" => Some(VolumeKind::Data),
            "wal" => Some(VolumeKind::Wal),
            _ => None,
        }
    }

    /// Claim name this kind should carry under `policy`
    pub fn expected_name(&self, instance: &str, policy: &NamingPolicy) -> String {
        match self {
            VolumeKind::Data => format!("{}{}", instance, policy.data()),
            VolumeKind::Wal => format!("{}{}", instance, policy.wal()),
        }
    }
}

impl std::fmt::Display for VolumeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeKind::Data => write!(f, "data"),
            VolumeKind::Wal => write!(f, "wal"),
        }
    }
}

// =============================================================================
// Instance Volume Reference
// =============================================================================

/// Where one (instance, volume kind) pairing stands in the migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeMigrationState {
    /// Current identity matches the policy, nothing left behind
    Settled,
    /// The claim still needs to be cloned under its expected identity
    PendingClone,
    /// The pod already uses the expected claim; the old one is still around
    PendingCleanup { leftover: String },
}

/// One (instance, volume kind) pairing with its current and expected identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceVolumeRef {
    pub namespace: String,
    pub instance: String,
    pub kind: VolumeKind,
    /// Claim currently backing this pairing
    pub current: String,
    /// Claim name under the active naming policy
    pub expected: String,
    /// Backing persistent volume, if bound
    pub volume_name: Option<String>,
    /// Old claim still present after the pod moved to `expected`
    pub leftover: Option<String>,
    /// A claim named `expected` already exists next to `current`
    pub target_present: bool,
}

impl InstanceVolumeRef {
    pub fn remap_required(&self) -> bool {
        self.current != self.expected
    }

    pub fn needs_action(&self) -> bool {
        self.remap_required() || self.leftover.is_some()
    }

    pub fn state(&self) -> VolumeMigrationState {
        match (&self.leftover, self.remap_required()) {
            (_, true) => VolumeMigrationState::PendingClone,
            (Some(leftover), false) => VolumeMigrationState::PendingCleanup {
                leftover: leftover.clone(),
            },
            (None, false) => VolumeMigrationState::Settled,
        }
    }

    pub fn current_key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.current)
    }

    pub fn expected_key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.expected)
    }

    /// Claim that has to disappear once this pairing is migrated
    pub fn stale_key(&self) -> Option<ObjectKey> {
        match self.state() {
            VolumeMigrationState::PendingClone => Some(self.current_key()),
            VolumeMigrationState::PendingCleanup { leftover } => {
                Some(ObjectKey::new(&self.namespace, leftover))
            }
            VolumeMigrationState::Settled => None,
        }
    }

    /// Reconcile the claim-only view with what the pod actually mounts
    ///
    /// When both identities exist and the pod already mounts the expected
    /// one, clone and swap happened on an earlier pass and only the old
    /// claim is left to remove.
    pub fn settle(&self, mounted: &BTreeSet<String>) -> Self {
        if self.target_present
            && self.remap_required()
            && mounted.contains(&self.expected)
            && !mounted.contains(&self.current)
        {
            Self {
                current: self.expected.clone(),
                leftover: Some(self.current.clone()),
                ..self.clone()
            }
        } else {
            self.clone()
        }
    }
}

/// Claim names mounted by a pod
pub fn mounted_claims(pod: &Pod) -> BTreeSet<String> {
    pod.spec
        .iter()
        .flat_map(|spec| spec.volumes.iter().flatten())
        .filter_map(|v| v.persistent_volume_claim.as_ref())
        .map(|source| source.claim_name.clone())
        .collect()
}

// =============================================================================
// Remap Batch
// =============================================================================

/// The refs of one instance that need action in the current pass
#[derive(Debug, Clone, Default)]
pub struct RemapBatch {
    refs: Vec<InstanceVolumeRef>,
}

impl RemapBatch {
    /// Filter `refs` to `pod`'s instance, settle them against its mounts,
    /// and keep only those needing action
    pub fn for_pod(pod: &Pod, refs: &[InstanceVolumeRef]) -> Self {
        let instance = pod.metadata.name.as_deref().unwrap_or_default();
        let mounted = mounted_claims(pod);
        Self {
            refs: refs
                .iter()
                .filter(|r| r.instance == instance)
                .map(|r| r.settle(&mounted))
                .filter(InstanceVolumeRef::needs_action)
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn refs(&self) -> &[InstanceVolumeRef] {
        &self.refs
    }

    /// Whether any claim still has to be cloned, which means the pod must
    /// be recreated
    pub fn requires_pod_swap(&self) -> bool {
        self.refs.iter().any(InstanceVolumeRef::remap_required)
    }

    /// current → expected renames for every ref still pending a clone
    pub fn renames(&self) -> BTreeMap<String, String> {
        self.refs
            .iter()
            .filter(|r| r.remap_required())
            .map(|r| (r.current.clone(), r.expected.clone()))
            .collect()
    }
}

// =============================================================================
// Remap Plan
// =============================================================================

/// Classified claim inventory, keyed by instance name
#[derive(Debug, Clone, Default)]
pub struct RemapPlan {
    instances: BTreeMap<String, Vec<InstanceVolumeRef>>,
}

impl RemapPlan {
    /// Instance names in deterministic order
    pub fn instances(&self) -> impl Iterator<Item = &str> {
        self.instances.keys().map(String::as_str)
    }

    pub fn for_instance(&self, instance: &str) -> &[InstanceVolumeRef] {
        self.instances
            .get(instance)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// All refs, instance by instance
    pub fn refs(&self) -> impl Iterator<Item = &InstanceVolumeRef> {
        self.instances.values().flatten()
    }

    /// Number of refs in the plan
    pub fn len(&self) -> usize {
        self.instances.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn remap_required(&self) -> usize {
        self.refs().filter(|r| r.remap_required()).count()
    }
}

fn label<'a>(claim: &'a PersistentVolumeClaim, key: &str) -> Option<&'a str> {
    claim
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .map(String::as_str)
}

fn volume_name(claim: &PersistentVolumeClaim) -> Option<String> {
    claim
        .spec
        .as_ref()
        .and_then(|spec| spec.volume_name.clone())
        .filter(|name| !name.is_empty())
}

/// Classify `claims` under `policy`
pub fn classify(
    claims: &[PersistentVolumeClaim],
    policy: &NamingPolicy,
    labels: &LabelConfig,
) -> Result<RemapPlan> {
    let mut grouped: BTreeMap<(String, VolumeKind), Vec<&PersistentVolumeClaim>> = BTreeMap::new();

    for claim in claims {
        let name = claim.metadata.name.as_deref().unwrap_or_default();
        let malformed = |reason: String| Error::MalformedInventory {
            claim: name.to_string(),
            reason,
        };
        let instance = label(claim, &labels.instance_name)
            .ok_or_else(|| malformed(format!("missing label {}", labels.instance_name)))?;
        let role = label(claim, &labels.pvc_role)
            .ok_or_else(|| malformed(format!("missing label {}", labels.pvc_role)))?;
        let kind = VolumeKind::from_label(role)
            .ok_or_else(|| malformed(format!("unknown PVC role {:?}", role)))?;
        grouped
            .entry((instance.to_string(), kind))
            .or_default()
            .push(claim);
    }

    let mut plan = RemapPlan::default();
    for ((instance, kind), group) in grouped {
        let expected = kind.expected_name(&instance, policy);
        let named = |c: &&PersistentVolumeClaim| c.metadata.name.as_deref() == Some(expected.as_str());

        let (current, target) = match group.as_slice() {
            [only] => (*only, None),
            [a, b] if named(a) && !named(b) => (*b, Some(*a)),
            [a, b] if named(b) && !named(a) => (*a, Some(*b)),
            _ => {
                let names: Vec<_> = group
                    .iter()
                    .filter_map(|c| c.metadata.name.clone())
                    .collect();
                return Err(Error::MalformedInventory {
                    claim: names.join(","),
                    reason: format!(
                        "cannot tell which claim backs {} volume of instance {}",
                        kind, instance
                    ),
                });
            }
        };

        let namespace = current.metadata.namespace.clone().unwrap_or_default();
        let reference = InstanceVolumeRef {
            namespace,
            instance: instance.clone(),
            kind,
            current: current.metadata.name.clone().unwrap_or_default(),
            expected,
            volume_name: volume_name(current).or_else(|| target.and_then(volume_name)),
            leftover: None,
            target_present: target.is_some(),
        };
        plan.instances.entry(instance).or_default().push(reference);
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec, Volume,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn claim(name: &str, instance: &str, role: &str, pv: &str) -> PersistentVolumeClaim {
        let labels = LabelConfig::default();
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("db".into()),
                labels: Some(BTreeMap::from([
                    (labels.instance_name.clone(), instance.to_string()),
                    (labels.pvc_role.clone(), role.to_string()),
                ])),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                volume_name: Some(pv.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod_mounting(name: &str, claims: &[&str]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                volumes: Some(
                    claims
                        .iter()
                        .map(|c| Volume {
                            name: format!("vol-{}", c),
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: c.to_string(),
                                read_only: None,
                            }),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_classify_legacy_inventory() {
        let claims = vec![
            claim("pg-1", "pg-1", "data", "pv-a"),
            claim("pg-1-wal", "pg-1", "wal", "pv-b"),
            claim("pg-2", "pg-2", "data", "pv-c"),
        ];
        let policy = NamingPolicy::new("-data2", "-wal2");
        let plan = classify(&claims, &policy, &LabelConfig::default()).unwrap();

        assert_eq!(plan.instances().collect::<Vec<_>>(), vec!["pg-1", "pg-2"]);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.remap_required(), 3);

        let refs = plan.for_instance("pg-1");
        assert_eq!(refs[0].kind, VolumeKind::Data);
        assert_eq!(refs[0].expected, "pg-1-data2");
        assert_eq!(refs[0].volume_name.as_deref(), Some("pv-a"));
        assert_eq!(refs[1].expected, "pg-1-wal2");
        assert!(plan.for_instance("pg-9").is_empty());
    }

    #[test]
    fn test_default_policy_keeps_legacy_names() {
        let claims = vec![
            claim("pg-1", "pg-1", "data", "pv-a"),
            claim("pg-1-wal", "pg-1", "wal", "pv-b"),
        ];
        let plan = classify(&claims, &NamingPolicy::default(), &LabelConfig::default()).unwrap();
        assert_eq!(plan.remap_required(), 0);
        assert!(plan.refs().all(|r| r.state() == VolumeMigrationState::Settled));
    }

    #[test]
    fn test_unlabelled_claim_is_malformed() {
        let mut stray = claim("scratch", "pg-1", "data", "pv-x");
        stray.metadata.labels = None;
        let err = classify(&[stray], &NamingPolicy::default(), &LabelConfig::default()).unwrap_err();
        assert!(matches!(err, Error::MalformedInventory { ref claim, .. } if claim == "scratch"));

        let tablespace = claim("pg-1-tbs", "pg-1", "tablespace", "pv-y");
        let err = classify(&[tablespace], &NamingPolicy::default(), &LabelConfig::default()).unwrap_err();
        assert!(matches!(err, Error::MalformedInventory { .. }));
    }

    #[test]
    fn test_two_unrelated_claims_for_same_kind_are_malformed() {
        let claims = vec![
            claim("pg-1", "pg-1", "data", "pv-a"),
            claim("pg-1-old", "pg-1", "data", "pv-b"),
        ];
        let policy = NamingPolicy::new("-data2", "-wal2");
        assert!(classify(&claims, &policy, &LabelConfig::default()).is_err());
    }

    #[test]
    fn test_interrupted_clone_then_settle() {
        let claims = vec![
            claim("pg-1", "pg-1", "data", "pv-a"),
            claim("pg-1-data2", "pg-1", "data", "pv-a"),
        ];
        let policy = NamingPolicy::new("-data2", "-wal2");
        let plan = classify(&claims, &policy, &LabelConfig::default()).unwrap();
        let reference = &plan.for_instance("pg-1")[0];
        assert_eq!(reference.current, "pg-1");
        assert!(reference.target_present);

        // Pod still on the old claim: clone must be retried
        let batch = RemapBatch::for_pod(&pod_mounting("pg-1", &["pg-1"]), plan.for_instance("pg-1"));
        assert!(batch.requires_pod_swap());
        assert_eq!(batch.refs()[0].state(), VolumeMigrationState::PendingClone);

        // Pod already swapped: only the cleanup remains
        let batch =
            RemapBatch::for_pod(&pod_mounting("pg-1", &["pg-1-data2"]), plan.for_instance("pg-1"));
        assert!(!batch.requires_pod_swap());
        let settled = &batch.refs()[0];
        assert!(!settled.remap_required());
        assert_eq!(
            settled.state(),
            VolumeMigrationState::PendingCleanup {
                leftover: "pg-1".into()
            }
        );
        assert_eq!(settled.stale_key(), Some(ObjectKey::new("db", "pg-1")));
    }

    #[test]
    fn test_batch_filters_other_instances() {
        let claims = vec![
            claim("pg-1", "pg-1", "data", "pv-a"),
            claim("pg-2", "pg-2", "data", "pv-b"),
        ];
        let policy = NamingPolicy::new("-data2", "-wal2");
        let plan = classify(&claims, &policy, &LabelConfig::default()).unwrap();
        let all: Vec<_> = plan.refs().cloned().collect();

        let batch = RemapBatch::for_pod(&pod_mounting("pg-2", &["pg-2"]), &all);
        assert_eq!(batch.len(), 1);
        assert_eq!(
            batch.renames(),
            BTreeMap::from([("pg-2".to_string(), "pg-2-data2".to_string())])
        );
    }
}
