//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PersistentVolumeSpec, Pod, PodSpec, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use parking_lot::Mutex;
use pvc_remap_operator::remap::{mounted_claims, ExecutorConfig};
use pvc_remap_operator::store::StoreOp;
use pvc_remap_operator::{
    ClusterRef, ClusterRemapCoordinator, InstanceOrchestrator, InstanceStatus, LabelConfig,
    MemoryStore, NamingPolicy, ObjectKey, ReclaimPolicy, RemapEvents, RemapExecutor, Result,
    SwitchoverWorkflow,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const NS: &str = "db";
pub const CLUSTER: &str = "pg";

pub fn cluster() -> ClusterRef {
    ClusterRef::new(NS, CLUSTER)
}

pub fn policy() -> NamingPolicy {
    NamingPolicy::new("-data2", "-wal2")
}

pub fn claim(name: &str, instance: &str, role: &str, volume: &str) -> PersistentVolumeClaim {
    let labels = LabelConfig::default();
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(NS.into()),
            labels: Some(BTreeMap::from([
                (labels.cluster.clone(), CLUSTER.to_string()),
                (labels.instance_name.clone(), instance.to_string()),
                (labels.pvc_role.clone(), role.to_string()),
            ])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            volume_name: Some(volume.into()),
            storage_class_name: Some("local-nvme".into()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn volume(name: &str, policy: ReclaimPolicy) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.into()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            persistent_volume_reclaim_policy: Some(policy.as_str().into()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn pod(name: &str, role: &str, claims: &[(&str, &str)]) -> Pod {
    let labels = LabelConfig::default();
    Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(NS.into()),
            labels: Some(BTreeMap::from([
                (labels.cluster.clone(), CLUSTER.to_string()),
                (labels.instance_name.clone(), name.to_string()),
                (labels.instance_role.clone(), role.to_string()),
            ])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            volumes: Some(
                claims
                    .iter()
                    .map(|(volume, claim)| Volume {
                        name: volume.to_string(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: claim.to_string(),
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

pub fn volume_of(claim: &str) -> String {
    format!("pv-{}", claim)
}

/// Instance with legacy claims `<instance>` and `<instance>-wal`
pub fn seed_instance(store: &MemoryStore, instance: &str, role: &str) {
    let data = instance.to_string();
    let wal = format!("{}-wal", instance);
    for (name, kind) in [(&data, "data"), (&wal, "wal")] {
        store.insert_claim(claim(name, instance, kind, &volume_of(name)));
        store.insert_volume(volume(&volume_of(name), ReclaimPolicy::Delete));
    }
    store.insert_pod(pod(instance, role, &[("pgdata", &data), ("pg-wal", &wal)]));
}

pub fn mounts(store: &MemoryStore, pod: &str) -> BTreeSet<String> {
    store
        .pod(&ObjectKey::new(NS, pod))
        .map(|p| mounted_claims(&p))
        .unwrap_or_default()
}

pub fn reclaim_policy(store: &MemoryStore, volume: &str) -> ReclaimPolicy {
    ReclaimPolicy::of(&store.volume(volume).expect("volume exists"))
}

pub fn claims_named(store: &MemoryStore) -> BTreeSet<String> {
    store.claim_names(NS).into_iter().collect()
}

pub fn set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}

pub fn ready_statuses(store: &MemoryStore, pods: &[&str]) -> Vec<InstanceStatus> {
    let labels = LabelConfig::default();
    pods.iter()
        .filter_map(|name| store.pod(&ObjectKey::new(NS, *name)))
        .map(|pod| InstanceStatus {
            pod_name: pod.metadata.name.clone().unwrap_or_default(),
            is_primary: pod
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(&labels.instance_role))
                .is_some_and(|r| r == &labels.primary_role),
            is_ready: true,
            replay_lsn: Some(100),
        })
        .collect()
}

// =============================================================================
// Switchover double
// =============================================================================

#[derive(Debug, Clone)]
pub struct SwitchoverCall {
    pub candidate: String,
    pub force_failover: bool,
    pub force_switchover: bool,
    pub reason: String,
    /// Store journal at the moment of the call
    pub journal: Vec<StoreOp>,
}

/// Records every promote call and answers with a fixed result
pub struct RecordingSwitchover {
    store: Arc<MemoryStore>,
    done: bool,
    calls: Mutex<Vec<SwitchoverCall>>,
}

impl RecordingSwitchover {
    pub fn new(store: Arc<MemoryStore>, done: bool) -> Arc<Self> {
        Arc::new(Self {
            store,
            done,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<SwitchoverCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl SwitchoverWorkflow for RecordingSwitchover {
    async fn promote(
        &self,
        _cluster: &ClusterRef,
        _statuses: &[InstanceStatus],
        candidate: &Pod,
        force_failover: bool,
        force_switchover: bool,
        reason: &str,
    ) -> Result<bool> {
        self.calls.lock().push(SwitchoverCall {
            candidate: candidate.metadata.name.clone().unwrap_or_default(),
            force_failover,
            force_switchover,
            reason: reason.to_string(),
            journal: self.store.journal(),
        });
        Ok(self.done)
    }
}

// =============================================================================
// Wiring
// =============================================================================

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub events: RemapEvents,
    pub cancel: CancellationToken,
    pub orchestrator: InstanceOrchestrator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ExecutorConfig::default())
    }

    pub fn with_config(config: ExecutorConfig) -> Self {
        Self::over(Arc::new(MemoryStore::new()), config)
    }

    /// Fresh token and events over the same store, as after a restart
    pub fn resume(&self) -> Self {
        Self::over(self.store.clone(), ExecutorConfig::default())
    }

    fn over(store: Arc<MemoryStore>, config: ExecutorConfig) -> Self {
        let events = RemapEvents::default();
        let cancel = CancellationToken::new();
        let executor =
            RemapExecutor::with_config(store.clone(), cancel.clone(), events.clone(), config);
        let orchestrator = InstanceOrchestrator::new(executor, LabelConfig::default());
        Self {
            store,
            events,
            cancel,
            orchestrator,
        }
    }

    pub fn coordinator(&self, switchover: Arc<dyn SwitchoverWorkflow>) -> ClusterRemapCoordinator {
        ClusterRemapCoordinator::new(
            self.orchestrator.clone(),
            switchover,
            policy(),
            LabelConfig::default(),
        )
    }

    pub fn pod(&self, name: &str) -> Pod {
        self.store
            .pod(&ObjectKey::new(NS, name))
            .expect("pod exists")
    }
}
