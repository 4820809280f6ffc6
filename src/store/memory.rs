//! In-Memory Object Store
//!
//! Mirrors the API server semantics the remap logic depends on: resource
//! versions, create-rejects-resourceVersion, delete preconditions,
//! finalizers holding deleted claims and graceful pod termination. Every
//! mutation is journaled and faults can be armed per operation for
//! failure-path testing.

use crate::domain::ports::{
    CreateOutcome, DeleteOutcome, ObjectKey, ObjectStore, PatchOutcome, ReclaimPolicy,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use parking_lot::RwLock;
use std::collections::BTreeMap;

// =============================================================================
// Journal & Faults
// =============================================================================

/// A mutation applied to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    CreateClaim(ObjectKey),
    DeleteClaim(ObjectKey),
    PatchVolume { name: String, policy: ReclaimPolicy },
    CreatePod(ObjectKey),
    DeletePod(ObjectKey),
    PatchPodLabels(ObjectKey),
}

/// A one-shot failure armed on a specific operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    CreateClaim(String),
    DeleteClaim(String),
    PatchVolume(String),
    CreatePod(String),
    DeletePod(String),
    /// Reclaim-policy patch answered with a conflict
    VolumeConflict(String),
}

/// How deleted pods leave the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PodTermination {
    /// Removed by the delete call
    #[default]
    Immediate,
    /// Terminating until the n-th read of the pod, which no longer sees it
    AfterReads(u32),
    /// Terminating until [`MemoryStore::finish_pod_termination`]
    Held,
}

#[derive(Default)]
struct State {
    claims: BTreeMap<ObjectKey, PersistentVolumeClaim>,
    volumes: BTreeMap<String, PersistentVolume>,
    pods: BTreeMap<ObjectKey, Pod>,
    pod_termination: PodTermination,
    /// Remaining reads per terminating pod; `None` while held
    terminating: BTreeMap<ObjectKey, Option<u32>>,
    next_version: u64,
    journal: Vec<StoreOp>,
    faults: Vec<Fault>,
}

impl State {
    fn bump(&mut self, meta: &mut ObjectMeta) {
        self.next_version += 1;
        meta.resource_version = Some(self.next_version.to_string());
    }

    fn take_fault(&mut self, fault: &Fault) -> bool {
        match self.faults.iter().position(|f| f == fault) {
            Some(index) => {
                self.faults.remove(index);
                true
            }
            None => false,
        }
    }

    fn tick_termination(&mut self, key: &ObjectKey) {
        let Some(Some(remaining)) = self.terminating.get_mut(key) else {
            return;
        };
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.terminating.remove(key);
            self.pods.remove(key);
        }
    }
}

fn key_of(meta: &ObjectMeta) -> ObjectKey {
    ObjectKey::new(
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

fn matches_selector(meta: &ObjectMeta, selector: &str) -> bool {
    let labels = meta.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|term| !term.trim().is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k.trim()).map(String::as_str) == Some(v.trim()),
            None => labels.contains_key(term.trim()),
        })
}

fn has_finalizers(meta: &ObjectMeta) -> bool {
    meta.finalizers.as_ref().is_some_and(|f| !f.is_empty())
}

fn precondition_holds(meta: &ObjectMeta, resource_version: Option<&str>) -> bool {
    resource_version.map_or(true, |rv| meta.resource_version.as_deref() == Some(rv))
}

// =============================================================================
// Memory Store
// =============================================================================

/// In-process object store
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a claim, bypassing the journal
    pub fn insert_claim(&self, mut claim: PersistentVolumeClaim) {
        let mut state = self.state.write();
        state.bump(&mut claim.metadata);
        state.claims.insert(key_of(&claim.metadata), claim);
    }

    /// Seed a volume, bypassing the journal
    pub fn insert_volume(&self, mut volume: PersistentVolume) {
        let mut state = self.state.write();
        state.bump(&mut volume.metadata);
        let name = volume.metadata.name.clone().unwrap_or_default();
        state.volumes.insert(name, volume);
    }

    /// Seed a pod, bypassing the journal
    pub fn insert_pod(&self, mut pod: Pod) {
        let mut state = self.state.write();
        state.bump(&mut pod.metadata);
        state.pods.insert(key_of(&pod.metadata), pod);
    }

    /// Change a claim's binding phase as the volume binder would
    pub fn set_claim_phase(&self, key: &ObjectKey, phase: &str) {
        let mut state = self.state.write();
        state.next_version += 1;
        let version = state.next_version.to_string();
        if let Some(claim) = state.claims.get_mut(key) {
            claim.status.get_or_insert_with(Default::default).phase = Some(phase.to_string());
            claim.metadata.resource_version = Some(version);
        }
    }

    /// Drop all finalizers from a claim, completing a pending deletion
    pub fn clear_claim_finalizers(&self, key: &ObjectKey) {
        let mut state = self.state.write();
        let terminating = match state.claims.get_mut(key) {
            Some(claim) => {
                claim.metadata.finalizers = None;
                claim.metadata.deletion_timestamp.is_some()
            }
            None => false,
        };
        if terminating {
            state.claims.remove(key);
        }
    }

    /// Choose how later pod deletes complete
    pub fn set_pod_termination(&self, mode: PodTermination) {
        self.state.write().pod_termination = mode;
    }

    /// Complete the termination of a deleted pod
    pub fn finish_pod_termination(&self, key: &ObjectKey) {
        let mut state = self.state.write();
        if state.terminating.remove(key).is_some() {
            state.pods.remove(key);
        }
    }

    /// Arm a one-shot failure
    pub fn inject(&self, fault: Fault) {
        self.state.write().faults.push(fault);
    }

    /// Mutations applied so far
    pub fn journal(&self) -> Vec<StoreOp> {
        self.state.read().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.state.write().journal.clear();
    }

    pub fn claim_names(&self, namespace: &str) -> Vec<String> {
        self.state
            .read()
            .claims
            .keys()
            .filter(|k| k.namespace == namespace)
            .map(|k| k.name.clone())
            .collect()
    }

    pub fn claim(&self, key: &ObjectKey) -> Option<PersistentVolumeClaim> {
        self.state.read().claims.get(key).cloned()
    }

    pub fn volume(&self, name: &str) -> Option<PersistentVolume> {
        self.state.read().volumes.get(name).cloned()
    }

    pub fn pod(&self, key: &ObjectKey) -> Option<Pod> {
        self.state.read().pods.get(key).cloned()
    }

    pub fn claims(&self) -> Vec<PersistentVolumeClaim> {
        self.state.read().claims.values().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_claim(&self, key: &ObjectKey) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.state.read().claims.get(key).cloned())
    }

    async fn list_claims(&self, namespace: &str, selector: &str) -> Result<Vec<PersistentVolumeClaim>> {
        Ok(self
            .state
            .read()
            .claims
            .iter()
            .filter(|(k, c)| k.namespace == namespace && matches_selector(&c.metadata, selector))
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<CreateOutcome> {
        let key = key_of(&claim.metadata);
        let mut state = self.state.write();
        if state.take_fault(&Fault::CreateClaim(key.name.clone())) {
            return Err(Error::store("create", format!("PersistentVolumeClaim/{}", key), "injected fault"));
        }
        if claim.metadata.resource_version.is_some() {
            return Err(Error::store(
                "create",
                format!("PersistentVolumeClaim/{}", key),
                "resourceVersion should not be set on objects to be created",
            ));
        }
        if state.claims.contains_key(&key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        let mut claim = claim.clone();
        claim.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        state.bump(&mut claim.metadata);
        state.claims.insert(key.clone(), claim);
        state.journal.push(StoreOp::CreateClaim(key));
        Ok(CreateOutcome::Created)
    }

    async fn delete_claim(
        &self,
        key: &ObjectKey,
        resource_version: Option<&str>,
    ) -> Result<DeleteOutcome> {
        let mut state = self.state.write();
        if state.take_fault(&Fault::DeleteClaim(key.name.clone())) {
            return Err(Error::store("delete", format!("PersistentVolumeClaim/{}", key), "injected fault"));
        }
        let Some(claim) = state.claims.get_mut(key) else {
            return Ok(DeleteOutcome::NotFound);
        };
        if !precondition_holds(&claim.metadata, resource_version) {
            return Ok(DeleteOutcome::Conflict);
        }
        if has_finalizers(&claim.metadata) {
            claim
                .metadata
                .deletion_timestamp
                .get_or_insert_with(|| Time(chrono::Utc::now()));
            state.journal.push(StoreOp::DeleteClaim(key.clone()));
            return Ok(DeleteOutcome::Pending);
        }
        state.claims.remove(key);
        state.journal.push(StoreOp::DeleteClaim(key.clone()));
        Ok(DeleteOutcome::Deleted)
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.state.read().volumes.get(name).cloned())
    }

    async fn patch_reclaim_policy(
        &self,
        name: &str,
        policy: ReclaimPolicy,
        resource_version: Option<&str>,
    ) -> Result<PatchOutcome> {
        let mut state = self.state.write();
        if state.take_fault(&Fault::PatchVolume(name.to_string())) {
            return Err(Error::store("patch", format!("PersistentVolume/{}", name), "injected fault"));
        }
        if state.take_fault(&Fault::VolumeConflict(name.to_string())) {
            return Ok(PatchOutcome::Conflict);
        }
        state.next_version += 1;
        let version = state.next_version.to_string();
        let Some(volume) = state.volumes.get_mut(name) else {
            return Err(Error::ResourceNotFound {
                kind: "PersistentVolume".into(),
                name: name.into(),
            });
        };
        if !precondition_holds(&volume.metadata, resource_version) {
            return Ok(PatchOutcome::Conflict);
        }
        volume
            .spec
            .get_or_insert_with(Default::default)
            .persistent_volume_reclaim_policy = Some(policy.as_str().to_string());
        volume.metadata.resource_version = Some(version);
        state.journal.push(StoreOp::PatchVolume {
            name: name.to_string(),
            policy,
        });
        Ok(PatchOutcome::Patched)
    }

    async fn get_pod(&self, key: &ObjectKey) -> Result<Option<Pod>> {
        let mut state = self.state.write();
        state.tick_termination(key);
        Ok(state.pods.get(key).cloned())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        Ok(self
            .state
            .read()
            .pods
            .iter()
            .filter(|(k, p)| k.namespace == namespace && matches_selector(&p.metadata, selector))
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn create_pod(&self, pod: &Pod) -> Result<CreateOutcome> {
        let key = key_of(&pod.metadata);
        let mut state = self.state.write();
        if state.take_fault(&Fault::CreatePod(key.name.clone())) {
            return Err(Error::store("create", format!("Pod/{}", key), "injected fault"));
        }
        if pod.metadata.resource_version.is_some() {
            return Err(Error::store(
                "create",
                format!("Pod/{}", key),
                "resourceVersion should not be set on objects to be created",
            ));
        }
        if state.pods.contains_key(&key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        let mut pod = pod.clone();
        state.bump(&mut pod.metadata);
        state.pods.insert(key.clone(), pod);
        state.journal.push(StoreOp::CreatePod(key));
        Ok(CreateOutcome::Created)
    }

    async fn delete_pod(&self, key: &ObjectKey, resource_version: Option<&str>) -> Result<DeleteOutcome> {
        let mut state = self.state.write();
        if state.take_fault(&Fault::DeletePod(key.name.clone())) {
            return Err(Error::store("delete", format!("Pod/{}", key), "injected fault"));
        }
        let Some(pod) = state.pods.get(key) else {
            return Ok(DeleteOutcome::NotFound);
        };
        if !precondition_holds(&pod.metadata, resource_version) {
            return Ok(DeleteOutcome::Conflict);
        }
        let mode = state.pod_termination;
        let remaining = match mode {
            PodTermination::Immediate => {
                state.pods.remove(key);
                state.journal.push(StoreOp::DeletePod(key.clone()));
                return Ok(DeleteOutcome::Deleted);
            }
            PodTermination::AfterReads(reads) => Some(reads.max(1)),
            PodTermination::Held => None,
        };
        if !state.terminating.contains_key(key) {
            if let Some(pod) = state.pods.get_mut(key) {
                pod.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            }
            state.terminating.insert(key.clone(), remaining);
            state.journal.push(StoreOp::DeletePod(key.clone()));
        }
        Ok(DeleteOutcome::Pending)
    }

    async fn patch_pod_labels(
        &self,
        key: &ObjectKey,
        labels: &BTreeMap<String, String>,
    ) -> Result<PatchOutcome> {
        let mut state = self.state.write();
        state.next_version += 1;
        let version = state.next_version.to_string();
        let Some(pod) = state.pods.get_mut(key) else {
            return Err(Error::ResourceNotFound {
                kind: "Pod".into(),
                name: key.to_string(),
            });
        };
        pod.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels.clone());
        pod.metadata.resource_version = Some(version);
        state.journal.push(StoreOp::PatchPodLabels(key.clone()));
        Ok(PatchOutcome::Patched)
    }
}
