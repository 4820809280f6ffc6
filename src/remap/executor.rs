//! Remap Executor
//!
//! Idempotent, re-entrant primitives the orchestrator sequences: safe claim
//! deletion, claim cloning, reclaim-policy changes and pod replacement.
//! Every destructive step re-reads the object right before acting.

use crate::domain::ports::{
    CreateOutcome, DeleteOutcome, ObjectKey, ObjectStoreRef, PatchOutcome, ReclaimPolicy,
};
use crate::error::{Error, Result};
use crate::remap::events::{RemapEvent, RemapEvents};
use crate::remap::plan::{mounted_claims, InstanceVolumeRef};
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Claim phase that marks a claim as bound to its volume
const PHASE_BOUND: &str = "Bound";

// =============================================================================
// Outcomes
// =============================================================================

/// Result of a safe claim deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionOutcome {
    /// The claim did not exist
    AlreadyGone,
    /// The claim was deleted
    Deleted,
    /// Deletion was accepted but the claim is still present
    Pending,
}

impl DeletionOutcome {
    pub fn is_gone(&self) -> bool {
        !matches!(self, DeletionOutcome::Pending)
    }
}

/// Result of cloning a claim under its expected identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneOutcome {
    /// The ref already follows the naming policy
    NotRequired,
    /// A new claim was created
    Cloned,
    /// An equivalent claim under the expected identity was kept
    AlreadyMigrated,
}

// =============================================================================
// Executor
// =============================================================================

/// Tuning for the executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on waiting for a deleted pod to disappear
    pub pod_deletion_timeout: Duration,
    /// Upper bound on retrying a release action
    pub release_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            pod_deletion_timeout: Duration::from_secs(120),
            release_timeout: Duration::from_secs(300),
        }
    }
}

fn retry_policy(bound: Duration) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(250))
        .with_max_elapsed_time(Some(bound))
        .build()
}

/// Store-facing remap primitives
#[derive(Clone)]
pub struct RemapExecutor {
    store: ObjectStoreRef,
    cancel: CancellationToken,
    events: RemapEvents,
    config: ExecutorConfig,
}

impl RemapExecutor {
    pub fn new(store: ObjectStoreRef, cancel: CancellationToken, events: RemapEvents) -> Self {
        Self::with_config(store, cancel, events, ExecutorConfig::default())
    }

    pub fn with_config(
        store: ObjectStoreRef,
        cancel: CancellationToken,
        events: RemapEvents,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            cancel,
            events,
            config,
        }
    }

    pub fn store(&self) -> &ObjectStoreRef {
        &self.store
    }

    pub fn events(&self) -> &RemapEvents {
        &self.events
    }

    /// Race a forward operation against cancellation
    async fn guarded<T>(&self, operation: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let cancelled = || Error::Cancelled {
            operation: operation.to_string(),
        };
        if self.cancel.is_cancelled() {
            return Err(cancelled());
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(cancelled()),
            result = fut => result,
        }
    }

    /// Delete a claim only if it exists and is not bound
    pub async fn safe_delete_claim(&self, key: &ObjectKey) -> Result<DeletionOutcome> {
        let Some(claim) = self.guarded("get claim", self.store.get_claim(key)).await? else {
            return Ok(DeletionOutcome::AlreadyGone);
        };
        if is_bound(&claim) {
            return Err(Error::UnsafeDeletion {
                claim: key.to_string(),
            });
        }

        let rv = claim.metadata.resource_version.as_deref();
        match self
            .guarded("delete claim", self.store.delete_claim(key, rv))
            .await?
        {
            DeleteOutcome::Deleted => {
                debug!(claim = %key, "Deleted unbound claim");
                Ok(DeletionOutcome::Deleted)
            }
            DeleteOutcome::NotFound => Ok(DeletionOutcome::AlreadyGone),
            DeleteOutcome::Pending => Ok(DeletionOutcome::Pending),
            // Changed between read and delete, possibly bound meanwhile
            DeleteOutcome::Conflict => Err(Error::Conflict {
                kind: "PersistentVolumeClaim".into(),
                name: key.to_string(),
            }),
        }
    }

    /// Clone the ref's current claim under its expected identity
    pub async fn clone_claim(&self, reference: &InstanceVolumeRef) -> Result<CloneOutcome> {
        if !reference.remap_required() {
            return Ok(CloneOutcome::NotRequired);
        }

        let source_key = reference.current_key();
        let target_key = reference.expected_key();
        let source = self
            .guarded("get claim", self.store.get_claim(&source_key))
            .await?
            .ok_or_else(|| Error::SourceMissing {
                instance: reference.instance.clone(),
                claim: source_key.to_string(),
            })?;

        match self.safe_delete_claim(&target_key).await {
            Ok(DeletionOutcome::AlreadyGone | DeletionOutcome::Deleted) => {}
            Ok(DeletionOutcome::Pending) => {
                return Err(Error::StaleResource {
                    claim: target_key.to_string(),
                    reason: "expected claim is still terminating".into(),
                });
            }
            Err(Error::UnsafeDeletion { .. }) => {
                // Occupied and in use: a previous pass got this far
                self.verify_target(&source, &target_key).await?;
                info!(
                    instance = %reference.instance,
                    claim = %target_key,
                    "Expected claim already bound, keeping it"
                );
                return Ok(CloneOutcome::AlreadyMigrated);
            }
            Err(e) => return Err(e),
        }

        let clone = clone_claim_as(&source, &reference.expected);
        match self
            .guarded("create claim", self.store.create_claim(&clone))
            .await?
        {
            CreateOutcome::Created => {
                info!(
                    instance = %reference.instance,
                    from = %source_key,
                    to = %target_key,
                    "Cloned claim under new identity"
                );
                Ok(CloneOutcome::Cloned)
            }
            CreateOutcome::AlreadyExists => {
                self.verify_target(&source, &target_key).await?;
                Ok(CloneOutcome::AlreadyMigrated)
            }
        }
    }

    /// Check that an existing target claim is the clone we would have made
    async fn verify_target(&self, source: &PersistentVolumeClaim, target_key: &ObjectKey) -> Result<()> {
        let target = self
            .guarded("get claim", self.store.get_claim(target_key))
            .await?
            .ok_or_else(|| Error::Conflict {
                kind: "PersistentVolumeClaim".into(),
                name: target_key.to_string(),
            })?;
        let mismatch = |reason: String| Error::TargetMismatch {
            target: target_key.to_string(),
            source_claim: source.metadata.name.clone().unwrap_or_default(),
            reason,
        };

        let volume = |c: &PersistentVolumeClaim| c.spec.as_ref().and_then(|s| s.volume_name.clone());
        if let (Some(want), Some(have)) = (volume(source), volume(&target)) {
            if want != have {
                return Err(mismatch(format!("bound to volume {} instead of {}", have, want)));
            }
        }
        let class = |c: &PersistentVolumeClaim| c.spec.as_ref().and_then(|s| s.storage_class_name.clone());
        if class(source) != class(&target) {
            return Err(mismatch(format!(
                "storage class {:?} instead of {:?}",
                class(&target),
                class(source)
            )));
        }
        Ok(())
    }

    /// Change a volume's reclaim policy, returning the previous one if it changed
    pub async fn set_reclaim_policy(
        &self,
        volume: &str,
        policy: ReclaimPolicy,
    ) -> Result<Option<ReclaimPolicy>> {
        self.guarded("set reclaim policy", self.apply_reclaim_policy(volume, policy))
            .await
    }

    /// Put back a policy recorded by [`set_reclaim_policy`](Self::set_reclaim_policy)
    ///
    /// Runs even after cancellation. A concurrent update of the volume is
    /// retried against a fresh read until `release_timeout`.
    pub async fn restore_reclaim_policy(&self, volume: &str, policy: ReclaimPolicy) -> Result<()> {
        let retry = retry_policy(self.config.release_timeout);
        backoff::future::retry(retry, || async move {
            match self.apply_reclaim_policy(volume, policy).await {
                Ok(_) => Ok(()),
                Err(e @ Error::Conflict { .. }) => {
                    debug!(volume, "Volume changed during restore, retrying");
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }

    async fn apply_reclaim_policy(
        &self,
        volume: &str,
        policy: ReclaimPolicy,
    ) -> Result<Option<ReclaimPolicy>> {
        if volume.is_empty() {
            return Ok(None);
        }
        let pv = self
            .store
            .get_volume(volume)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "PersistentVolume".into(),
                name: volume.into(),
            })?;
        let previous = ReclaimPolicy::of(&pv);
        if previous == policy {
            return Ok(None);
        }

        match self
            .store
            .patch_reclaim_policy(volume, policy, pv.metadata.resource_version.as_deref())
            .await?
        {
            PatchOutcome::Patched => {
                info!(volume, from = %previous, to = %policy, "Changed reclaim policy");
                self.events.emit(RemapEvent::ReclaimPolicyChanged {
                    volume: volume.to_string(),
                    from: previous,
                    to: policy,
                });
                Ok(Some(previous))
            }
            PatchOutcome::Conflict => Err(Error::Conflict {
                kind: "PersistentVolume".into(),
                name: volume.into(),
            }),
        }
    }

    /// Issue the deletion of a pod
    ///
    /// Any `Ok` means the pod is gone or on its way out and has to be
    /// recreated. `Pending` is a graceful termination; see
    /// [`wait_pod_gone`](Self::wait_pod_gone).
    pub async fn delete_pod(&self, pod: &Pod) -> Result<DeletionOutcome> {
        let key = pod_key(pod);
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled {
                operation: "delete pod".into(),
            });
        }
        // Not raced against cancellation: the request may land either way
        match self.store.delete_pod(&key, None).await? {
            DeleteOutcome::Deleted => Ok(DeletionOutcome::Deleted),
            DeleteOutcome::NotFound => Ok(DeletionOutcome::AlreadyGone),
            DeleteOutcome::Pending => Ok(DeletionOutcome::Pending),
            DeleteOutcome::Conflict => Err(Error::Conflict {
                kind: "Pod".into(),
                name: key.to_string(),
            }),
        }
    }

    /// Wait until a terminating pod is gone, up to `pod_deletion_timeout`
    pub async fn wait_pod_gone(&self, pod: &Pod) -> Result<()> {
        let key = pod_key(pod);
        let key = &key;
        let policy = retry_policy(self.config.pod_deletion_timeout);
        let wait = backoff::future::retry(policy, || async move {
            match self.store.get_pod(key).await {
                Ok(None) => Ok(()),
                Ok(Some(_)) => Err(backoff::Error::transient(Error::PodTerminating {
                    pod: key.to_string(),
                })),
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        });
        self.guarded("wait for pod deletion", wait).await
    }

    /// Create a pod from a rewritten spec
    ///
    /// Runs even after cancellation. A previous pod still holding the name is
    /// waited out until `release_timeout`; one that already mounts the same
    /// claims counts as success.
    pub async fn recreate_pod(&self, pod: &Pod) -> Result<()> {
        let key = pod_key(pod);
        let key = &key;
        let wanted = mounted_claims(pod);
        let wanted = &wanted;

        let policy = retry_policy(self.config.release_timeout);
        backoff::future::retry(policy, || async move {
            let existing = match self.store.get_pod(key).await {
                Ok(existing) => existing,
                Err(e) => return Err(backoff::Error::permanent(e)),
            };
            if let Some(existing) = existing {
                let replaced = existing.metadata.deletion_timestamp.is_none()
                    && mounted_claims(&existing) == *wanted;
                if replaced {
                    warn!(pod = %key, "Pod already recreated");
                    return Ok(());
                }
                debug!(pod = %key, "Previous pod still holds the name");
                return Err(backoff::Error::transient(Error::PodTerminating {
                    pod: key.to_string(),
                }));
            }

            match self.store.create_pod(pod).await {
                Err(e) => Err(backoff::Error::permanent(e)),
                Ok(CreateOutcome::Created) => {
                    info!(pod = %key, "Recreated pod");
                    self.events.emit(RemapEvent::PodRecreated {
                        pod: key.name.clone(),
                    });
                    Ok(())
                }
                // Raced with another writer, look again
                Ok(CreateOutcome::AlreadyExists) => {
                    Err(backoff::Error::transient(Error::PodTerminating {
                        pod: key.to_string(),
                    }))
                }
            }
        })
        .await
    }
}

// =============================================================================
// Protection Window
// =============================================================================

/// Reclaim-policy protection opened over the volumes of a batch
///
/// Every volume is switched to `Retain` at most once; [`close`](Self::close)
/// puts the recorded policies back and must run on every exit path.
#[derive(Debug, Default)]
pub struct ProtectionWindow {
    seen: BTreeSet<String>,
    restore: Vec<(String, ReclaimPolicy)>,
}

impl ProtectionWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch `volume` to `Retain` unless already handled in this window
    pub async fn protect(&mut self, executor: &RemapExecutor, volume: Option<&str>) -> Result<()> {
        let Some(volume) = volume.filter(|v| !v.is_empty()) else {
            return Ok(());
        };
        if !self.seen.insert(volume.to_string()) {
            return Ok(());
        }
        if let Some(previous) = executor
            .set_reclaim_policy(volume, ReclaimPolicy::Retain)
            .await?
        {
            self.restore.push((volume.to_string(), previous));
        }
        Ok(())
    }

    /// Volumes whose policy has to be put back
    pub fn pending_restores(&self) -> &[(String, ReclaimPolicy)] {
        &self.restore
    }

    /// Restore every recorded policy, newest first
    ///
    /// All restorations are attempted; the first failure is returned.
    pub async fn close(self, executor: &RemapExecutor) -> Result<()> {
        let mut first_error = None;
        for (volume, policy) in self.restore.into_iter().rev() {
            if let Err(e) = executor.restore_reclaim_policy(&volume, policy).await {
                warn!(volume = %volume, policy = %policy, error = %e, "Failed to restore reclaim policy");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn is_bound(claim: &PersistentVolumeClaim) -> bool {
    claim
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == PHASE_BOUND)
}

pub(crate) fn pod_key(pod: &Pod) -> ObjectKey {
    ObjectKey::new(
        pod.metadata.namespace.clone().unwrap_or_default(),
        pod.metadata.name.clone().unwrap_or_default(),
    )
}

/// Copy `source` under `name` as a fresh object
fn clone_claim_as(source: &PersistentVolumeClaim, name: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: source.metadata.namespace.clone(),
            labels: source.metadata.labels.clone(),
            annotations: source.metadata.annotations.clone(),
            owner_references: source.metadata.owner_references.clone(),
            ..Default::default()
        },
        spec: source.spec.clone(),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remap::plan::VolumeKind;
    use crate::store::{Fault, MemoryStore, PodTermination, StoreOp};
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::{
        PersistentVolume, PersistentVolumeClaimSpec, PersistentVolumeClaimStatus,
        PersistentVolumeClaimVolumeSource, PersistentVolumeSpec, PodSpec, Volume,
    };
    use std::sync::Arc;

    fn claim(name: &str, pv: &str, phase: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("db".into()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                volume_name: Some(pv.into()),
                storage_class_name: Some("fast".into()),
                ..Default::default()
            }),
            status: phase.map(|p| PersistentVolumeClaimStatus {
                phase: Some(p.into()),
                ..Default::default()
            }),
        }
    }

    fn volume(name: &str, policy: &str) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                persistent_volume_reclaim_policy: Some(policy.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn data_ref(current: &str, expected: &str) -> InstanceVolumeRef {
        InstanceVolumeRef {
            namespace: "db".into(),
            instance: "pg-1".into(),
            kind: VolumeKind::Data,
            current: current.into(),
            expected: expected.into(),
            volume_name: Some("pv-a".into()),
            leftover: None,
            target_present: false,
        }
    }

    fn pod(claim: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("pg-1".into()),
                namespace: Some("db".into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                volumes: Some(vec![Volume {
                    name: "pgdata".into(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: claim.into(),
                        read_only: None,
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn executor(store: &Arc<MemoryStore>) -> RemapExecutor {
        RemapExecutor::new(store.clone(), CancellationToken::new(), RemapEvents::default())
    }

    #[tokio::test]
    async fn test_safe_delete_never_removes_bound_claims() {
        // Every bound/unbound combination over three claims
        for mask in 0u8..8 {
            let store = Arc::new(MemoryStore::new());
            let names = ["pg-1", "pg-2", "pg-3"];
            for (i, name) in names.iter().enumerate() {
                let bound = mask & (1 << i) != 0;
                store.insert_claim(claim(name, "pv", bound.then_some("Bound")));
            }
            let exec = executor(&store);

            for (i, name) in names.iter().enumerate() {
                let key = ObjectKey::new("db", *name);
                let bound = mask & (1 << i) != 0;
                let result = exec.safe_delete_claim(&key).await;
                if bound {
                    assert_matches!(result, Err(Error::UnsafeDeletion { .. }));
                    assert!(store.claim(&key).is_some(), "bound claim {} removed", name);
                } else {
                    assert_matches!(result, Ok(DeletionOutcome::Deleted));
                    assert!(store.claim(&key).is_none());
                }
            }
        }
    }

    #[tokio::test]
    async fn test_safe_delete_missing_and_pending() {
        let store = Arc::new(MemoryStore::new());
        let mut held = claim("pg-1", "pv-a", Some("Pending"));
        held.metadata.finalizers = Some(vec!["kubernetes.io/pvc-protection".into()]);
        store.insert_claim(held);
        let exec = executor(&store);

        assert_eq!(
            exec.safe_delete_claim(&ObjectKey::new("db", "nope")).await.unwrap(),
            DeletionOutcome::AlreadyGone
        );
        let outcome = exec.safe_delete_claim(&ObjectKey::new("db", "pg-1")).await.unwrap();
        assert_eq!(outcome, DeletionOutcome::Pending);
        assert!(!outcome.is_gone());
    }

    #[tokio::test]
    async fn test_clone_creates_fresh_object() {
        let store = Arc::new(MemoryStore::new());
        store.insert_claim(claim("pg-1", "pv-a", Some("Bound")));
        let exec = executor(&store);

        let outcome = exec.clone_claim(&data_ref("pg-1", "pg-1-data2")).await.unwrap();
        assert_eq!(outcome, CloneOutcome::Cloned);

        let cloned = store.claim(&ObjectKey::new("db", "pg-1-data2")).unwrap();
        assert!(cloned.status.is_none());
        assert_eq!(
            cloned.spec.and_then(|s| s.volume_name).as_deref(),
            Some("pv-a")
        );
        // Source untouched
        assert!(store.claim(&ObjectKey::new("db", "pg-1")).is_some());
    }

    #[tokio::test]
    async fn test_clone_not_required_and_source_missing() {
        let store = Arc::new(MemoryStore::new());
        let exec = executor(&store);

        assert_eq!(
            exec.clone_claim(&data_ref("pg-1", "pg-1")).await.unwrap(),
            CloneOutcome::NotRequired
        );
        assert_matches!(
            exec.clone_claim(&data_ref("pg-1", "pg-1-data2")).await,
            Err(Error::SourceMissing { .. })
        );
        assert!(store.journal().is_empty());
    }

    #[tokio::test]
    async fn test_clone_replaces_unbound_leftover_target() {
        let store = Arc::new(MemoryStore::new());
        store.insert_claim(claim("pg-1", "pv-a", Some("Bound")));
        store.insert_claim(claim("pg-1-data2", "pv-a", None));
        let exec = executor(&store);

        let outcome = exec.clone_claim(&data_ref("pg-1", "pg-1-data2")).await.unwrap();
        assert_eq!(outcome, CloneOutcome::Cloned);
        let target = ObjectKey::new("db", "pg-1-data2");
        assert_eq!(
            store.journal(),
            vec![StoreOp::DeleteClaim(target.clone()), StoreOp::CreateClaim(target)]
        );
    }

    #[tokio::test]
    async fn test_clone_keeps_equivalent_bound_target() {
        let store = Arc::new(MemoryStore::new());
        store.insert_claim(claim("pg-1", "pv-a", Some("Bound")));
        store.insert_claim(claim("pg-1-data2", "pv-a", Some("Bound")));
        let exec = executor(&store);

        let outcome = exec.clone_claim(&data_ref("pg-1", "pg-1-data2")).await.unwrap();
        assert_eq!(outcome, CloneOutcome::AlreadyMigrated);
        assert!(store.journal().is_empty());
    }

    #[tokio::test]
    async fn test_clone_rejects_foreign_bound_target() {
        let store = Arc::new(MemoryStore::new());
        store.insert_claim(claim("pg-1", "pv-a", Some("Bound")));
        store.insert_claim(claim("pg-1-data2", "pv-other", Some("Bound")));
        let exec = executor(&store);

        assert_matches!(
            exec.clone_claim(&data_ref("pg-1", "pg-1-data2")).await,
            Err(Error::TargetMismatch { .. })
        );
    }

    #[tokio::test]
    async fn test_set_reclaim_policy_returns_previous() {
        let store = Arc::new(MemoryStore::new());
        store.insert_volume(volume("pv-a", "Delete"));
        store.insert_volume(volume("pv-b", "Retain"));
        let exec = executor(&store);

        assert_eq!(
            exec.set_reclaim_policy("pv-a", ReclaimPolicy::Retain).await.unwrap(),
            Some(ReclaimPolicy::Delete)
        );
        assert_eq!(
            exec.set_reclaim_policy("pv-b", ReclaimPolicy::Retain).await.unwrap(),
            None
        );
        assert_eq!(
            exec.set_reclaim_policy("", ReclaimPolicy::Retain).await.unwrap(),
            None
        );
        assert_eq!(
            ReclaimPolicy::of(&store.volume("pv-a").unwrap()),
            ReclaimPolicy::Retain
        );
    }

    #[tokio::test]
    async fn test_protection_window_restores_once_per_volume() {
        let store = Arc::new(MemoryStore::new());
        store.insert_volume(volume("pv-a", "Delete"));
        let exec = executor(&store);

        let mut window = ProtectionWindow::new();
        window.protect(&exec, Some("pv-a")).await.unwrap();
        window.protect(&exec, Some("pv-a")).await.unwrap();
        window.protect(&exec, None).await.unwrap();
        assert_eq!(window.pending_restores().len(), 1);

        window.close(&exec).await.unwrap();
        assert_eq!(
            ReclaimPolicy::of(&store.volume("pv-a").unwrap()),
            ReclaimPolicy::Delete
        );
        let patches = store
            .journal()
            .into_iter()
            .filter(|op| matches!(op, StoreOp::PatchVolume { .. }))
            .count();
        assert_eq!(patches, 2);
    }

    #[tokio::test]
    async fn test_cancelled_executor_refuses_forward_steps() {
        let store = Arc::new(MemoryStore::new());
        store.insert_claim(claim("pg-1", "pv-a", None));
        store.insert_volume(volume("pv-a", "Retain"));
        let cancel = CancellationToken::new();
        let exec = RemapExecutor::new(store.clone(), cancel.clone(), RemapEvents::default());
        cancel.cancel();

        assert_matches!(
            exec.safe_delete_claim(&ObjectKey::new("db", "pg-1")).await,
            Err(Error::Cancelled { .. })
        );
        // Release actions still run
        exec.restore_reclaim_policy("pv-a", ReclaimPolicy::Delete)
            .await
            .unwrap();
        assert_eq!(
            ReclaimPolicy::of(&store.volume("pv-a").unwrap()),
            ReclaimPolicy::Delete
        );
    }

    #[tokio::test]
    async fn test_restore_retries_after_conflict() {
        let store = Arc::new(MemoryStore::new());
        store.insert_volume(volume("pv-a", "Delete"));
        let exec = executor(&store);

        let mut window = ProtectionWindow::new();
        window.protect(&exec, Some("pv-a")).await.unwrap();
        store.inject(Fault::VolumeConflict("pv-a".into()));

        window.close(&exec).await.unwrap();
        assert_eq!(
            ReclaimPolicy::of(&store.volume("pv-a").unwrap()),
            ReclaimPolicy::Delete
        );
    }

    #[tokio::test]
    async fn test_pod_deletion_wait_times_out() {
        let store = Arc::new(MemoryStore::new());
        store.set_pod_termination(PodTermination::Held);
        store.insert_pod(pod("pg-1"));
        let exec = RemapExecutor::with_config(
            store.clone(),
            CancellationToken::new(),
            RemapEvents::default(),
            ExecutorConfig {
                pod_deletion_timeout: Duration::ZERO,
                ..Default::default()
            },
        );
        let original = pod("pg-1");

        assert_eq!(exec.delete_pod(&original).await.unwrap(), DeletionOutcome::Pending);
        assert_matches!(
            exec.wait_pod_gone(&original).await,
            Err(Error::PodTerminating { ref pod }) if pod == "db/pg-1"
        );
    }

    #[tokio::test]
    async fn test_recreate_waits_out_terminating_pod() {
        let store = Arc::new(MemoryStore::new());
        store.set_pod_termination(PodTermination::AfterReads(2));
        store.insert_pod(pod("pg-1"));
        let exec = executor(&store);

        assert_eq!(exec.delete_pod(&pod("pg-1")).await.unwrap(), DeletionOutcome::Pending);
        exec.recreate_pod(&pod("pg-1-data2")).await.unwrap();

        let current = store.pod(&ObjectKey::new("db", "pg-1")).unwrap();
        assert!(current.metadata.deletion_timestamp.is_none());
        assert!(mounted_claims(&current).contains("pg-1-data2"));

        // Idempotent once the new pod is in place
        exec.recreate_pod(&pod("pg-1-data2")).await.unwrap();
        let creates = store
            .journal()
            .into_iter()
            .filter(|op| matches!(op, StoreOp::CreatePod(_)))
            .count();
        assert_eq!(creates, 1);
    }
}
