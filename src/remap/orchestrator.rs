//! Instance Migration Orchestrator
//!
//! Sequences the executor's primitives for a single instance pod:
//!
//! 1. defer if the pod is the primary and needs new claims
//! 2. protect every backing volume with `Retain`
//! 3. clone claims under their expected identity
//! 4. swap the pod's claim references (delete, recreate on exit once the
//!    delete was accepted)
//! 5. remove the old claims
//!
//! Pod recreation and policy restoration run on every exit path.

use crate::config::LabelConfig;
use crate::error::{Error, Result};
use crate::remap::events::RemapEvent;
use crate::remap::executor::{CloneOutcome, DeletionOutcome, ProtectionWindow, RemapExecutor};
use crate::remap::plan::{InstanceVolumeRef, RemapBatch};
use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

/// Result of one orchestrator call that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemapOutcome {
    /// Every claim of the instance follows the naming policy
    Done,
    /// The instance is the primary; it has to be switched over first
    Deferred,
}

/// Migrates the claims of one instance
#[derive(Clone)]
pub struct InstanceOrchestrator {
    executor: RemapExecutor,
    labels: LabelConfig,
}

impl InstanceOrchestrator {
    pub fn new(executor: RemapExecutor, labels: LabelConfig) -> Self {
        Self { executor, labels }
    }

    pub fn executor(&self) -> &RemapExecutor {
        &self.executor
    }

    /// Whether `pod` carries the primary role label
    pub fn is_primary(&self, pod: &Pod) -> bool {
        pod.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(&self.labels.instance_role))
            .is_some_and(|role| role == &self.labels.primary_role)
    }

    /// Bring `pod`'s claims in line with `refs`
    ///
    /// `refs` may span the whole cluster; only the pod's own instance is
    /// considered.
    pub async fn remap(&self, pod: &Pod, refs: &[InstanceVolumeRef]) -> Result<RemapOutcome> {
        let instance = pod.metadata.name.clone().unwrap_or_default();
        let batch = RemapBatch::for_pod(pod, refs);
        if batch.is_empty() {
            debug!(instance = %instance, "No claims to remap");
            return Ok(RemapOutcome::Done);
        }
        if batch.requires_pod_swap() && self.is_primary(pod) {
            info!(instance = %instance, "Deferring primary until replicas are remapped");
            self.executor.events().emit(RemapEvent::PrimaryDeferred {
                instance: instance.clone(),
            });
            return Ok(RemapOutcome::Deferred);
        }

        info!(
            instance = %instance,
            claims = batch.len(),
            pod_swap = batch.requires_pod_swap(),
            "Remapping instance claims"
        );

        let mut window = ProtectionWindow::new();
        let mut replacement = None;
        let migrated = self
            .migrate(pod, &batch, &mut window, &mut replacement)
            .await;
        let result = self.release(migrated, replacement, window).await;

        match &result {
            Ok(()) => {
                info!(instance = %instance, "Instance claims remapped");
                self.executor
                    .events()
                    .emit(RemapEvent::InstanceRemapped { instance });
            }
            Err(e) => {
                error!(instance = %instance, error = %e, "Instance remap failed");
                self.executor.events().emit(RemapEvent::InstanceRemapFailed {
                    instance,
                    reason: e.to_string(),
                });
            }
        }
        result.map(|()| RemapOutcome::Done)
    }

    async fn migrate(
        &self,
        pod: &Pod,
        batch: &RemapBatch,
        window: &mut ProtectionWindow,
        replacement: &mut Option<Pod>,
    ) -> Result<()> {
        for reference in batch.refs() {
            window
                .protect(&self.executor, reference.volume_name.as_deref())
                .await?;

            match self.executor.clone_claim(reference).await? {
                CloneOutcome::Cloned => self.executor.events().emit(RemapEvent::ClaimCloned {
                    instance: reference.instance.clone(),
                    from: reference.current.clone(),
                    to: reference.expected.clone(),
                }),
                CloneOutcome::AlreadyMigrated => {
                    self.executor.events().emit(RemapEvent::CloneSkipped {
                        instance: reference.instance.clone(),
                        claim: reference.expected.clone(),
                    })
                }
                CloneOutcome::NotRequired => {}
            }
        }

        if batch.requires_pod_swap() {
            let rewritten = rewrite_pod(pod, &batch.renames());
            let deletion = self.executor.delete_pod(pod).await?;
            // Accepted deletes always get the pod back, whatever follows
            *replacement = Some(rewritten);
            if deletion == DeletionOutcome::Pending {
                self.executor.wait_pod_gone(pod).await?;
            }
        }

        for reference in batch.refs() {
            let Some(stale) = reference.stale_key() else {
                continue;
            };
            match self.executor.safe_delete_claim(&stale).await? {
                DeletionOutcome::Deleted => {
                    self.executor.events().emit(RemapEvent::StaleClaimRemoved {
                        instance: reference.instance.clone(),
                        claim: stale.name.clone(),
                    });
                }
                DeletionOutcome::AlreadyGone => {}
                DeletionOutcome::Pending => {
                    return Err(Error::StaleResource {
                        claim: stale.to_string(),
                        reason: "old claim should be cleaned but is still present".into(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Recreate the pod and close the protection window, whatever `result` is
    async fn release(
        &self,
        mut result: Result<()>,
        replacement: Option<Pod>,
        window: ProtectionWindow,
    ) -> Result<()> {
        if let Some(pod) = replacement {
            if let Err(e) = self.executor.recreate_pod(&pod).await {
                error!(
                    pod = pod.metadata.name.as_deref().unwrap_or_default(),
                    error = %e,
                    "Failed to recreate pod"
                );
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        if let Err(e) = window.close(&self.executor).await {
            if result.is_ok() {
                result = Err(e);
            } else {
                warn!(error = %e, "Reclaim policy restoration failed after an earlier error");
            }
        }
        result
    }
}

/// Copy `pod` with its claim references renamed, ready to be created again
pub fn rewrite_pod(pod: &Pod, renames: &BTreeMap<String, String>) -> Pod {
    let mut pod = pod.clone();
    if let Some(volumes) = pod.spec.as_mut().and_then(|spec| spec.volumes.as_mut()) {
        for volume in volumes.iter_mut() {
            if let Some(source) = volume.persistent_volume_claim.as_mut() {
                if let Some(expected) = renames.get(&source.claim_name) {
                    source.claim_name = expected.clone();
                }
            }
        }
    }

    let meta = &mut pod.metadata;
    meta.resource_version = None;
    meta.uid = None;
    meta.creation_timestamp = None;
    meta.deletion_timestamp = None;
    meta.deletion_grace_period_seconds = None;
    meta.managed_fields = None;
    meta.generation = None;
    pod.status = None;
    pod
}
