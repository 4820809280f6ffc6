//! Cluster Remap Coordinator
//!
//! One reconciliation pass over a cluster's claim inventory. Replicas are
//! migrated in place; the primary is deferred and handed to the switchover
//! workflow once every other instance went through.

use crate::config::{LabelConfig, NamingPolicy};
use crate::domain::ports::{ClusterRef, InstanceStatus, ObjectKey, SwitchoverWorkflowRef};
use crate::error::{Error, Result};
use crate::remap::events::{RemapEvent, RemapEvents};
use crate::remap::orchestrator::{InstanceOrchestrator, RemapOutcome};
use crate::remap::plan::{classify, InstanceVolumeRef};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Reason handed to the switchover workflow
pub const SWITCHOVER_REASON: &str = "remapping PVCs";

/// What a pass achieved
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemapSummary {
    /// Instances whose claims were migrated in this pass
    pub remapped: Vec<String>,
    /// Primary that was skipped pending a switchover
    pub deferred_primary: Option<String>,
    /// Whether the switchover completed
    pub switchover_done: bool,
    /// Claims that did not follow the naming policy when the pass started
    pub claims_pending: usize,
}

impl RemapSummary {
    pub fn is_noop(&self) -> bool {
        self.remapped.is_empty() && self.deferred_primary.is_none()
    }
}

/// Drives the remap of every instance of a cluster
pub struct ClusterRemapCoordinator {
    orchestrator: InstanceOrchestrator,
    switchover: SwitchoverWorkflowRef,
    policy: NamingPolicy,
    labels: LabelConfig,
}

impl ClusterRemapCoordinator {
    pub fn new(
        orchestrator: InstanceOrchestrator,
        switchover: SwitchoverWorkflowRef,
        policy: NamingPolicy,
        labels: LabelConfig,
    ) -> Self {
        Self {
            orchestrator,
            switchover,
            policy,
            labels,
        }
    }

    pub fn policy(&self) -> &NamingPolicy {
        &self.policy
    }

    fn events(&self) -> &RemapEvents {
        self.orchestrator.executor().events()
    }

    /// Run one remap pass over `claims`
    pub async fn reconcile_remapping(
        &self,
        cluster: &ClusterRef,
        claims: &[PersistentVolumeClaim],
        statuses: &[InstanceStatus],
    ) -> Result<RemapSummary> {
        let plan = match classify(claims, &self.policy, &self.labels) {
            Ok(plan) => plan,
            Err(e @ Error::MalformedInventory { .. }) => {
                error!(cluster = %cluster, error = %e, "Claim inventory rejected, remapping disabled for this pass");
                self.events().emit(RemapEvent::InventoryRejected {
                    reason: e.to_string(),
                });
                return Ok(RemapSummary::default());
            }
            Err(e) => return Err(e),
        };

        let mut summary = RemapSummary {
            claims_pending: plan.remap_required(),
            ..Default::default()
        };
        if summary.claims_pending == 0 {
            debug!(cluster = %cluster, claims = plan.len(), "All claims follow the naming policy");
            return Ok(summary);
        }
        info!(
            cluster = %cluster,
            pending = plan.remap_required(),
            "Remapping cluster claims"
        );

        let mut failed = Vec::new();
        let mut first_error = None;
        let mut deferred: Option<Pod> = None;

        for instance in plan.instances() {
            let refs = plan.for_instance(instance);
            if !refs.iter().any(InstanceVolumeRef::needs_action) {
                continue;
            }
            match self.remap_instance(cluster, instance, refs).await {
                Ok((RemapOutcome::Done, _)) => summary.remapped.push(instance.to_string()),
                Ok((RemapOutcome::Deferred, pod)) => deferred = Some(pod),
                Err(e @ Error::Cancelled { .. }) => return Err(e),
                Err(e) => {
                    warn!(cluster = %cluster, instance, error = %e, "Instance remap failed, continuing");
                    failed.push(instance.to_string());
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(first) = first_error {
            return Err(Error::RemapFailed {
                failed,
                first: Box::new(first),
            });
        }

        if let Some(primary) = deferred {
            let pod = primary.metadata.name.clone().unwrap_or_default();
            summary.deferred_primary = Some(pod.clone());
            info!(cluster = %cluster, pod = %pod, "Replicas remapped, switching over primary");

            let done = self
                .switchover
                .promote(cluster, statuses, &primary, true, true, SWITCHOVER_REASON)
                .await
                .map_err(|e| match e {
                    e @ (Error::Switchover { .. } | Error::Cancelled { .. }) => e,
                    e => Error::Switchover {
                        pod: pod.clone(),
                        reason: e.to_string(),
                    },
                })?;
            self.events().emit(RemapEvent::SwitchoverRequested {
                pod: pod.clone(),
                done,
            });
            if !done {
                return Err(Error::SwitchoverIncomplete { pod });
            }
            summary.switchover_done = true;
        }

        Ok(summary)
    }

    async fn remap_instance(
        &self,
        cluster: &ClusterRef,
        instance: &str,
        refs: &[InstanceVolumeRef],
    ) -> Result<(RemapOutcome, Pod)> {
        let key = ObjectKey::new(&cluster.namespace, instance);
        let pod = self
            .orchestrator
            .executor()
            .store()
            .get_pod(&key)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "Pod".into(),
                name: key.to_string(),
            })?;
        let outcome = self.orchestrator.remap(&pod, refs).await?;
        Ok((outcome, pod))
    }
}
