//! Role-Label Switchover
//!
//! Minimal [`SwitchoverWorkflow`] that moves the primary role by relabelling
//! pods. Clusters whose replication manager watches the role label promote
//! the new primary on their own.

use crate::config::LabelConfig;
use crate::domain::ports::{
    ClusterRef, InstanceStatus, ObjectKey, ObjectStoreRef, PatchOutcome, SwitchoverWorkflow,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Default tolerated replay lag, in bytes of WAL
pub const DEFAULT_MAX_LAG_BYTES: u64 = 16 * 1024 * 1024;

/// Switchover that relabels the most advanced ready replica as primary
pub struct RoleLabelSwitchover {
    store: ObjectStoreRef,
    labels: LabelConfig,
    max_lag_bytes: u64,
}

impl RoleLabelSwitchover {
    pub fn new(store: ObjectStoreRef, labels: LabelConfig) -> Self {
        Self {
            store,
            labels,
            max_lag_bytes: DEFAULT_MAX_LAG_BYTES,
        }
    }

    pub fn with_max_lag(mut self, max_lag_bytes: u64) -> Self {
        self.max_lag_bytes = max_lag_bytes;
        self
    }

    /// Most advanced ready replica; ties go to the lowest pod name
    fn pick_target<'a>(
        statuses: &'a [InstanceStatus],
        candidate: &str,
    ) -> Option<&'a InstanceStatus> {
        statuses
            .iter()
            .filter(|s| s.pod_name != candidate && !s.is_primary && s.is_ready)
            .max_by(|a, b| {
                a.replay_lsn
                    .unwrap_or_default()
                    .cmp(&b.replay_lsn.unwrap_or_default())
                    .then_with(|| b.pod_name.cmp(&a.pod_name))
            })
    }

    async fn set_role(&self, key: &ObjectKey, role: &str) -> Result<()> {
        let labels = BTreeMap::from([(self.labels.instance_role.clone(), role.to_string())]);
        match self.store.patch_pod_labels(key, &labels).await? {
            PatchOutcome::Patched => Ok(()),
            PatchOutcome::Conflict => Err(Error::Conflict {
                kind: "Pod".into(),
                name: key.to_string(),
            }),
        }
    }
}

#[async_trait]
impl SwitchoverWorkflow for RoleLabelSwitchover {
    async fn promote(
        &self,
        cluster: &ClusterRef,
        statuses: &[InstanceStatus],
        candidate: &Pod,
        force_failover: bool,
        force_switchover: bool,
        reason: &str,
    ) -> Result<bool> {
        let primary = candidate.metadata.name.clone().unwrap_or_default();
        let current = statuses.iter().find(|s| s.pod_name == primary);

        if !force_failover && !current.is_some_and(|s| s.is_ready) {
            return Err(Error::Switchover {
                pod: primary,
                reason: "primary is not ready and failover is not forced".into(),
            });
        }

        let Some(target) = Self::pick_target(statuses, &primary) else {
            warn!(cluster = %cluster, pod = %primary, "No ready replica to switch over to");
            return Ok(false);
        };

        let lag = match (current.and_then(|s| s.replay_lsn), target.replay_lsn) {
            (Some(primary_lsn), Some(target_lsn)) => primary_lsn.saturating_sub(target_lsn),
            _ => 0,
        };
        if lag > self.max_lag_bytes && !force_switchover {
            warn!(
                cluster = %cluster,
                target = %target.pod_name,
                lag,
                "Replica too far behind for switchover"
            );
            return Ok(false);
        }

        info!(
            cluster = %cluster,
            from = %primary,
            to = %target.pod_name,
            lag,
            reason,
            "Switching over primary"
        );
        self.set_role(
            &ObjectKey::new(&cluster.namespace, &target.pod_name),
            &self.labels.primary_role,
        )
        .await?;
        self.set_role(
            &ObjectKey::new(&cluster.namespace, &primary),
            &self.labels.replica_role,
        )
        .await?;
        Ok(true)
    }
}
