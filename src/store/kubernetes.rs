//! Kubernetes Object Store
//!
//! Talks to the API server through `kube::Api`. Conflicts and
//! already-exists responses (409) and not-found responses (404) are mapped
//! to store outcomes; everything else is wrapped with operation context.

use crate::domain::ports::{
    CreateOutcome, DeleteOutcome, ObjectKey, ObjectStore, PatchOutcome, ReclaimPolicy,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions};
use kube::Client;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::debug;

const NOT_FOUND: u16 = 404;
const CONFLICT: u16 = 409;

/// Object store backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn volumes(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }
}

fn api_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

fn delete_params(resource_version: Option<&str>) -> DeleteParams {
    DeleteParams {
        preconditions: resource_version.map(|rv| Preconditions {
            resource_version: Some(rv.to_string()),
            uid: None,
        }),
        ..Default::default()
    }
}

async fn create<K>(api: &Api<K>, object: &K, describe: String) -> Result<CreateOutcome>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + serde::Serialize + std::fmt::Debug,
{
    match api.create(&PostParams::default(), object).await {
        Ok(_) => Ok(CreateOutcome::Created),
        Err(e) if api_code(&e) == Some(CONFLICT) => Ok(CreateOutcome::AlreadyExists),
        Err(e) => Err(Error::store("create", describe, e)),
    }
}

async fn delete<K>(
    api: &Api<K>,
    key: &ObjectKey,
    resource_version: Option<&str>,
    kind: &str,
) -> Result<DeleteOutcome>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(&key.name, &delete_params(resource_version)).await {
        // The API returns the object itself while finalizers hold it
        Ok(response) if response.is_left() => Ok(DeleteOutcome::Pending),
        Ok(_) => Ok(DeleteOutcome::Deleted),
        Err(e) if api_code(&e) == Some(NOT_FOUND) => Ok(DeleteOutcome::NotFound),
        Err(e) if api_code(&e) == Some(CONFLICT) => Ok(DeleteOutcome::Conflict),
        Err(e) => Err(Error::store("delete", format!("{}/{}", kind, key), e)),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_claim(&self, key: &ObjectKey) -> Result<Option<PersistentVolumeClaim>> {
        self.claims(&key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(|e| Error::store("get", format!("PersistentVolumeClaim/{}", key), e))
    }

    async fn list_claims(&self, namespace: &str, selector: &str) -> Result<Vec<PersistentVolumeClaim>> {
        let list = self
            .claims(namespace)
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| Error::store("list", format!("PersistentVolumeClaim/{}", namespace), e))?;
        debug!(namespace, selector, count = list.items.len(), "Listed claims");
        Ok(list.items)
    }

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<CreateOutcome> {
        let namespace = claim.metadata.namespace.as_deref().unwrap_or_default();
        create(&self.claims(namespace), claim, super::describe(claim)).await
    }

    async fn delete_claim(
        &self,
        key: &ObjectKey,
        resource_version: Option<&str>,
    ) -> Result<DeleteOutcome> {
        delete(
            &self.claims(&key.namespace),
            key,
            resource_version,
            "PersistentVolumeClaim",
        )
        .await
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        self.volumes()
            .get_opt(name)
            .await
            .map_err(|e| Error::store("get", format!("PersistentVolume/{}", name), e))
    }

    async fn patch_reclaim_policy(
        &self,
        name: &str,
        policy: ReclaimPolicy,
        resource_version: Option<&str>,
    ) -> Result<PatchOutcome> {
        // A resourceVersion inside a merge patch makes the API server reject
        // stale writes with 409
        let mut patch = json!({
            "spec": { "persistentVolumeReclaimPolicy": policy.as_str() }
        });
        if let Some(rv) = resource_version {
            patch["metadata"] = json!({ "resourceVersion": rv });
        }

        match self
            .volumes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(PatchOutcome::Patched),
            Err(e) if api_code(&e) == Some(CONFLICT) => Ok(PatchOutcome::Conflict),
            Err(e) => Err(Error::store("patch", format!("PersistentVolume/{}", name), e)),
        }
    }

    async fn get_pod(&self, key: &ObjectKey) -> Result<Option<Pod>> {
        self.pods(&key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(|e| Error::store("get", format!("Pod/{}", key), e))
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let list = self
            .pods(namespace)
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| Error::store("list", format!("Pod/{}", namespace), e))?;
        Ok(list.items)
    }

    async fn create_pod(&self, pod: &Pod) -> Result<CreateOutcome> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        create(&self.pods(namespace), pod, super::describe(pod)).await
    }

    async fn delete_pod(&self, key: &ObjectKey, resource_version: Option<&str>) -> Result<DeleteOutcome> {
        delete(&self.pods(&key.namespace), key, resource_version, "Pod").await
    }

    async fn patch_pod_labels(
        &self,
        key: &ObjectKey,
        labels: &BTreeMap<String, String>,
    ) -> Result<PatchOutcome> {
        let patch = json!({ "metadata": { "labels": labels } });
        match self
            .pods(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(PatchOutcome::Patched),
            Err(e) if api_code(&e) == Some(CONFLICT) => Ok(PatchOutcome::Conflict),
            Err(e) => Err(Error::store("patch", format!("Pod/{}", key), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_params_carry_precondition() {
        let params = delete_params(Some("42"));
        assert_eq!(
            params.preconditions.and_then(|p| p.resource_version),
            Some("42".to_string())
        );
        assert!(delete_params(None).preconditions.is_none());
    }
}
