//! Object Store Adapters
//!
//! Implementations of the [`ObjectStore`](crate::domain::ports::ObjectStore) port:
//! - Kube: live Kubernetes API server
//! - Memory: in-process store for tests, benches and dry runs

mod kubernetes;
mod memory;

pub use kubernetes::KubeStore;
pub use memory::{Fault, MemoryStore, PodTermination, StoreOp};

use k8s_openapi::Metadata;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Human-readable `Kind/namespace/name` for log and error context
pub(crate) fn describe<K>(object: &K) -> String
where
    K: Metadata<Ty = ObjectMeta> + k8s_openapi::Resource,
{
    let meta = object.metadata();
    match meta.namespace.as_deref() {
        Some(ns) => format!(
            "{}/{}/{}",
            K::KIND,
            ns,
            meta.name.as_deref().unwrap_or_default()
        ),
        None => format!("{}/{}", K::KIND, meta.name.as_deref().unwrap_or_default()),
    }
}
