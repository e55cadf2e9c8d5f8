//! Konstellation kubehub – typed object store over the cluster control plane.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use kon_core::{KonError, KonResult, ObjectKey, ResourceKind};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams},
    config::KubeConfigOptions,
    core::{ApiResource, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client, Config,
};
use metrics::counter;
use tracing::debug;

mod mem;

pub use kube::core::{DynamicObject, TypeMeta};
pub use kube::api::ObjectMeta;
pub use mem::{MemStore, WriteOp, WriteRecord};

/// Object-store view of the control plane. Constructed once per target context.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch by key; a missing object is `KonError::NotFound`.
    async fn get(&self, kind: &ResourceKind, key: &ObjectKey) -> KonResult<DynamicObject>;
    async fn create(&self, kind: &ResourceKind, obj: &DynamicObject) -> KonResult<DynamicObject>;
    /// Replace; `obj.metadata.resourceVersion` must match the live object.
    async fn update(&self, kind: &ResourceKind, obj: &DynamicObject) -> KonResult<DynamicObject>;
    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>) -> KonResult<Vec<DynamicObject>>;
    /// Merge-patch the status subresource.
    async fn patch_status(&self, kind: &ResourceKind, key: &ObjectKey, status: &serde_json::Value) -> KonResult<DynamicObject>;
}

/// Empty object carrying only identity: the "does not exist yet" placeholder.
pub fn placeholder(kind: &ResourceKind, key: &ObjectKey) -> DynamicObject {
    DynamicObject {
        types: Some(TypeMeta { api_version: kind.api_version(), kind: kind.kind.clone() }),
        metadata: ObjectMeta { name: Some(key.name.clone()), namespace: key.namespace.clone(), ..Default::default() },
        data: serde_json::Value::Object(serde_json::Map::new()),
    }
}

pub fn object_key(obj: &DynamicObject) -> KonResult<ObjectKey> {
    let name = obj.metadata.name.clone().ok_or_else(|| KonError::DecodeFailed("object missing metadata.name".into()))?;
    Ok(ObjectKey { namespace: obj.metadata.namespace.clone(), name })
}

/// Build a client for a kubeconfig context (current context when None).
pub async fn client_for_context(context: Option<&str>) -> KonResult<Client> {
    let config = match context {
        Some(ctx) => {
            let opts = KubeConfigOptions { context: Some(ctx.to_string()), ..Default::default() };
            Config::from_kubeconfig(&opts).await.map_err(|e| KonError::Kube(format!("kubeconfig context {}: {}", ctx, e)))?
        }
        None => Config::infer().await.map_err(|e| KonError::Kube(format!("inferring kube config: {}", e)))?,
    };
    Client::try_from(config).map_err(|e| KonError::Kube(format!("building client: {}", e)))
}

/// kube-rs backed store using dynamic objects and discovery.
pub struct KubeStore {
    client: Client,
    resources: Mutex<HashMap<String, (ApiResource, bool)>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client, resources: Mutex::new(HashMap::new()) } }

    pub async fn for_context(context: Option<&str>) -> KonResult<Self> { Ok(Self::new(client_for_context(context).await?)) }

    async fn api(&self, kind: &ResourceKind, namespace: Option<&str>, all_namespaces: bool) -> KonResult<Api<DynamicObject>> {
        let key = kind.gvk_key();
        let cached = self.resources.lock().map_err(|_| KonError::Kube("resource cache poisoned".into()))?.get(&key).cloned();
        let (ar, namespaced) = match cached {
            Some(v) => v,
            None => {
                let v = find_api_resource(self.client.clone(), kind).await?;
                if let Ok(mut m) = self.resources.lock() { m.insert(key, v.clone()); }
                v
            }
        };
        if !namespaced {
            return Ok(Api::all_with(self.client.clone(), &ar));
        }
        match namespace {
            Some(ns) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
            None if all_namespaces => Ok(Api::all_with(self.client.clone(), &ar)),
            None => Err(KonError::Kube(format!("namespace required for namespaced kind {}", kind))),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, kind: &ResourceKind, key: &ObjectKey) -> KonResult<DynamicObject> {
        counter!("kube_requests_total", 1u64);
        let api = self.api(kind, key.namespace.as_deref(), false).await?;
        api.get(&key.name).await.map_err(|e| map_kube_err(e, &format!("get {} {}", kind, key)))
    }

    async fn create(&self, kind: &ResourceKind, obj: &DynamicObject) -> KonResult<DynamicObject> {
        counter!("kube_requests_total", 1u64);
        let key = object_key(obj)?;
        let api = self.api(kind, key.namespace.as_deref(), false).await?;
        debug!(kind = %kind, key = %key, "create");
        api.create(&PostParams::default(), obj).await.map_err(|e| map_kube_err(e, &format!("create {} {}", kind, key)))
    }

    async fn update(&self, kind: &ResourceKind, obj: &DynamicObject) -> KonResult<DynamicObject> {
        counter!("kube_requests_total", 1u64);
        let key = object_key(obj)?;
        let api = self.api(kind, key.namespace.as_deref(), false).await?;
        debug!(kind = %kind, key = %key, rv = ?obj.metadata.resource_version, "update");
        api.replace(&key.name, &PostParams::default(), obj).await.map_err(|e| map_kube_err(e, &format!("update {} {}", kind, key)))
    }

    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>) -> KonResult<Vec<DynamicObject>> {
        counter!("kube_requests_total", 1u64);
        let api = self.api(kind, namespace, true).await?;
        let list = api.list(&ListParams::default()).await.map_err(|e| map_kube_err(e, &format!("list {}", kind)))?;
        Ok(list.items)
    }

    async fn patch_status(&self, kind: &ResourceKind, key: &ObjectKey, status: &serde_json::Value) -> KonResult<DynamicObject> {
        counter!("kube_requests_total", 1u64);
        let api = self.api(kind, key.namespace.as_deref(), false).await?;
        let patch = serde_json::json!({ "status": status });
        api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_err(e, &format!("patch status {} {}", kind, key)))
    }
}

fn map_kube_err(e: kube::Error, what: &str) -> KonError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => KonError::NotFound(format!("{}: {}", what, ae.message)),
        kube::Error::Api(ae) if ae.code == 409 => KonError::Conflict(format!("{}: {}", what, ae.message)),
        other => KonError::Kube(format!("{}: {}", what, other)),
    }
}

async fn find_api_resource(client: Client, kind: &ResourceKind) -> KonResult<(ApiResource, bool)> {
    let gvk = GroupVersionKind { group: kind.group.clone(), version: kind.version.clone(), kind: kind.kind.clone() };
    let discovery = Discovery::new(client).run().await.map_err(|e| KonError::Kube(format!("discovery: {}", e)))?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(KonError::NotFound(format!("GVK not served: {}", kind)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_carries_identity_only() {
        let kind = ResourceKind::new("", "v1", "ConfigMap");
        let p = placeholder(&kind, &ObjectKey::namespaced("ns", "cfg"));
        let types = p.types.clone().unwrap();
        assert_eq!(types.api_version, "v1");
        assert_eq!(types.kind, "ConfigMap");
        assert_eq!(p.metadata.name.as_deref(), Some("cfg"));
        assert_eq!(p.metadata.namespace.as_deref(), Some("ns"));
        assert!(p.metadata.resource_version.is_none());
        assert_eq!(p.data, serde_json::json!({}));
    }

    #[test]
    fn object_key_requires_name() {
        let kind = ResourceKind::new("", "v1", "ConfigMap");
        let mut p = placeholder(&kind, &ObjectKey::cluster("x"));
        assert_eq!(object_key(&p).unwrap(), ObjectKey::cluster("x"));
        p.metadata.name = None;
        assert!(matches!(object_key(&p), Err(KonError::DecodeFailed(_))));
    }
}
