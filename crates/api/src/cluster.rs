//! Cluster config sync: install what the cluster's `ClusterConfig` asks for and record it in its status.

use std::collections::BTreeMap;

use kon_core::{KonError, KonResult, ObjectKey, OpCtx, ResourceKind};
use kon_kubehub::{object_key, DynamicObject, ObjectStore};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{resolve_version, ClusterInfo, Orchestrator};

pub fn cluster_config_kind() -> ResourceKind { ResourceKind::new("k11n.dev", "v1alpha1", "ClusterConfig") }

/// Entry of `spec.components` and `status.components`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub installed: Vec<ComponentSpec>,
    /// Already recorded in the status.
    pub skipped: Vec<String>,
}

/// The cluster-scoped config; the first one listed when several exist.
pub async fn load_cluster_config(store: &dyn ObjectStore, ctx: &OpCtx) -> KonResult<DynamicObject> {
    let kind = cluster_config_kind();
    let mut items = ctx.run("list ClusterConfig", store.list(&kind, None)).await?;
    if items.is_empty() {
        return Err(KonError::NotFound(format!("no {} in cluster", kind)));
    }
    Ok(items.swap_remove(0))
}

impl ClusterInfo {
    /// Name from metadata, kube version from `spec.kubeVersion`.
    pub fn from_cluster_config(obj: &DynamicObject) -> KonResult<Self> {
        let name = object_key(obj)?.name;
        let kube_version = obj
            .data
            .pointer("/spec/kubeVersion")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| KonError::DecodeFailed(format!("ClusterConfig {} has no spec.kubeVersion", name)))?;
        Ok(Self::new(&name, kube_version))
    }

    pub async fn load(store: &dyn ObjectStore, ctx: &OpCtx) -> KonResult<Self> { Self::from_cluster_config(&load_cluster_config(store, ctx).await?) }
}

fn components_at(obj: &DynamicObject, pointer: &str) -> KonResult<Vec<ComponentSpec>> {
    match obj.data.pointer(pointer) {
        None | Some(serde_json::Value::Null) => Ok(Vec::new()),
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| KonError::DecodeFailed(format!("ClusterConfig {}: {}", pointer, e))),
    }
}

impl Orchestrator {
    /// Install every `spec.components` entry not yet in `status.components`, then write the status.
    ///
    /// Unknown names and version mismatches stop the sync. Components installed before
    /// a failure are still recorded.
    pub async fn sync_cluster_config(&self, ctx: &OpCtx) -> KonResult<SyncReport> {
        let cc = load_cluster_config(self.store().as_ref(), ctx).await?;
        let cluster = ClusterInfo::from_cluster_config(&cc)?;
        let key: ObjectKey = object_key(&cc)?;
        let wanted = components_at(&cc, "/spec/components")?;
        let mut installed: BTreeMap<String, String> = components_at(&cc, "/status/components")?.into_iter().map(|c| (c.name, c.version)).collect();

        let mut report = SyncReport::default();
        let mut outcome = Ok(());
        for comp in &wanted {
            if installed.contains_key(&comp.name) {
                report.skipped.push(comp.name.clone());
                continue;
            }
            match self.sync_one(ctx, &cluster, comp).await {
                Ok(()) => {
                    installed.insert(comp.name.clone(), comp.version.clone());
                    report.installed.push(comp.clone());
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        if !report.installed.is_empty() {
            let status: Vec<ComponentSpec> = installed.into_iter().map(|(name, version)| ComponentSpec { name, version }).collect();
            let patch = serde_json::json!({ "components": status });
            if let Err(e) = ctx.run("update ClusterConfig status", self.store().patch_status(&cluster_config_kind(), &key, &patch)).await {
                if outcome.is_err() {
                    warn!(error = %e, "could not record partially installed components");
                } else {
                    return Err(e);
                }
            }
        }
        outcome.map(|_| report)
    }

    async fn sync_one(&self, ctx: &OpCtx, cluster: &ClusterInfo, comp: &ComponentSpec) -> KonResult<()> {
        let installer = self
            .registry()
            .get(&comp.name)
            .ok_or_else(|| KonError::UnknownComponent(format!("{} is required by the cluster but no longer available", comp.name)))?;
        if let Some(available) = resolve_version(installer.as_ref(), &cluster.kube_version)? {
            if available != comp.version {
                return Err(KonError::VersionMismatch { component: comp.name.clone(), requested: comp.version.clone(), available });
            }
        }
        info!(component = %comp.name, version = %comp.version, "syncing component");
        self.install(ctx, cluster, &comp.name).await.map(|_| ())
    }
}
