//! Install orchestration: version, then tool, then cluster.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use kon_apply::ManifestApplier;
use kon_core::{KonResult, Layout, OpCtx};
use kon_kubehub::ObjectStore;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{resolve_version, Catalogue, ClusterInfo, InstallContext, Installer, Registry};

/// What one `install` did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReport {
    pub name: String,
    pub version: Option<String>,
    pub tool_installed: bool,
    pub cluster_installed: bool,
}

pub struct Orchestrator {
    registry: Arc<Registry>,
    store: Arc<dyn ObjectStore>,
    applier: Arc<ManifestApplier>,
    layout: Layout,
}

impl Orchestrator {
    pub fn new(registry: Arc<Registry>, store: Arc<dyn ObjectStore>, applier: Arc<ManifestApplier>, layout: Layout) -> Self {
        Self { registry, store, applier, layout }
    }

    pub fn registry(&self) -> &Registry { &self.registry }

    pub fn store(&self) -> &Arc<dyn ObjectStore> { &self.store }

    fn context(&self, ctx: &OpCtx, cluster: &ClusterInfo, version: Option<String>) -> InstallContext {
        InstallContext {
            store: self.store.clone(),
            applier: self.applier.clone(),
            layout: self.layout.clone(),
            cluster: cluster.clone(),
            version,
            ctx: ctx.child(),
        }
    }

    /// Provision missing or stale tools for `names`. Distinct tools install concurrently.
    /// Returns the tools that were installed.
    pub async fn ensure_tools(&self, ctx: &OpCtx, names: &[&str]) -> KonResult<Vec<String>> {
        let installers: Vec<Arc<dyn Installer>> = names.iter().map(|n| self.registry.resolve(n)).collect::<KonResult<_>>()?;
        let mut seen = HashSet::new();
        let toolable: Vec<&Arc<dyn Installer>> =
            installers.iter().filter(|i| i.as_tool().map(|t| seen.insert(t.provisioner().spec().name.clone())).unwrap_or(false)).collect();
        let results = join_all(toolable.iter().map(|i| async move {
            let tool = match i.as_tool() {
                Some(t) => t,
                None => return Ok(None),
            };
            let name = tool.provisioner().spec().name.clone();
            if !tool.needs_tool(ctx).await {
                debug!(component = %i.name(), tool = %name, "tool up to date");
                return Ok(None);
            }
            tool.install_tool(ctx).await.map(|_| Some(name))
        }))
        .await;
        let mut installed = Vec::new();
        for r in results {
            if let Some(name) = r? {
                installed.push(name);
            }
        }
        Ok(installed)
    }

    /// Resolve the version, provision the tool when needed, then install onto the cluster.
    pub async fn install(&self, ctx: &OpCtx, cluster: &ClusterInfo, name: &str) -> KonResult<InstallReport> {
        let t0 = std::time::Instant::now();
        let installer = self.registry.resolve(name)?;
        let version = resolve_version(installer.as_ref(), &cluster.kube_version)?;
        let mut report = InstallReport { name: name.to_string(), version: version.clone(), tool_installed: false, cluster_installed: false };

        if let Some(tool) = installer.as_tool() {
            if tool.needs_tool(ctx).await {
                info!(component = %name, tool = %tool.provisioner().spec().name, "installing tool");
                tool.install_tool(ctx).await?;
                report.tool_installed = true;
            }
        }

        if let Some(target) = installer.as_cluster() {
            info!(component = %name, version = version.as_deref().unwrap_or("-"), cluster = %cluster.name, "installing component");
            target.install_component(&self.context(ctx, cluster, version)).await?;
            report.cluster_installed = true;
            counter!("component_installs_total", 1u64);
        }
        histogram!("component_install_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(report)
    }

    /// Install every catalogue entry in order; stops at the first failure.
    pub async fn install_all(&self, ctx: &OpCtx, cluster: &ClusterInfo, catalogue: &Catalogue) -> KonResult<Vec<InstallReport>> {
        catalogue.validate(&self.registry)?;
        let mut reports = Vec::with_capacity(catalogue.names().len());
        for name in catalogue.names() {
            reports.push(self.install(ctx, cluster, name).await?);
        }
        Ok(reports)
    }
}
