//! Konstellation add-on catalogue: every installer the engine ships with.

#![forbid(unsafe_code)]

use std::sync::Arc;

use kon_api::{Catalogue, ClusterInstallable, InstallContext, Installer, Registry, RegistryBuilder, Versioned};
use kon_apply::{retry_if, RetryPolicy};
use kon_core::{KonError, KonResult, Layout, VersionPolicy};
use kon_tools::Fetcher;

pub mod cluster;
pub mod mesh;
pub mod monitoring;

pub use cluster::{ClusterAutoscaler, AUTOSCALER_TEMPLATE};
pub use mesh::{Istio, Linkerd};

/// Install order for "install everything": the mesh comes before anything relying on injection.
pub const DEFAULT_CATALOGUE: &[&str] =
    &["cluster-autoscaler", "istio", "metrics-server", "kube-prometheus", "grafana-operator", "kube.dashboard", "konstellation"];

pub fn default_catalogue() -> Catalogue { Catalogue::new(DEFAULT_CATALOGUE) }

/// Registry of all shipped installers. Tool-backed installers provision under `layout`.
pub fn default_registry(layout: &Layout, fetcher: Arc<dyn Fetcher>) -> KonResult<Registry> {
    Ok(RegistryBuilder::new()
        .register(Arc::new(ClusterAutoscaler))?
        .register(Arc::new(Istio::new(layout.clone(), fetcher.clone())))?
        .register(Arc::new(Linkerd::new(layout.clone(), fetcher)))?
        .register(Arc::new(monitoring::kube_prometheus()))?
        .register(Arc::new(monitoring::prometheus_operator()))?
        .register(Arc::new(monitoring::grafana_operator()))?
        .register(Arc::new(monitoring::metrics_server()))?
        .register(Arc::new(cluster::kube_dashboard()))?
        .register(Arc::new(cluster::nginx_ingress()))?
        .register(Arc::new(cluster::cert_manager()))?
        .register(Arc::new(cluster::konstellation_operator()))?
        .build())
}

fn version_of<'a>(ic: &'a InstallContext, component: &str) -> KonResult<&'a str> {
    ic.version.as_deref().ok_or_else(|| KonError::VersionUnsupported { component: component.to_string(), kube_version: ic.cluster.kube_version.clone() })
}

/// Apply each asset in turn, retrying transient failures while freshly installed CRDs settle.
async fn apply_assets_retried(ic: &InstallContext, component: &str, assets: &[String]) -> KonResult<()> {
    let policy = RetryPolicy::from_env();
    for asset in assets {
        let what = format!("{} {}", component, asset);
        retry_if(&policy, &what, KonError::is_transient, || ic.applier.apply_asset(&ic.ctx, asset)).await?;
    }
    Ok(())
}

/// One remote manifest pinned to a fixed version; `{version}` in the URL is substituted.
#[derive(Debug, Clone)]
pub struct UrlManifest {
    name: &'static str,
    version: &'static str,
    url: &'static str,
}

impl UrlManifest {
    pub const fn new(name: &'static str, version: &'static str, url: &'static str) -> Self { Self { name, version, url } }

    pub fn url(&self) -> String { self.url.replace("{version}", self.version) }
}

impl Installer for UrlManifest {
    fn name(&self) -> &str { self.name }
    fn as_versioned(&self) -> Option<&dyn Versioned> { Some(self) }
    fn as_cluster(&self) -> Option<&dyn ClusterInstallable> { Some(self) }
}

impl Versioned for UrlManifest {
    fn version_policy(&self) -> VersionPolicy { VersionPolicy::Fixed(self.version) }
}

#[async_trait::async_trait]
impl ClusterInstallable for UrlManifest {
    async fn install_component(&self, ic: &InstallContext) -> KonResult<()> { ic.applier.apply_url(&ic.ctx, &self.url()).await }
}

/// Bundled manifests applied in order; `{version}` in asset names is the resolved version.
#[derive(Debug, Clone)]
pub struct AssetManifests {
    name: &'static str,
    policy: VersionPolicy,
    assets: &'static [&'static str],
    retried: bool,
}

impl AssetManifests {
    pub const fn new(name: &'static str, policy: VersionPolicy, assets: &'static [&'static str]) -> Self { Self { name, policy, assets, retried: false } }

    /// Retry each apply while the control plane catches up with CRDs the previous one created.
    pub const fn retried(mut self) -> Self {
        self.retried = true;
        self
    }

    pub fn asset_names(&self, version: &str) -> Vec<String> { self.assets.iter().map(|a| a.replace("{version}", version)).collect() }
}

impl Installer for AssetManifests {
    fn name(&self) -> &str { self.name }
    fn as_versioned(&self) -> Option<&dyn Versioned> { Some(self) }
    fn as_cluster(&self) -> Option<&dyn ClusterInstallable> { Some(self) }
}

impl Versioned for AssetManifests {
    fn version_policy(&self) -> VersionPolicy { self.policy }
}

#[async_trait::async_trait]
impl ClusterInstallable for AssetManifests {
    async fn install_component(&self, ic: &InstallContext) -> KonResult<()> {
        let assets = self.asset_names(version_of(ic, self.name)?);
        if self.retried {
            return apply_assets_retried(ic, self.name, &assets).await;
        }
        for asset in &assets {
            ic.applier.apply_asset(&ic.ctx, asset).await?;
        }
        Ok(())
    }
}
