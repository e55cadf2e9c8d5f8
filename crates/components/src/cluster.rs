//! Cluster plumbing: node autoscaling, ingress, the dashboard, certificates and the Konstellation operator.

use async_trait::async_trait;
use kon_api::{ClusterInstallable, InstallContext, Installer, Versioned};
use kon_core::{KonResult, VersionPolicy, VersionTable};

use crate::{version_of, AssetManifests, UrlManifest};

pub const AUTOSCALER_TEMPLATE: &str = "templates/cluster-autoscaler.yaml";

/// Autoscaler releases track the control-plane minor.
pub const AUTOSCALER_VERSIONS: VersionTable = VersionTable::new(&[("1.15", "1.15.6"), ("1.16", "1.16.5"), ("1.17", "1.17.3"), ("1.18", "1.18.2")]);

/// Renders the bundled template with the cluster name and the autoscaler image version.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterAutoscaler;

impl Installer for ClusterAutoscaler {
    fn name(&self) -> &str { "cluster-autoscaler" }
    fn as_versioned(&self) -> Option<&dyn Versioned> { Some(self) }
    fn as_cluster(&self) -> Option<&dyn ClusterInstallable> { Some(self) }
}

impl Versioned for ClusterAutoscaler {
    fn version_policy(&self) -> VersionPolicy { VersionPolicy::ByKube(AUTOSCALER_VERSIONS) }
}

#[async_trait]
impl ClusterInstallable for ClusterAutoscaler {
    async fn install_component(&self, ic: &InstallContext) -> KonResult<()> {
        let version = version_of(ic, self.name())?;
        ic.applier.apply_template(&ic.ctx, AUTOSCALER_TEMPLATE, &[("ClusterName", ic.cluster.name.as_str()), ("Version", version)]).await
    }
}

pub fn kube_dashboard() -> UrlManifest {
    UrlManifest::new("kube.dashboard", "v2.0.0-beta8", "https://raw.githubusercontent.com/kubernetes/dashboard/{version}/aio/deploy/recommended.yaml")
}

pub fn nginx_ingress() -> UrlManifest {
    UrlManifest::new("ingress.nginx", "0.30.0", "https://raw.githubusercontent.com/kubernetes/ingress-nginx/nginx-{version}/deploy/static/mandatory.yaml")
}

pub fn cert_manager() -> UrlManifest {
    UrlManifest::new("cert-manager", "0.14.1", "https://github.com/jetstack/cert-manager/releases/download/v{version}/cert-manager.yaml")
}

/// The operator ships with this build, so its version is ours.
pub fn konstellation_operator() -> AssetManifests {
    AssetManifests::new("konstellation", VersionPolicy::Fixed(env!("CARGO_PKG_VERSION")), &["operator.yaml"])
}
