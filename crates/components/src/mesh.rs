//! Service meshes. Both ship a CLI that renders the control-plane manifest, so
//! installing onto a cluster means provisioning the CLI first.

use std::sync::Arc;

use async_trait::async_trait;
use kon_api::{ClusterInstallable, InstallContext, Installer, LocallyToolable, Versioned};
use kon_core::{KonResult, Layout, VersionPolicy};
use kon_tools::{run_captured, EnvValue, Fetcher, Provisioner, ToolSpec, WorkDir};
use tracing::debug;

pub const ISTIO_VERSION: &str = "1.5.1";
pub const LINKERD_VERSION: &str = "stable-2.6.1";

const ISTIO_MANIFEST_ARGS: &[&str] = &[
    "manifest",
    "generate",
    "--set",
    "components.sidecarInjector.enabled=true",
    "--set",
    "addonComponents.kiali.enabled=true",
    "--set",
    "addonComponents.grafana.enabled=true",
];

/// Render with the provisioned CLI and pipe the result to the applier.
async fn apply_generated(ic: &InstallContext, tool: &Provisioner, args: &[&str]) -> KonResult<()> {
    let manifest = run_captured(&ic.ctx, &tool.link_path(), args).await?;
    debug!(tool = %tool.spec().name, bytes = manifest.len(), "generated manifest");
    ic.applier.apply_stream(&ic.ctx, manifest).await
}

pub struct Istio {
    tool: Provisioner,
}

impl Istio {
    pub fn spec() -> ToolSpec {
        ToolSpec::script("istioctl", ISTIO_VERSION, "https://istio.io/downloadIstio")
            .env("ISTIO_VERSION", EnvValue::Version)
            .workdir(WorkDir::InstallParent)
            .install_dir("istio-{version}")
            .binary_subpath("bin/istioctl")
            .version_check(&["--remote=false", "version"], "{version}")
    }

    pub fn new(layout: Layout, fetcher: Arc<dyn Fetcher>) -> Self { Self { tool: Provisioner::new(Self::spec(), layout, fetcher) } }
}

impl Installer for Istio {
    fn name(&self) -> &str { "istio" }
    fn as_versioned(&self) -> Option<&dyn Versioned> { Some(self) }
    fn as_cluster(&self) -> Option<&dyn ClusterInstallable> { Some(self) }
    fn as_tool(&self) -> Option<&dyn LocallyToolable> { Some(self) }
}

impl Versioned for Istio {
    fn version_policy(&self) -> VersionPolicy { VersionPolicy::Fixed(ISTIO_VERSION) }
}

#[async_trait]
impl ClusterInstallable for Istio {
    async fn install_component(&self, ic: &InstallContext) -> KonResult<()> { apply_generated(ic, &self.tool, ISTIO_MANIFEST_ARGS).await }
}

#[async_trait]
impl LocallyToolable for Istio {
    fn provisioner(&self) -> &Provisioner { &self.tool }
}

pub struct Linkerd {
    tool: Provisioner,
}

impl Linkerd {
    /// The vendor script installs into `$INSTALLROOT` and links `bin/linkerd` to a versioned binary.
    pub fn spec() -> ToolSpec {
        ToolSpec::script("linkerd", LINKERD_VERSION, "https://run.linkerd.io/install")
            .env("LINKERD2_VERSION", EnvValue::Version)
            .env("INSTALLROOT", EnvValue::InstallRoot)
            .install_dir("linkerd2")
            .binary_subpath("bin/linkerd")
            .version_check(&["version"], "Client version: {version}")
    }

    pub fn new(layout: Layout, fetcher: Arc<dyn Fetcher>) -> Self { Self { tool: Provisioner::new(Self::spec(), layout, fetcher) } }
}

impl Installer for Linkerd {
    fn name(&self) -> &str { "linkerd" }
    fn as_versioned(&self) -> Option<&dyn Versioned> { Some(self) }
    fn as_cluster(&self) -> Option<&dyn ClusterInstallable> { Some(self) }
    fn as_tool(&self) -> Option<&dyn LocallyToolable> { Some(self) }
}

impl Versioned for Linkerd {
    fn version_policy(&self) -> VersionPolicy { VersionPolicy::Fixed(LINKERD_VERSION) }
}

#[async_trait]
impl ClusterInstallable for Linkerd {
    async fn install_component(&self, ic: &InstallContext) -> KonResult<()> { apply_generated(ic, &self.tool, &["install"]).await }
}

#[async_trait]
impl LocallyToolable for Linkerd {
    fn provisioner(&self) -> &Provisioner { &self.tool }
}
