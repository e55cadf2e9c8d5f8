//! Konstellation installer API.
//!
//! Installers advertise capabilities instead of implementing one monolithic
//! interface: [`Versioned`] picks a version for a control plane,
//! [`ClusterInstallable`] applies itself to a cluster and [`LocallyToolable`]
//! provisions a local command-line tool. Callers dispatch on whichever of
//! `as_versioned`, `as_cluster` and `as_tool` return `Some`.

#![forbid(unsafe_code)]

use std::sync::Arc;

use kon_apply::ManifestApplier;
use kon_core::{KonResult, Layout, OpCtx, VersionPolicy};
use kon_kubehub::ObjectStore;
use kon_tools::Provisioner;
use serde::{Deserialize, Serialize};

pub mod cluster;
pub mod orchestrate;
pub mod registry;

pub use cluster::{cluster_config_kind, ComponentSpec, SyncReport};
pub use orchestrate::{InstallReport, Orchestrator};
pub use registry::{Catalogue, Registry, RegistryBuilder};

/// Target cluster identity as installers see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub name: String,
    pub kube_version: String,
}

impl ClusterInfo {
    pub fn new(name: &str, kube_version: &str) -> Self { Self { name: name.to_string(), kube_version: kube_version.to_string() } }
}

/// Everything a cluster install step may touch. Built per install by the orchestrator.
pub struct InstallContext {
    pub store: Arc<dyn ObjectStore>,
    pub applier: Arc<ManifestApplier>,
    pub layout: Layout,
    pub cluster: ClusterInfo,
    /// Resolved version when the installer is [`Versioned`].
    pub version: Option<String>,
    pub ctx: OpCtx,
}

pub trait Installer: Send + Sync {
    /// Unique registry key.
    fn name(&self) -> &str;
    fn as_versioned(&self) -> Option<&dyn Versioned> { None }
    fn as_cluster(&self) -> Option<&dyn ClusterInstallable> { None }
    fn as_tool(&self) -> Option<&dyn LocallyToolable> { None }
}

pub trait Versioned: Send + Sync {
    fn version_policy(&self) -> VersionPolicy;
}

#[async_trait::async_trait]
pub trait ClusterInstallable: Send + Sync {
    async fn install_component(&self, ic: &InstallContext) -> KonResult<()>;
}

#[async_trait::async_trait]
pub trait LocallyToolable: Send + Sync {
    fn provisioner(&self) -> &Provisioner;

    async fn needs_tool(&self, ctx: &OpCtx) -> bool { self.provisioner().needs_install(ctx).await }

    async fn install_tool(&self, ctx: &OpCtx) -> KonResult<()> { self.provisioner().install(ctx).await }
}

/// Version an installer targets on `kube_version`; None when it is not [`Versioned`].
pub fn resolve_version(installer: &dyn Installer, kube_version: &str) -> KonResult<Option<String>> {
    match installer.as_versioned() {
        Some(v) => v.version_policy().resolve(installer.name(), kube_version).map(Some),
        None => Ok(None),
    }
}
