use std::path::Path;
use std::sync::{Arc, Mutex};

use kon_api::{
    cluster_config_kind, Catalogue, ClusterInfo, ClusterInstallable, InstallContext, Installer, LocallyToolable, Orchestrator, RegistryBuilder,
    Versioned,
};
use kon_apply::{ApplyBackend, ManifestApplier, ManifestSource, MemAssetStore};
use kon_core::{KonError, KonResult, Layout, ObjectKey, OpCtx, VersionPolicy, VersionTable};
use kon_kubehub::{placeholder, MemStore, ObjectStore, WriteOp};
use kon_tools::{EnvValue, Provisioner, StaticFetcher, ToolSpec};

type Log = Arc<Mutex<Vec<String>>>;

struct NullApply;

#[async_trait::async_trait]
impl ApplyBackend for NullApply {
    async fn apply(&self, _source: &ManifestSource) -> KonResult<String> { Ok(String::new()) }
}

const TABLE: VersionTable = VersionTable::new(&[("1.17", "0.4"), ("1.18", "0.6")]);

struct Fake {
    name: &'static str,
    policy: Option<VersionPolicy>,
    fail: bool,
    log: Log,
}

impl Installer for Fake {
    fn name(&self) -> &str { self.name }
    fn as_versioned(&self) -> Option<&dyn Versioned> { self.policy.as_ref().map(|_| self as &dyn Versioned) }
    fn as_cluster(&self) -> Option<&dyn ClusterInstallable> { Some(self) }
}

impl Versioned for Fake {
    fn version_policy(&self) -> VersionPolicy { self.policy.unwrap_or(VersionPolicy::Fixed("0")) }
}

#[async_trait::async_trait]
impl ClusterInstallable for Fake {
    async fn install_component(&self, ic: &InstallContext) -> KonResult<()> {
        if self.fail {
            return Err(KonError::ApplyFailed(format!("{} exploded", self.name)));
        }
        self.log.lock().unwrap().push(format!("{}@{}@{}", self.name, ic.version.as_deref().unwrap_or("-"), ic.cluster.name));
        Ok(())
    }
}

const TOOL_URL: &str = "https://example.invalid/tool";
const TOOL_SCRIPT: &str = r#"set -e
mkdir -p "$INSTALLROOT/bin"
printf '#!/bin/sh\necho "%s"\n' "$TOOL_VERSION" > "$INSTALLROOT/bin/faketool"
chmod +x "$INSTALLROOT/bin/faketool"
"#;

struct Tooled {
    name: &'static str,
    provisioner: Provisioner,
}

impl Tooled {
    fn new(name: &'static str, root: &Path) -> Self {
        let spec = ToolSpec::script("faketool", "3.1", TOOL_URL).env("TOOL_VERSION", EnvValue::Version).env("INSTALLROOT", EnvValue::InstallRoot);
        let provisioner = Provisioner::new(spec, Layout::new(root), Arc::new(StaticFetcher::new().with(TOOL_URL, TOOL_SCRIPT)));
        Self { name, provisioner }
    }
}

impl Installer for Tooled {
    fn name(&self) -> &str { self.name }
    fn as_tool(&self) -> Option<&dyn LocallyToolable> { Some(self) }
}

#[async_trait::async_trait]
impl LocallyToolable for Tooled {
    fn provisioner(&self) -> &Provisioner { &self.provisioner }
}

fn fake(name: &'static str, policy: Option<VersionPolicy>, fail: bool, log: &Log) -> Arc<dyn Installer> {
    Arc::new(Fake { name, policy, fail, log: log.clone() })
}

fn orchestrator(builder: RegistryBuilder, store: Arc<MemStore>, root: &Path) -> Orchestrator {
    let applier = Arc::new(ManifestApplier::new(Arc::new(NullApply), Arc::new(MemAssetStore::new())));
    Orchestrator::new(Arc::new(builder.build()), store, applier, Layout::new(root))
}

fn cluster() -> ClusterInfo { ClusterInfo::new("prod", "v1.18.3") }

#[tokio::test]
async fn install_all_follows_catalogue_order_and_stops_at_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let log: Log = Arc::default();
    let builder = RegistryBuilder::new()
        .register(fake("mesh", None, false, &log))
        .unwrap()
        .register(fake("metrics", Some(VersionPolicy::ByKube(TABLE)), false, &log))
        .unwrap()
        .register(fake("broken", None, true, &log))
        .unwrap()
        .register(fake("dashboard", None, false, &log))
        .unwrap();
    let o = orchestrator(builder, Arc::new(MemStore::new()), tmp.path());

    let reports = o.install_all(&OpCtx::new(), &cluster(), &Catalogue::new(&["metrics", "mesh"])).await.unwrap();
    assert_eq!(reports[0].version.as_deref(), Some("0.6"));
    assert_eq!(*log.lock().unwrap(), vec!["metrics@0.6@prod".to_string(), "mesh@-@prod".to_string()]);

    log.lock().unwrap().clear();
    let err = o.install_all(&OpCtx::new(), &cluster(), &Catalogue::new(&["mesh", "broken", "dashboard"])).await.unwrap_err();
    assert!(matches!(err, KonError::ApplyFailed(_)));
    assert_eq!(*log.lock().unwrap(), vec!["mesh@-@prod".to_string()]);
}

#[tokio::test]
async fn unsupported_kube_version_is_fatal_before_install() {
    let tmp = tempfile::tempdir().unwrap();
    let log: Log = Arc::default();
    let builder = RegistryBuilder::new().register(fake("metrics", Some(VersionPolicy::ByKube(TABLE)), false, &log)).unwrap();
    let o = orchestrator(builder, Arc::new(MemStore::new()), tmp.path());
    let err = o.install(&OpCtx::new(), &ClusterInfo::new("old", "1.15"), "metrics").await.unwrap_err();
    assert!(matches!(err, KonError::VersionUnsupported { .. }));
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn tool_capability_is_provisioned_once() {
    let tmp = tempfile::tempdir().unwrap();
    let builder = RegistryBuilder::new().register(Arc::new(Tooled::new("mesh-cli", tmp.path()))).unwrap();
    let o = orchestrator(builder, Arc::new(MemStore::new()), tmp.path());
    let ctx = OpCtx::new();
    let first = o.install(&ctx, &cluster(), "mesh-cli").await.unwrap();
    assert!(first.tool_installed);
    assert!(!first.cluster_installed);
    let second = o.install(&ctx, &cluster(), "mesh-cli").await.unwrap();
    assert!(!second.tool_installed);
}

#[tokio::test]
async fn ensure_tools_skips_non_tool_components_and_duplicates() {
    let tmp = tempfile::tempdir().unwrap();
    let log: Log = Arc::default();
    let builder = RegistryBuilder::new()
        .register(Arc::new(Tooled::new("a", tmp.path())))
        .unwrap()
        .register(Arc::new(Tooled::new("b", tmp.path())))
        .unwrap()
        .register(fake("plain", None, false, &log))
        .unwrap();
    let o = orchestrator(builder, Arc::new(MemStore::new()), tmp.path());
    let installed = o.ensure_tools(&OpCtx::new(), &["a", "b", "plain"]).await.unwrap();
    assert_eq!(installed, vec!["faketool".to_string()]);
    assert!(o.ensure_tools(&OpCtx::new(), &["a"]).await.unwrap().is_empty());
    assert!(matches!(o.ensure_tools(&OpCtx::new(), &["zzz"]).await, Err(KonError::UnknownComponent(_))));
}

fn seed_cluster_config(store: &MemStore, spec_components: serde_json::Value, status_components: serde_json::Value) {
    let mut cc = placeholder(&cluster_config_kind(), &ObjectKey::cluster("prod"));
    cc.data = serde_json::json!({
        "spec": { "kubeVersion": "1.18", "components": spec_components },
        "status": { "components": status_components },
    });
    store.insert(&cluster_config_kind(), cc).unwrap();
}

#[tokio::test]
async fn sync_installs_missing_components_and_records_status() {
    let tmp = tempfile::tempdir().unwrap();
    let log: Log = Arc::default();
    let store = Arc::new(MemStore::new());
    seed_cluster_config(
        &store,
        serde_json::json!([{ "name": "mesh", "version": "0" }, { "name": "metrics", "version": "0.6" }]),
        serde_json::json!([{ "name": "mesh", "version": "0" }]),
    );
    let builder = RegistryBuilder::new()
        .register(fake("mesh", None, false, &log))
        .unwrap()
        .register(fake("metrics", Some(VersionPolicy::ByKube(TABLE)), false, &log))
        .unwrap();
    let o = orchestrator(builder, store.clone(), tmp.path());

    let report = o.sync_cluster_config(&OpCtx::new()).await.unwrap();
    assert_eq!(report.skipped, vec!["mesh".to_string()]);
    assert_eq!(report.installed.len(), 1);
    assert_eq!(*log.lock().unwrap(), vec!["metrics@0.6@prod".to_string()]);

    let cc = store.get(&cluster_config_kind(), &ObjectKey::cluster("prod")).await.unwrap();
    assert_eq!(cc.data["status"]["components"], serde_json::json!([{ "name": "mesh", "version": "0" }, { "name": "metrics", "version": "0.6" }]));

    // nothing left to do
    let again = o.sync_cluster_config(&OpCtx::new()).await.unwrap();
    assert!(again.installed.is_empty());
    assert_eq!(store.writes().iter().filter(|w| w.op == WriteOp::PatchStatus).count(), 1);
}

#[tokio::test]
async fn sync_rejects_version_mismatch() {
    let tmp = tempfile::tempdir().unwrap();
    let log: Log = Arc::default();
    let store = Arc::new(MemStore::new());
    seed_cluster_config(&store, serde_json::json!([{ "name": "metrics", "version": "0.4" }]), serde_json::Value::Null);
    let builder = RegistryBuilder::new().register(fake("metrics", Some(VersionPolicy::ByKube(TABLE)), false, &log)).unwrap();
    let o = orchestrator(builder, store.clone(), tmp.path());
    match o.sync_cluster_config(&OpCtx::new()).await {
        Err(KonError::VersionMismatch { component, requested, available }) => {
            assert_eq!((component.as_str(), requested.as_str(), available.as_str()), ("metrics", "0.4", "0.6"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(log.lock().unwrap().is_empty());
    assert!(store.writes().is_empty());
}

#[tokio::test]
async fn sync_records_progress_before_unknown_component() {
    let tmp = tempfile::tempdir().unwrap();
    let log: Log = Arc::default();
    let store = Arc::new(MemStore::new());
    seed_cluster_config(&store, serde_json::json!([{ "name": "mesh", "version": "0" }, { "name": "retired", "version": "1" }]), serde_json::json!([]));
    let builder = RegistryBuilder::new().register(fake("mesh", None, false, &log)).unwrap();
    let o = orchestrator(builder, store.clone(), tmp.path());
    assert!(matches!(o.sync_cluster_config(&OpCtx::new()).await, Err(KonError::UnknownComponent(_))));
    let cc = store.get(&cluster_config_kind(), &ObjectKey::cluster("prod")).await.unwrap();
    assert_eq!(cc.data["status"]["components"], serde_json::json!([{ "name": "mesh", "version": "0" }]));
}

#[tokio::test]
async fn cluster_info_comes_from_cluster_config() {
    let store = MemStore::new();
    assert!(ClusterInfo::load(&store, &OpCtx::new()).await.unwrap_err().is_not_found());
    seed_cluster_config(&store, serde_json::json!([]), serde_json::Value::Null);
    assert_eq!(ClusterInfo::load(&store, &OpCtx::new()).await.unwrap(), ClusterInfo::new("prod", "1.18"));

    let mut bare = placeholder(&cluster_config_kind(), &ObjectKey::cluster("x"));
    bare.data = serde_json::json!({ "spec": {} });
    assert!(matches!(ClusterInfo::from_cluster_config(&bare), Err(KonError::DecodeFailed(_))));
}
