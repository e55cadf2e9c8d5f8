//! Resource reconciler: fetch-or-absent, produce desired, compare, then create / update / no-op.
//!
//! The desired object comes from a caller value, an interactive edit of the
//! current object, a file or stdin. Content is compared after dropping
//! server-populated fields so formatting and ordering never trigger a write.
//! Conflicts from the control plane are returned as-is; callers that want to
//! retry refetch by calling [`Reconciler::reconcile`] again.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use kon_core::{KonError, KonResult, ObjectKey, OpCtx, ReconcileOutcome, ResourceKind};
use kon_kubehub::{placeholder, DynamicObject, ObjectStore};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

const EDIT_HEADER: &str = "# Please edit the object below. Lines beginning with a '#' will be ignored,\n# and an empty file will abort the edit.\n#\n";

/// Where the desired object comes from.
#[derive(Debug, Clone)]
pub enum DesiredSource {
    Value(DynamicObject),
    /// Serialize the current object and hand it to the edit step.
    Editor,
    File(PathBuf),
    Stdin,
}

impl DesiredSource {
    /// `-` is stdin, anything else a file path.
    pub fn from_arg(arg: &str) -> Self {
        if arg == "-" { DesiredSource::Stdin } else { DesiredSource::File(PathBuf::from(arg)) }
    }
}

/// Interactive edit step: content in, edited content out.
#[async_trait::async_trait]
pub trait Editor: Send + Sync {
    async fn edit(&self, content: &[u8], suggested_name: &str) -> KonResult<Vec<u8>>;
}

/// Runs `$VISUAL`, `$EDITOR` or `vi` on a temp file.
#[derive(Debug, Clone)]
pub struct ExternalEditor {
    command: String,
}

impl ExternalEditor {
    pub fn new(command: impl Into<String>) -> Self { Self { command: command.into() } }

    pub fn from_env() -> Self {
        let command = ["VISUAL", "EDITOR"]
            .iter()
            .filter_map(|k| std::env::var(k).ok())
            .find(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "vi".to_string());
        Self::new(command)
    }
}

#[async_trait::async_trait]
impl Editor for ExternalEditor {
    async fn edit(&self, content: &[u8], suggested_name: &str) -> KonResult<Vec<u8>> {
        use std::io::Write;
        let mut parts = self.command.split_whitespace();
        let program = parts.next().ok_or_else(|| KonError::EditAborted("no editor configured".into()))?;
        let mut tmp = tempfile::Builder::new().prefix(&format!("kon-edit-{}-", suggested_name)).suffix(".yaml").tempfile()?;
        tmp.write_all(content)?;
        tmp.flush()?;
        let status = tokio::process::Command::new(program)
            .args(parts)
            .arg(tmp.path())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| KonError::EditAborted(format!("launching {}: {}", program, e)))?;
        if !status.success() {
            return Err(KonError::EditAborted(format!("{} exited with {}", program, status)));
        }
        Ok(tokio::fs::read(tmp.path()).await?)
    }
}

/// Typed reference to one resource plus its current representation.
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    pub kind: ResourceKind,
    pub key: ObjectKey,
    /// Live object, or the identity-only placeholder when absent.
    pub object: DynamicObject,
    pub exists: bool,
}

pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    editor: Arc<dyn Editor>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self { Self { store, editor: Arc::new(ExternalEditor::from_env()) } }

    pub fn with_editor(mut self, editor: Arc<dyn Editor>) -> Self {
        self.editor = editor;
        self
    }

    /// Current object. NotFound becomes a placeholder only when `ignore_not_found`.
    pub async fn fetch(&self, ctx: &OpCtx, kind: &ResourceKind, key: &ObjectKey, ignore_not_found: bool) -> KonResult<ResourceHandle> {
        match ctx.run(&format!("get {} {}", kind, key), self.store.get(kind, key)).await {
            Ok(object) => Ok(ResourceHandle { kind: kind.clone(), key: key.clone(), object, exists: true }),
            Err(e) if e.is_not_found() && ignore_not_found => {
                debug!(kind = %kind, key = %key, "not found; starting from placeholder");
                Ok(ResourceHandle { kind: kind.clone(), key: key.clone(), object: placeholder(kind, key), exists: false })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn reconcile(
        &self,
        ctx: &OpCtx,
        kind: &ResourceKind,
        key: &ObjectKey,
        desired: DesiredSource,
        ignore_not_found: bool,
    ) -> KonResult<ReconcileOutcome> {
        let handle = self.fetch(ctx, kind, key, ignore_not_found).await?;
        let desired = self.desired(&handle, desired).await?;
        self.save(ctx, &handle, desired).await
    }

    async fn desired(&self, handle: &ResourceHandle, source: DesiredSource) -> KonResult<DynamicObject> {
        let raw = match source {
            DesiredSource::Value(obj) => return with_identity(handle, serde_json::to_value(obj).map_err(|e| KonError::DecodeFailed(e.to_string()))?),
            DesiredSource::Editor => {
                let mut doc = EDIT_HEADER.as_bytes().to_vec();
                doc.extend(to_yaml(&handle.object)?.into_bytes());
                let edited = self.editor.edit(&doc, &format!("{}-{}", handle.kind.kind.to_lowercase(), handle.key.name)).await?;
                let val = parse_yaml(&String::from_utf8_lossy(&edited))?.ok_or_else(|| KonError::EditAborted("edited content is empty".into()))?;
                return from_yaml_value(handle, val);
            }
            DesiredSource::File(path) => {
                let bytes = tokio::fs::read(&path).await.map_err(|e| KonError::DecodeFailed(format!("reading {}: {}", path.display(), e)))?;
                String::from_utf8_lossy(&bytes).into_owned()
            }
            DesiredSource::Stdin => {
                let mut bytes = Vec::new();
                tokio::io::stdin().read_to_end(&mut bytes).await?;
                String::from_utf8_lossy(&bytes).into_owned()
            }
        };
        decode(handle, &raw)
    }

    async fn save(&self, ctx: &OpCtx, handle: &ResourceHandle, mut desired: DynamicObject) -> KonResult<ReconcileOutcome> {
        let want = strip_noisy(serde_json::to_value(&desired).map_err(|e| KonError::DecodeFailed(e.to_string()))?);
        let have = strip_noisy(serde_json::to_value(&handle.object).map_err(|e| KonError::DecodeFailed(e.to_string()))?);
        if want == have {
            counter!("reconcile_unchanged_total", 1u64);
            debug!(kind = %handle.kind, key = %handle.key, "unchanged");
            return Ok(ReconcileOutcome::Unchanged);
        }
        let summary = diff_summary(&want, &have);
        let outcome = if handle.exists {
            desired.metadata.resource_version = handle.object.metadata.resource_version.clone();
            desired.metadata.uid = handle.object.metadata.uid.clone();
            ctx.run(&format!("update {} {}", handle.kind, handle.key), self.store.update(&handle.kind, &desired)).await?;
            counter!("reconcile_updated_total", 1u64);
            ReconcileOutcome::Updated
        } else {
            desired.metadata.resource_version = None;
            desired.metadata.uid = None;
            ctx.run(&format!("create {} {}", handle.kind, handle.key), self.store.create(&handle.kind, &desired)).await?;
            counter!("reconcile_created_total", 1u64);
            ReconcileOutcome::Created
        };
        info!(
            kind = %handle.kind,
            key = %handle.key,
            outcome = outcome.as_str(),
            adds = summary.adds,
            updates = summary.updates,
            removes = summary.removes,
            "reconciled"
        );
        Ok(outcome)
    }
}

fn to_yaml(obj: &DynamicObject) -> KonResult<String> {
    let mut v = serde_json::to_value(obj).map_err(|e| KonError::DecodeFailed(e.to_string()))?;
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        meta.remove("managedFields");
    }
    serde_yaml::to_string(&v).map_err(|e| KonError::DecodeFailed(e.to_string()))
}

/// YAML text → object bound to the handle's kind and key.
fn decode(handle: &ResourceHandle, text: &str) -> KonResult<DynamicObject> {
    let val = parse_yaml(text)?.ok_or_else(|| KonError::DecodeFailed("empty manifest".into()))?;
    from_yaml_value(handle, val)
}

/// None when the document holds only comments and whitespace. Comments are left to the parser
/// so `#` lines inside block scalars survive.
fn parse_yaml(text: &str) -> KonResult<Option<serde_yaml::Value>> {
    match serde_yaml::from_str::<serde_yaml::Value>(text) {
        Ok(serde_yaml::Value::Null) => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(_) if text.lines().all(|l| l.trim().is_empty() || l.trim_start().starts_with('#')) => Ok(None),
        Err(e) => Err(KonError::DecodeFailed(format!("parsing YAML: {}", e))),
    }
}

fn from_yaml_value(handle: &ResourceHandle, val: serde_yaml::Value) -> KonResult<DynamicObject> {
    let json = serde_json::to_value(val).map_err(|e| KonError::DecodeFailed(format!("converting YAML to JSON: {}", e)))?;
    with_identity(handle, json)
}

/// Fill missing identity from the handle; reject a different kind, name or namespace.
fn with_identity(handle: &ResourceHandle, mut json: Json) -> KonResult<DynamicObject> {
    let obj = json.as_object_mut().ok_or_else(|| KonError::DecodeFailed("manifest is not a mapping".into()))?;
    let expected = [("apiVersion", handle.kind.api_version()), ("kind", handle.kind.kind.clone())];
    for (field, want) in expected {
        match obj.get(field) {
            None | Some(Json::Null) => {
                obj.insert(field.to_string(), Json::String(want));
            }
            Some(Json::String(got)) if *got == want => {}
            Some(got) => return Err(KonError::DecodeFailed(format!("{} is {}, expected {}", field, got, want))),
        }
    }
    let meta = obj.entry("metadata").or_insert_with(|| Json::Object(serde_json::Map::new()));
    let meta = meta.as_object_mut().ok_or_else(|| KonError::DecodeFailed("metadata is not a mapping".into()))?;
    match meta.get("name") {
        None | Some(Json::Null) => {
            meta.insert("name".into(), Json::String(handle.key.name.clone()));
        }
        Some(Json::String(n)) if *n == handle.key.name => {}
        Some(n) => return Err(KonError::DecodeFailed(format!("metadata.name is {}, expected {}", n, handle.key.name))),
    }
    match (meta.get("namespace"), &handle.key.namespace) {
        (None | Some(Json::Null), Some(ns)) => {
            meta.insert("namespace".into(), Json::String(ns.clone()));
        }
        (None | Some(Json::Null), None) => {}
        (Some(Json::String(got)), Some(ns)) if got == ns => {}
        (Some(got), want) => {
            return Err(KonError::DecodeFailed(format!("metadata.namespace is {}, expected {}", got, want.as_deref().unwrap_or("<cluster-scoped>"))))
        }
    }
    serde_json::from_value(json).map_err(|e| KonError::DecodeFailed(format!("decoding object: {}", e)))
}

/// Remove server-populated fields before comparison.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        for k in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "selfLink"] {
            meta.remove(k);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb.iter()).filter(|(x, y)| x != y).count();
                if aa.len() > bb.len() { s.adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { s.removes += bb.len() - aa.len(); }
            }
            (av, bv) => {
                if av != bv { s.updates += 1; }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}
