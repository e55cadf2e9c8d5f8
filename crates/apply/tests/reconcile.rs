use std::sync::{Arc, Mutex};

use kon_apply::{DesiredSource, Editor, Reconciler};
use kon_core::{KonError, KonResult, ObjectKey, OpCtx, ReconcileOutcome, ResourceKind};
use kon_kubehub::{placeholder, MemStore, ObjectStore, WriteOp};

/// Replaces the edited document with a fixed reply and records what it was shown.
struct Scripted {
    reply: String,
    shown: Mutex<Option<String>>,
}

impl Scripted {
    fn new(reply: &str) -> Arc<Self> { Arc::new(Self { reply: reply.to_string(), shown: Mutex::new(None) }) }
}

#[async_trait::async_trait]
impl Editor for Scripted {
    async fn edit(&self, content: &[u8], _suggested_name: &str) -> KonResult<Vec<u8>> {
        *self.shown.lock().unwrap() = Some(String::from_utf8_lossy(content).into_owned());
        Ok(self.reply.clone().into_bytes())
    }
}

fn cm() -> ResourceKind { ResourceKind::new("", "v1", "ConfigMap") }

fn key() -> ObjectKey { ObjectKey::namespaced("kon-system", "settings") }

fn seeded(data: serde_json::Value) -> Arc<MemStore> {
    let store = Arc::new(MemStore::new());
    let mut obj = placeholder(&cm(), &key());
    obj.data = serde_json::json!({ "data": data });
    store.insert(&cm(), obj).unwrap();
    store
}

#[tokio::test]
async fn equal_content_is_unchanged_without_write() {
    let store = seeded(serde_json::json!({ "a": "1", "b": "2" }));
    // different key order and formatting, same content
    let editor = Scripted::new("# edited\nkind: ConfigMap\napiVersion: v1\nmetadata: {name: settings, namespace: kon-system}\ndata:\n  b: \"2\"\n  a: \"1\"\n");
    let r = Reconciler::new(store.clone()).with_editor(editor.clone());
    let out = r.reconcile(&OpCtx::new(), &cm(), &key(), DesiredSource::Editor, false).await.unwrap();
    assert_eq!(out, ReconcileOutcome::Unchanged);
    assert!(store.writes().is_empty());
    let shown = editor.shown.lock().unwrap().clone().unwrap();
    assert!(shown.starts_with("# Please edit the object below."));
    assert!(shown.contains("settings"));
}

#[tokio::test]
async fn changed_content_updates_with_live_resource_version() {
    let store = seeded(serde_json::json!({ "a": "1" }));
    let live = store.get(&cm(), &key()).await.unwrap();
    let editor = Scripted::new("metadata:\n  name: settings\n  resourceVersion: \"999\"\ndata:\n  a: \"2\"\n");
    let r = Reconciler::new(store.clone()).with_editor(editor);
    let out = r.reconcile(&OpCtx::new(), &cm(), &key(), DesiredSource::Editor, false).await.unwrap();
    assert_eq!(out, ReconcileOutcome::Updated);
    let writes = store.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].op, WriteOp::Update);
    assert_eq!(writes[0].submitted.metadata.resource_version, live.metadata.resource_version);
    assert_eq!(writes[0].submitted.metadata.uid, live.metadata.uid);
    let now = store.get(&cm(), &key()).await.unwrap();
    assert_eq!(now.data["data"]["a"], "2");
}

#[tokio::test]
async fn absent_object_is_created_when_allowed() {
    let store = Arc::new(MemStore::new());
    let r = Reconciler::new(store.clone());
    let mut desired = placeholder(&cm(), &key());
    desired.data = serde_json::json!({ "data": { "x": "y" } });
    desired.metadata.resource_version = Some("5".into());
    let out = r.reconcile(&OpCtx::new(), &cm(), &key(), DesiredSource::Value(desired), true).await.unwrap();
    assert_eq!(out, ReconcileOutcome::Created);
    let writes = store.writes();
    assert_eq!(writes[0].op, WriteOp::Create);
    assert!(writes[0].submitted.metadata.resource_version.is_none());
}

#[tokio::test]
async fn absent_object_is_an_error_unless_allowed() {
    let store = Arc::new(MemStore::new());
    let r = Reconciler::new(store.clone());
    let err = r.reconcile(&OpCtx::new(), &cm(), &key(), DesiredSource::Value(placeholder(&cm(), &key())), false).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn untouched_placeholder_is_unchanged() {
    let store = Arc::new(MemStore::new());
    let r = Reconciler::new(store.clone());
    let out = r.reconcile(&OpCtx::new(), &cm(), &key(), DesiredSource::Value(placeholder(&cm(), &key())), true).await.unwrap();
    assert_eq!(out, ReconcileOutcome::Unchanged);
    assert!(store.writes().is_empty());
}

#[tokio::test]
async fn malformed_edit_aborts_without_mutation() {
    let store = seeded(serde_json::json!({ "a": "1" }));
    let r = Reconciler::new(store.clone()).with_editor(Scripted::new("data: [unclosed\n"));
    let err = r.reconcile(&OpCtx::new(), &cm(), &key(), DesiredSource::Editor, false).await.unwrap_err();
    assert!(matches!(err, KonError::DecodeFailed(_)));
    assert!(store.writes().is_empty());
}

#[tokio::test]
async fn empty_edit_aborts() {
    let store = seeded(serde_json::json!({ "a": "1" }));
    let r = Reconciler::new(store.clone()).with_editor(Scripted::new("# only comments\n\n"));
    let err = r.reconcile(&OpCtx::new(), &cm(), &key(), DesiredSource::Editor, false).await.unwrap_err();
    assert!(matches!(err, KonError::EditAborted(_)));
    assert!(store.writes().is_empty());
}

#[tokio::test]
async fn file_source_is_decoded() {
    let store = seeded(serde_json::json!({ "a": "1" }));
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cm.yaml");
    std::fs::write(&path, "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\n  namespace: kon-system\ndata:\n  a: \"1\"\n  c: \"3\"\n").unwrap();
    let r = Reconciler::new(store.clone());
    let out = r.reconcile(&OpCtx::new(), &cm(), &key(), DesiredSource::from_arg(path.to_str().unwrap()), false).await.unwrap();
    assert_eq!(out, ReconcileOutcome::Updated);
}

#[tokio::test]
async fn conflict_propagates_without_retry() {
    struct Racing(Arc<MemStore>);

    #[async_trait::async_trait]
    impl Editor for Racing {
        async fn edit(&self, _content: &[u8], _name: &str) -> KonResult<Vec<u8>> {
            // someone else writes while the user is editing
            let live = self.0.get(&cm(), &key()).await?;
            self.0.update(&cm(), &live).await?;
            Ok(b"data:\n  a: \"mine\"\n".to_vec())
        }
    }

    let store = seeded(serde_json::json!({ "a": "1" }));
    let r = Reconciler::new(store.clone()).with_editor(Arc::new(Racing(store.clone())));
    let err = r.reconcile(&OpCtx::new(), &cm(), &key(), DesiredSource::Editor, false).await.unwrap_err();
    assert!(matches!(err, KonError::Conflict(_)));
    assert_eq!(store.writes().len(), 1);
}

/// Hands back exactly what it was shown.
struct Unedited;

#[async_trait::async_trait]
impl Editor for Unedited {
    async fn edit(&self, content: &[u8], _name: &str) -> KonResult<Vec<u8>> { Ok(content.to_vec()) }
}

const SCRIPT: &str = "#!/bin/sh\n# keep me\necho hi\n";

#[tokio::test]
async fn unedited_script_with_hash_lines_is_unchanged() {
    let store = seeded(serde_json::json!({ "run.sh": SCRIPT }));
    let r = Reconciler::new(store.clone()).with_editor(Arc::new(Unedited));
    let out = r.reconcile(&OpCtx::new(), &cm(), &key(), DesiredSource::Editor, false).await.unwrap();
    assert_eq!(out, ReconcileOutcome::Unchanged);
    assert!(store.writes().is_empty());
    assert_eq!(store.get(&cm(), &key()).await.unwrap().data["data"]["run.sh"], SCRIPT);
}

#[tokio::test]
async fn file_with_literal_block_script_is_unchanged() {
    let store = seeded(serde_json::json!({ "run.sh": SCRIPT }));
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cm.yaml");
    let doc = "# desired state\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\n  namespace: kon-system\ndata:\n  run.sh: |\n    #!/bin/sh\n    # keep me\n    echo hi\n";
    std::fs::write(&path, doc).unwrap();
    let r = Reconciler::new(store.clone());
    let out = r.reconcile(&OpCtx::new(), &cm(), &key(), DesiredSource::File(path), false).await.unwrap();
    assert_eq!(out, ReconcileOutcome::Unchanged);
    assert!(store.writes().is_empty());
}
