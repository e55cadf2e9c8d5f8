//! In-memory object store for offline runs and tests.
//!
//! Behaves like the API server where the engine depends on it: uids and
//! resourceVersions are assigned on write, creates of existing objects and
//! updates with a stale resourceVersion are rejected as conflicts.

use std::collections::BTreeMap;
use std::sync::Mutex;

use kon_core::{KonError, KonResult, ObjectKey, ResourceKind};
use kube::core::DynamicObject;

use crate::{object_key, ObjectStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Create,
    Update,
    PatchStatus,
}

/// One accepted write, as submitted by the caller.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub op: WriteOp,
    pub kind: ResourceKind,
    pub key: ObjectKey,
    pub submitted: DynamicObject,
}

type Slot = (String, Option<String>, String);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Slot, DynamicObject>,
    next_rv: u64,
    writes: Vec<WriteRecord>,
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

fn slot(kind: &ResourceKind, key: &ObjectKey) -> Slot { (kind.gvk_key(), key.namespace.clone(), key.name.clone()) }

impl MemStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> KonResult<std::sync::MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| KonError::Kube("mem store poisoned".into()))
    }

    /// Seed an object as if it already existed. Not recorded as a write.
    pub fn insert(&self, kind: &ResourceKind, mut obj: DynamicObject) -> KonResult<DynamicObject> {
        let key = object_key(&obj)?;
        let mut inner = self.lock()?;
        inner.next_rv += 1;
        let n = inner.next_rv;
        obj.metadata.resource_version = Some(n.to_string());
        obj.metadata.uid.get_or_insert_with(|| format!("00000000-0000-0000-0000-{:012}", n));
        inner.objects.insert(slot(kind, &key), obj.clone());
        Ok(obj)
    }

    pub fn writes(&self) -> Vec<WriteRecord> { self.lock().map(|i| i.writes.clone()).unwrap_or_default() }

    pub fn snapshot(&self, kind: &ResourceKind, key: &ObjectKey) -> Option<DynamicObject> {
        self.lock().ok().and_then(|i| i.objects.get(&slot(kind, key)).cloned())
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemStore {
    async fn get(&self, kind: &ResourceKind, key: &ObjectKey) -> KonResult<DynamicObject> {
        self.lock()?.objects.get(&slot(kind, key)).cloned().ok_or_else(|| KonError::NotFound(format!("{} {}", kind, key)))
    }

    async fn create(&self, kind: &ResourceKind, obj: &DynamicObject) -> KonResult<DynamicObject> {
        let key = object_key(obj)?;
        if obj.metadata.resource_version.is_some() {
            return Err(KonError::Kube(format!("create {} {}: resourceVersion should not be set on objects to be created", kind, key)));
        }
        let mut inner = self.lock()?;
        let s = slot(kind, &key);
        if inner.objects.contains_key(&s) {
            return Err(KonError::Conflict(format!("{} {} already exists", kind, key)));
        }
        inner.next_rv += 1;
        let n = inner.next_rv;
        let mut stored = obj.clone();
        stored.metadata.resource_version = Some(n.to_string());
        stored.metadata.uid = Some(format!("00000000-0000-0000-0000-{:012}", n));
        inner.objects.insert(s, stored.clone());
        inner.writes.push(WriteRecord { op: WriteOp::Create, kind: kind.clone(), key, submitted: obj.clone() });
        Ok(stored)
    }

    async fn update(&self, kind: &ResourceKind, obj: &DynamicObject) -> KonResult<DynamicObject> {
        let key = object_key(obj)?;
        let mut inner = self.lock()?;
        let s = slot(kind, &key);
        let live = inner.objects.get(&s).cloned().ok_or_else(|| KonError::NotFound(format!("{} {}", kind, key)))?;
        if obj.metadata.resource_version != live.metadata.resource_version {
            return Err(KonError::Conflict(format!(
                "{} {}: resourceVersion {:?} does not match live {:?}",
                kind, key, obj.metadata.resource_version, live.metadata.resource_version
            )));
        }
        inner.next_rv += 1;
        let mut stored = obj.clone();
        stored.metadata.resource_version = Some(inner.next_rv.to_string());
        stored.metadata.uid = live.metadata.uid.clone();
        inner.objects.insert(s, stored.clone());
        inner.writes.push(WriteRecord { op: WriteOp::Update, kind: kind.clone(), key, submitted: obj.clone() });
        Ok(stored)
    }

    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>) -> KonResult<Vec<DynamicObject>> {
        let gvk = kind.gvk_key();
        let inner = self.lock()?;
        Ok(inner
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == gvk && namespace.map(|n| ns.as_deref() == Some(n)).unwrap_or(true))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn patch_status(&self, kind: &ResourceKind, key: &ObjectKey, status: &serde_json::Value) -> KonResult<DynamicObject> {
        let mut inner = self.lock()?;
        let s = slot(kind, key);
        let mut stored = inner.objects.get(&s).cloned().ok_or_else(|| KonError::NotFound(format!("{} {}", kind, key)))?;
        if let Some(obj) = stored.data.as_object_mut() {
            obj.insert("status".into(), status.clone());
        }
        inner.next_rv += 1;
        stored.metadata.resource_version = Some(inner.next_rv.to_string());
        inner.objects.insert(s, stored.clone());
        inner.writes.push(WriteRecord { op: WriteOp::PatchStatus, kind: kind.clone(), key: key.clone(), submitted: stored.clone() });
        Ok(stored)
    }
}
