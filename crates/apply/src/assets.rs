//! Read-only named manifest blobs keyed by relative path.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use kon_core::{KonError, KonResult, Layout};
use tracing::debug;

pub const ASSETS_ENV: &str = "KON_ASSETS_DIR";

pub trait AssetStore: Send + Sync {
    /// Whole asset by relative name (`grafana/operator.yaml`). Missing is `AssetNotFound`.
    fn open(&self, name: &str) -> KonResult<Vec<u8>>;
}

/// Assets rooted at a directory on disk.
#[derive(Debug, Clone)]
pub struct DirAssetStore {
    root: PathBuf,
}

impl DirAssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }

    /// `$KON_ASSETS_DIR`, else `<root>/deploy`.
    pub fn from_env(layout: &Layout) -> Self {
        match std::env::var_os(ASSETS_ENV).filter(|v| !v.is_empty()) {
            Some(dir) => Self::new(dir),
            None => Self::new(layout.assets_dir()),
        }
    }

    pub fn root(&self) -> &Path { &self.root }
}

impl AssetStore for DirAssetStore {
    fn open(&self, name: &str) -> KonResult<Vec<u8>> {
        let rel = Path::new(name);
        if name.is_empty() || !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(KonError::AssetNotFound(format!("{} (asset names are relative paths)", name)));
        }
        match std::fs::read(self.root.join(rel)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(KonError::AssetNotFound(format!("{} under {}", name, self.root.display()))),
            Err(e) => Err(KonError::Io(e)),
        }
    }
}

/// In-memory assets, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct MemAssetStore {
    items: BTreeMap<String, Vec<u8>>,
}

impl MemAssetStore {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, name: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(name, bytes);
        self
    }

    pub fn insert(&mut self, name: &str, bytes: impl Into<Vec<u8>>) { self.items.insert(name.to_string(), bytes.into()); }

    pub fn names(&self) -> impl Iterator<Item = &str> { self.items.keys().map(String::as_str) }
}

impl AssetStore for MemAssetStore {
    fn open(&self, name: &str) -> KonResult<Vec<u8>> { self.items.get(name).cloned().ok_or_else(|| KonError::AssetNotFound(name.to_string())) }
}

/// Recreate `target` and copy each item into it under its base name.
pub fn extract(store: &dyn AssetStore, items: &[&str], target: &Path) -> KonResult<()> {
    if target.exists() {
        std::fs::remove_dir_all(target)?;
    }
    std::fs::create_dir_all(target)?;
    for item in items {
        let bytes = store.open(item)?;
        let base = Path::new(item).file_name().ok_or_else(|| KonError::AssetNotFound(format!("{} has no file name", item)))?;
        std::fs::write(target.join(base), bytes)?;
        debug!(asset = %item, target = %target.display(), "extracted");
    }
    Ok(())
}
