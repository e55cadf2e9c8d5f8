//! Local filesystem layout: `<root>/bin` holds tool symlinks, `<root>/<install-dir>` holds install roots.

use std::path::{Path, PathBuf};

pub const ROOT_ENV: &str = "KONSTELLATION_ROOT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }

    /// `$KONSTELLATION_ROOT`, else `~/.konstellation`.
    pub fn from_env() -> Self {
        if let Some(dir) = std::env::var_os(ROOT_ENV).filter(|v| !v.is_empty()) {
            return Self::new(dir);
        }
        if let Some(home) = std::env::var_os("HOME") {
            let mut p = PathBuf::from(home);
            p.push(".konstellation");
            return Self::new(p);
        }
        // Fallback to current directory
        Self::new("konstellation")
    }

    pub fn root(&self) -> &Path { &self.root }

    pub fn bin_dir(&self) -> PathBuf { self.root.join("bin") }

    /// Shared symlink location for a provisioned tool.
    pub fn bin_path(&self, tool: &str) -> PathBuf { self.bin_dir().join(tool) }

    pub fn install_root(&self, dir_name: &str) -> PathBuf { self.root.join(dir_name) }

    /// Default asset store directory.
    pub fn assets_dir(&self) -> PathBuf { self.root.join("deploy") }
}
