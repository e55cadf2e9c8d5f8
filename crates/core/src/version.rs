//! Control-plane version → add-on version selection.

use crate::{KonError, KonResult};

/// Static lookup from kube `major.minor` to a pinned add-on version.
#[derive(Debug, Clone, Copy)]
pub struct VersionTable {
    entries: &'static [(&'static str, &'static str)],
}

impl VersionTable {
    pub const fn new(entries: &'static [(&'static str, &'static str)]) -> Self { Self { entries } }

    pub fn lookup(&self, kube_version: &str) -> Option<&'static str> {
        let minor = normalize_kube_version(kube_version)?;
        self.entries.iter().find(|(k, _)| *k == minor).map(|(_, v)| *v)
    }

    pub fn kube_versions(&self) -> impl Iterator<Item = &'static str> + '_ { self.entries.iter().map(|(k, _)| *k) }
}

/// How an installer picks its version. Explicit per installer, never inferred.
#[derive(Debug, Clone, Copy)]
pub enum VersionPolicy {
    /// Same version regardless of the control plane.
    Fixed(&'static str),
    /// Pinned per control-plane minor; unknown minors are unsupported.
    ByKube(VersionTable),
}

impl VersionPolicy {
    pub fn resolve(&self, component: &str, kube_version: &str) -> KonResult<String> {
        match self {
            VersionPolicy::Fixed(v) => Ok((*v).to_string()),
            VersionPolicy::ByKube(table) => table.lookup(kube_version).map(str::to_string).ok_or_else(|| KonError::VersionUnsupported {
                component: component.to_string(),
                kube_version: kube_version.to_string(),
            }),
        }
    }
}

/// `v1.18.9-eks-1` → `1.18`. Returns None unless both parts are numeric.
pub fn normalize_kube_version(raw: &str) -> Option<String> {
    let s = raw.trim();
    let s = s.strip_prefix('v').unwrap_or(s);
    let mut parts = s.split('.');
    let major = parts.next()?;
    let minor_raw = parts.next()?;
    let minor: String = minor_raw.chars().take_while(|c| c.is_ascii_digit()).collect();
    if major.is_empty() || !major.chars().all(|c| c.is_ascii_digit()) || minor.is_empty() {
        return None;
    }
    Some(format!("{}.{}", major, minor))
}
