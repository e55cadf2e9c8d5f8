//! Konstellation core types: errors, resource identity, operation context.

#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub mod paths;
pub mod version;

pub use paths::Layout;
pub use version::{normalize_kube_version, VersionPolicy, VersionTable};

/// Engine errors. Variants mirror the failure kinds callers branch on.
#[derive(Debug, thiserror::Error)]
pub enum KonError {
    #[error("version_unsupported: {component} has no version for kube {kube_version}")]
    VersionUnsupported { component: String, kube_version: String },
    #[error("tool_download_failed: {tool}: {message}")]
    ToolDownloadFailed { tool: String, message: String },
    #[error("tool_install_failed: {tool}: {message}")]
    ToolInstallFailed { tool: String, message: String },
    #[error("apply_failed: {0}")]
    ApplyFailed(String),
    #[error("decode_failed: {0}")]
    DecodeFailed(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("kube: {0}")]
    Kube(String),
    #[error("asset_not_found: {0}")]
    AssetNotFound(String),
    #[error("render: {0}")]
    Render(String),
    #[error("unknown_component: {0}")]
    UnknownComponent(String),
    #[error("duplicate_component: {0}")]
    DuplicateComponent(String),
    #[error("version_mismatch: {component} requested {requested}, available {available}")]
    VersionMismatch { component: String, requested: String, available: String },
    #[error("command_failed: {command}: {message}")]
    CommandFailed { command: String, message: String },
    #[error("prerequisite_not_found: {tool} - {hint}")]
    PrerequisiteNotFound { tool: String, hint: String },
    #[error("edit_aborted: {0}")]
    EditAborted(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type KonResult<T> = Result<T, KonError>;

impl KonError {
    /// Default retry predicate: failures a converging control plane may clear on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, KonError::ApplyFailed(_) | KonError::Kube(_) | KonError::Conflict(_) | KonError::Timeout(_))
    }

    pub fn is_not_found(&self) -> bool { matches!(self, KonError::NotFound(_)) }
}

/// Group/version/kind of a control-plane resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResourceKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    /// Parse `v1/Kind` or `group/v1/Kind`.
    pub fn parse(key: &str) -> KonResult<Self> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", version, kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new(group, version, kind)),
            _ => Err(KonError::DecodeFailed(format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key))),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn gvk_key(&self) -> String {
        format!("{}/{}", self.api_version(), self.kind)
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.gvk_key()) }
}

/// Namespace + name of an object. Cluster-scoped objects have no namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self { namespace: Some(namespace.to_string()), name: name.to_string() }
    }

    pub fn cluster(name: &str) -> Self { Self { namespace: None, name: name.to_string() } }

    /// Parse `ns/name` or a bare cluster-scoped `name`.
    pub fn parse(s: &str) -> KonResult<Self> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => Ok(Self::namespaced(ns, name)),
            None if !s.is_empty() => Ok(Self::cluster(s)),
            _ => Err(KonError::DecodeFailed(format!("invalid object key: {} (expect ns/name or name)", s))),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Outcome of one reconciliation attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Unchanged,
    Created,
    Updated,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Unchanged => "unchanged",
            ReconcileOutcome::Created => "created",
            ReconcileOutcome::Updated => "updated",
        }
    }
}

/// Cancellation and deadline carried through every blocking operation.
///
/// Work passed to [`OpCtx::run`] is dropped when the token fires or the
/// deadline passes; subprocesses spawned with `kill_on_drop` die with it.
#[derive(Debug, Clone, Default)]
pub struct OpCtx {
    cancel: CancellationToken,
    deadline: Option<tokio::time::Instant>,
}

impl OpCtx {
    pub fn new() -> Self { Self::default() }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(tokio::time::Instant::now() + timeout);
        self
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Child context: cancelled with the parent, keeps the parent's deadline.
    pub fn child(&self) -> Self {
        Self { cancel: self.cancel.child_token(), deadline: self.deadline }
    }

    pub fn cancel(&self) { self.cancel.cancel(); }

    pub fn is_cancelled(&self) -> bool { self.cancel.is_cancelled() }

    pub fn token(&self) -> &CancellationToken { &self.cancel }

    /// Run `fut` unless cancelled or past the deadline first. `what` names the work in errors.
    pub async fn run<T, F>(&self, what: &str, fut: F) -> KonResult<T>
    where
        F: Future<Output = KonResult<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(KonError::Cancelled(what.to_string()));
        }
        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(KonError::Cancelled(what.to_string())),
            _ = expired => Err(KonError::Timeout(what.to_string())),
            res = fut => res,
        }
    }
}
