//! Konstellation apply: manifest applier, templates, retries and the resource reconciler.

#![forbid(unsafe_code)]

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use kon_core::{KonError, KonResult, OpCtx};
use metrics::{counter, histogram};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

pub mod assets;
pub mod reconcile;
pub mod retry;

pub use assets::{extract, AssetStore, DirAssetStore, MemAssetStore};
pub use reconcile::{diff_summary, strip_noisy, DesiredSource, DiffSummary, Editor, ExternalEditor, Reconciler, ResourceHandle};
pub use retry::{retry, retry_if, Delay, RetryPolicy};

pub const KUBECTL_ENV: &str = "KON_KUBECTL";

/// What gets handed to the apply mechanism.
#[derive(Debug, Clone)]
pub enum ManifestSource {
    Url(String),
    Bytes(Vec<u8>),
    File(PathBuf),
}

impl ManifestSource {
    /// The `-f` argument for this source.
    pub fn target(&self) -> String {
        match self {
            ManifestSource::Url(u) => u.clone(),
            ManifestSource::Bytes(_) => "-".to_string(),
            ManifestSource::File(p) => p.to_string_lossy().into_owned(),
        }
    }
}

/// Declarative merge-apply of a manifest. Returns the tool's stdout.
#[async_trait::async_trait]
pub trait ApplyBackend: Send + Sync {
    async fn apply(&self, source: &ManifestSource) -> KonResult<String>;
}

/// `kubectl apply -f <target> [--context <ctx>]`.
#[derive(Debug, Clone)]
pub struct Kubectl {
    binary: String,
    context: Option<String>,
}

impl Kubectl {
    /// Binary from `KON_KUBECTL`, else `kubectl` on PATH.
    pub fn new(context: Option<String>) -> Self {
        let binary = std::env::var(KUBECTL_ENV).ok().filter(|s| !s.is_empty()).unwrap_or_else(|| "kubectl".to_string());
        Self { binary, context }
    }

    pub fn with_binary(binary: impl Into<String>, context: Option<String>) -> Self { Self { binary: binary.into(), context } }

    pub fn binary(&self) -> &str { &self.binary }

    fn args(&self, target: &str) -> Vec<String> {
        let mut args = vec!["apply".to_string(), "-f".to_string(), target.to_string()];
        if let Some(ctx) = &self.context {
            args.push("--context".to_string());
            args.push(ctx.clone());
        }
        args
    }
}

#[async_trait::async_trait]
impl ApplyBackend for Kubectl {
    async fn apply(&self, source: &ManifestSource) -> KonResult<String> {
        let target = source.target();
        let stdin = if matches!(source, ManifestSource::Bytes(_)) { Stdio::piped() } else { Stdio::null() };
        let mut child = Command::new(&self.binary)
            .args(self.args(&target))
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| KonError::ApplyFailed(format!("spawning {}: {}", self.binary, e)))?;

        // fed while output is collected; kubectl reports per object before stdin is drained
        let pipe = child.stdin.take();
        let feed = async move {
            match (pipe, source) {
                (Some(mut pipe), ManifestSource::Bytes(bytes)) => {
                    let written = pipe.write_all(bytes).await;
                    // closes stdin so the tool sees EOF
                    drop(pipe);
                    written
                }
                _ => Ok(()),
            }
        };
        let (written, output) = tokio::join!(feed, child.wait_with_output());

        let output = output.map_err(|e| KonError::ApplyFailed(format!("waiting for {}: {}", self.binary, e)))?;
        if !output.status.success() {
            return Err(KonError::ApplyFailed(format!(
                "{} apply -f {} ({}): {}",
                self.binary,
                target,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        written.map_err(|e| KonError::ApplyFailed(format!("writing manifest to {}: {}", self.binary, e)))?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Applies URLs, byte streams, assets and rendered templates through one backend.
pub struct ManifestApplier {
    backend: Arc<dyn ApplyBackend>,
    assets: Arc<dyn AssetStore>,
}

impl ManifestApplier {
    pub fn new(backend: Arc<dyn ApplyBackend>, assets: Arc<dyn AssetStore>) -> Self { Self { backend, assets } }

    pub fn assets(&self) -> &dyn AssetStore { self.assets.as_ref() }

    pub async fn apply_url(&self, ctx: &OpCtx, url: &str) -> KonResult<()> { self.apply(ctx, ManifestSource::Url(url.to_string()), url).await }

    pub async fn apply_stream(&self, ctx: &OpCtx, bytes: Vec<u8>) -> KonResult<()> {
        let what = format!("stream ({} bytes)", bytes.len());
        self.apply(ctx, ManifestSource::Bytes(bytes), &what).await
    }

    /// Copy one asset into a temp file and apply the file path. The file is removed afterwards.
    pub async fn apply_asset(&self, ctx: &OpCtx, name: &str) -> KonResult<()> {
        let bytes = self.assets.open(name)?;
        let mut tmp = tempfile::Builder::new().prefix("kon-asset-").suffix(".yaml").tempfile()?;
        tmp.write_all(&bytes)?;
        tmp.flush()?;
        let res = self.apply(ctx, ManifestSource::File(tmp.path().to_path_buf()), name).await;
        drop(tmp);
        res
    }

    /// Render a named template with `params` and apply the result as a stream.
    pub async fn apply_template(&self, ctx: &OpCtx, name: &str, params: &[(&str, &str)]) -> KonResult<()> {
        let raw = self.assets.open(name)?;
        let text = String::from_utf8(raw).map_err(|e| KonError::Render(format!("{}: not utf-8: {}", name, e)))?;
        let rendered = render_template(&text, params).map_err(|e| match e {
            KonError::Render(m) => KonError::Render(format!("{}: {}", name, m)),
            other => other,
        })?;
        self.apply(ctx, ManifestSource::Bytes(rendered.into_bytes()), name).await
    }

    async fn apply(&self, ctx: &OpCtx, source: ManifestSource, what: &str) -> KonResult<()> {
        let t0 = std::time::Instant::now();
        counter!("apply_attempts_total", 1u64);
        let res = ctx.run(&format!("apply {}", what), self.backend.apply(&source)).await;
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(out) => {
                debug!(manifest = %what, output = %out.trim(), "applied");
                Ok(())
            }
            Err(e) => {
                counter!("apply_failures_total", 1u64);
                Err(e)
            }
        }
    }
}

/// Substitute `{{ .Key }}` placeholders. A placeholder with no parameter is an error.
pub fn render_template(text: &str, params: &[(&str, &str)]) -> KonResult<String> {
    let re = regex::Regex::new(r"\{\{\s*\.(\w+)\s*\}\}").map_err(|e| KonError::Render(e.to_string()))?;
    let lookup = |key: &str| params.iter().find(|(k, _)| *k == key).map(|(_, v)| *v);
    let mut missing: Vec<String> = re.captures_iter(text).map(|c| c[1].to_string()).filter(|k| lookup(k.as_str()).is_none()).collect();
    if !missing.is_empty() {
        missing.sort();
        missing.dedup();
        return Err(KonError::Render(format!("missing template parameters: {}", missing.join(", "))));
    }
    Ok(re.replace_all(text, |c: &regex::Captures| lookup(&c[1]).unwrap_or_default().to_string()).into_owned())
}
