//! Konstellation tools – provisions pinned command-line tools under the local root.
//!
//! A tool is installed by downloading its vendor script (or binary) into a
//! scratch directory, running it against a staging root, moving the staged root
//! into place and finally pointing `<root>/bin/<name>` at the new binary. The
//! link is swapped last so a failed install never leaves a half-installed
//! binary reachable.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;

use kon_core::{KonError, KonResult, Layout, OpCtx};
use metrics::counter;
use tokio::process::Command;
use tracing::{debug, info};

mod fetch;

pub use fetch::{Fetcher, HttpFetcher, StaticFetcher, DOWNLOAD_TIMEOUT_ENV};

const VERSION_VAR: &str = "{version}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Shell installer run with `sh`.
    Script { url: String },
    /// The download is the binary itself.
    Binary { url: String },
}

/// Value of an environment variable handed to the vendor installer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvValue {
    Version,
    /// Absolute path of the (staged) install root.
    InstallRoot,
    Literal(String),
}

/// Working directory of the vendor installer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkDir {
    /// Parent of the install root; installers that unpack `./<install-dir>`.
    InstallParent,
    Scratch,
}

/// Everything needed to provision one tool at one version.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub version: String,
    pub source: Source,
    pub env: Vec<(String, EnvValue)>,
    pub workdir: WorkDir,
    /// Install root directory name under the local root; may contain `{version}`.
    pub install_dir: String,
    /// Binary path relative to the install root.
    pub binary_subpath: String,
    pub version_args: Vec<String>,
    /// Expected start of the version output; may contain `{version}`.
    pub version_prefix: String,
}

impl ToolSpec {
    pub fn script(name: &str, version: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            source: Source::Script { url: url.to_string() },
            env: Vec::new(),
            workdir: WorkDir::Scratch,
            install_dir: name.to_string(),
            binary_subpath: format!("bin/{}", name),
            version_args: vec!["version".to_string()],
            version_prefix: VERSION_VAR.to_string(),
        }
    }

    pub fn binary(name: &str, version: &str, url: &str) -> Self {
        Self { source: Source::Binary { url: url.to_string() }, ..Self::script(name, version, url) }
    }

    pub fn env(mut self, key: &str, value: EnvValue) -> Self {
        self.env.push((key.to_string(), value));
        self
    }

    pub fn workdir(mut self, workdir: WorkDir) -> Self {
        self.workdir = workdir;
        self
    }

    pub fn install_dir(mut self, dir: &str) -> Self {
        self.install_dir = dir.to_string();
        self
    }

    pub fn binary_subpath(mut self, subpath: &str) -> Self {
        self.binary_subpath = subpath.to_string();
        self
    }

    pub fn version_check(mut self, args: &[&str], prefix: &str) -> Self {
        self.version_args = args.iter().map(|s| s.to_string()).collect();
        self.version_prefix = prefix.to_string();
        self
    }

    fn expand(&self, s: &str) -> String { s.replace(VERSION_VAR, &self.version) }

    pub fn install_dir_name(&self) -> String { self.expand(&self.install_dir) }

    pub fn url(&self) -> String {
        match &self.source {
            Source::Script { url } | Source::Binary { url } => self.expand(url),
        }
    }

    pub fn expected_prefix(&self) -> String { self.expand(&self.version_prefix) }
}

/// Filesystem-derived state of a tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolState {
    Absent,
    /// Present but not at the pinned version. `reported` is None when the version command failed.
    Stale { reported: Option<String> },
    Installed,
}

/// Prefix match on the version output (stdout then stderr), leading whitespace ignored.
/// Anything after the prefix, such as build metadata, is tolerated.
pub fn version_matches(output: &str, expected_prefix: &str) -> bool { output.trim_start().starts_with(expected_prefix) }

pub struct Provisioner {
    spec: ToolSpec,
    layout: Layout,
    fetcher: Arc<dyn Fetcher>,
}

impl Provisioner {
    pub fn new(spec: ToolSpec, layout: Layout, fetcher: Arc<dyn Fetcher>) -> Self { Self { spec, layout, fetcher } }

    pub fn spec(&self) -> &ToolSpec { &self.spec }

    /// Shared symlink callers execute.
    pub fn link_path(&self) -> PathBuf { self.layout.bin_path(&self.spec.name) }

    pub fn install_root(&self) -> PathBuf { self.layout.install_root(&self.spec.install_dir_name()) }

    pub async fn state(&self, ctx: &OpCtx) -> ToolState {
        let link = self.link_path();
        if !link.exists() {
            return ToolState::Absent;
        }
        let args: Vec<&str> = self.spec.version_args.iter().map(String::as_str).collect();
        let out = match ctx.run(&format!("{} version", self.spec.name), output(&link, &args, &[], None)).await {
            Ok(out) if out.status.success() => out,
            Ok(out) => {
                debug!(tool = %self.spec.name, status = %out.status, "version command failed");
                return ToolState::Stale { reported: None };
            }
            Err(e) => {
                debug!(tool = %self.spec.name, error = %e, "version command failed");
                return ToolState::Stale { reported: None };
            }
        };
        let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&out.stderr));
        if version_matches(&text, &self.spec.expected_prefix()) {
            ToolState::Installed
        } else {
            ToolState::Stale { reported: text.lines().map(str::trim).find(|l| !l.is_empty()).map(str::to_string) }
        }
    }

    pub async fn needs_install(&self, ctx: &OpCtx) -> bool { self.state(ctx).await != ToolState::Installed }

    /// Download, run and link. Does not check [`Provisioner::needs_install`] first.
    pub async fn install(&self, ctx: &OpCtx) -> KonResult<()> {
        let spec = &self.spec;
        let tool = spec.name.as_str();
        let fail = |message: String| KonError::ToolInstallFailed { tool: tool.to_string(), message };

        std::fs::create_dir_all(self.layout.root())?;
        let root = std::fs::canonicalize(self.layout.root())?;
        // removed on every exit path when dropped
        let scratch = tempfile::Builder::new().prefix(".kon-install-").tempdir_in(&root)?;
        let staging = scratch.path().join("stage");
        std::fs::create_dir_all(&staging)?;
        let install_dir = spec.install_dir_name();
        let staged_root = staging.join(&install_dir);

        let url = spec.url();
        info!(tool, version = %spec.version, url = %url, "downloading");
        let body = ctx.run(&format!("download {}", url), self.fetcher.fetch(tool, &url)).await?;

        match &spec.source {
            Source::Script { .. } => {
                let script = scratch.path().join("install.sh");
                std::fs::write(&script, &body)?;
                make_executable(&script)?;
                let envs: Vec<(String, String)> = spec
                    .env
                    .iter()
                    .map(|(k, v)| {
                        let value = match v {
                            EnvValue::Version => spec.version.clone(),
                            EnvValue::InstallRoot => staged_root.to_string_lossy().into_owned(),
                            EnvValue::Literal(s) => spec.expand(s),
                        };
                        (k.clone(), value)
                    })
                    .collect();
                let cwd = match spec.workdir {
                    WorkDir::InstallParent => staging.clone(),
                    WorkDir::Scratch => scratch.path().to_path_buf(),
                };
                let script_arg = script.to_string_lossy().into_owned();
                let out = ctx.run(&format!("{} installer", tool), output(Path::new("sh"), &[script_arg.as_str()], &envs, Some(&cwd))).await?;
                if !out.status.success() {
                    return Err(fail(format!("installer exited with {}: {}", out.status, tail(&out.stderr))));
                }
            }
            Source::Binary { .. } => {
                let dest = staged_root.join(&spec.binary_subpath);
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&dest, &body)?;
                make_executable(&dest)?;
            }
        }

        if !staged_root.join(&spec.binary_subpath).exists() {
            return Err(fail(format!("installer did not produce {}/{}", install_dir, spec.binary_subpath)));
        }

        let final_root = root.join(&install_dir);
        if final_root.exists() {
            debug!(tool, root = %final_root.display(), "removing previous install root");
            std::fs::remove_dir_all(&final_root)?;
        }
        std::fs::rename(&staged_root, &final_root).map_err(|e| fail(format!("moving install root into place: {}", e)))?;
        rebase_links(&final_root, &staged_root, &final_root).map_err(|e| fail(format!("relinking install root: {}", e)))?;

        let bin_dir = root.join("bin");
        std::fs::create_dir_all(&bin_dir)?;
        let link = bin_dir.join(tool);
        if std::fs::symlink_metadata(&link).is_ok() {
            std::fs::remove_file(&link)?;
        }
        let target = final_root.join(&spec.binary_subpath);
        std::os::unix::fs::symlink(&target, &link).map_err(|e| fail(format!("linking {}: {}", link.display(), e)))?;

        counter!("tool_installs_total", 1u64);
        info!(tool, version = %spec.version, binary = %target.display(), "installed");
        Ok(())
    }
}

/// Run `program` and capture its output, killing it if the caller gives up.
async fn output(program: &Path, args: &[&str], envs: &[(String, String)], cwd: Option<&Path>) -> KonResult<Output> {
    let mut cmd = Command::new(program);
    cmd.args(args).envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str()))).stdin(Stdio::null()).kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.output().await.map_err(|e| KonError::CommandFailed { command: program.display().to_string(), message: e.to_string() })
}

/// Run a provisioned tool and return its stdout. Non-zero exit is `CommandFailed` with stderr.
pub async fn run_captured(ctx: &OpCtx, program: &Path, args: &[&str]) -> KonResult<Vec<u8>> {
    let command = format!("{} {}", program.display(), args.join(" "));
    let out = ctx.run(&command, output(program, args, &[], None)).await?;
    if !out.status.success() {
        return Err(KonError::CommandFailed { command, message: format!("{}: {}", out.status, tail(&out.stderr)) });
    }
    Ok(out.stdout)
}

/// Fail with `PrerequisiteNotFound` for the first tool not on PATH.
pub fn check_prerequisites(tools: &[&str]) -> KonResult<()> {
    for tool in tools {
        match find_on_path(tool) {
            Some(path) => debug!(tool, path = %path.display(), "found prerequisite"),
            None => return Err(KonError::PrerequisiteNotFound { tool: tool.to_string(), hint: prerequisite_hint(tool) }),
        }
    }
    Ok(())
}

/// First executable named `tool` on PATH.
pub fn find_on_path(tool: &str) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(tool))
        .find(|p| std::fs::metadata(p).map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0).unwrap_or(false))
}

fn prerequisite_hint(tool: &str) -> String {
    let hints: HashMap<&str, &str> = HashMap::from([
        ("kubectl", "install kubectl: https://kubernetes.io/docs/tasks/tools/"),
        ("sh", "a POSIX shell is required to run vendor installers"),
    ]);
    hints.get(tool).map(|s| s.to_string()).unwrap_or_else(|| format!("install {} and make sure it is on PATH", tool))
}

fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

/// Point absolute symlinks under `dir` that target `from/...` at `to/...` instead.
fn rebase_links(dir: &Path, from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let meta = std::fs::symlink_metadata(&path)?;
        if meta.file_type().is_symlink() {
            let target = std::fs::read_link(&path)?;
            if let Ok(rest) = target.strip_prefix(from) {
                std::fs::remove_file(&path)?;
                std::os::unix::fs::symlink(to.join(rest), &path)?;
            }
        } else if meta.is_dir() {
            rebase_links(&path, from, to)?;
        }
    }
    Ok(())
}

fn tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(20)..].join("\n")
}
