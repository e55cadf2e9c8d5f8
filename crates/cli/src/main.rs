use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kon_api::{resolve_version, Catalogue, ClusterInfo, Orchestrator, Registry};
use kon_apply::{DesiredSource, DirAssetStore, Kubectl, ManifestApplier, Reconciler};
use kon_components::{default_catalogue, default_registry};
use kon_core::{KonError, Layout, ObjectKey, OpCtx, ResourceKind};
use kon_kubehub::{KubeStore, ObjectStore};
use kon_tools::{check_prerequisites, HttpFetcher};
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "konctl", version, about = "Install and reconcile Konstellation components")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubeconfig context (default: current context)
    #[arg(long, global = true, env = "KON_CONTEXT")]
    context: Option<String>,

    /// Directory holding bundled manifests (default: <root>/deploy)
    #[arg(long = "assets-dir", global = true, env = "KON_ASSETS_DIR")]
    assets_dir: Option<std::path::PathBuf>,

    /// Cluster name; read from the ClusterConfig when omitted
    #[arg(long = "cluster-name", global = true, env = "KON_CLUSTER_NAME")]
    cluster_name: Option<String>,

    /// Control-plane version, e.g. 1.18; read from the ClusterConfig when omitted
    #[arg(long = "kube-version", global = true, env = "KON_KUBE_VERSION")]
    kube_version: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List registered components and the version each would install
    Components,
    /// Provision local tools for the named components (default: all tool-backed ones)
    Tools { names: Vec<String> },
    /// Install components onto the cluster (default: the standard catalogue, in order)
    Install { names: Vec<String> },
    /// Install what the cluster's ClusterConfig lists and record it in its status
    Sync,
    /// Apply a manifest from a file, URL or stdin (-)
    Apply {
        #[arg(short = 'f', long = "filename")]
        file: String,
    },
    /// Reconcile one object from an editor session, a file or stdin
    Edit {
        /// GVK key, e.g. "v1/ConfigMap" or "k11n.dev/v1alpha1/ClusterConfig"
        gvk: String,
        /// ns/name, or name for cluster-scoped objects
        key: String,
        /// Desired object from a file or stdin (-) instead of the editor
        #[arg(short = 'f', long = "filename")]
        file: Option<String>,
        /// Create the object when it does not exist
        #[arg(long, action = ArgAction::SetTrue)]
        create: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("KON_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KON_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KON_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancelled on Ctrl-C; in-flight subprocesses are killed when their futures drop.
fn op_ctx() -> OpCtx {
    let ctx = OpCtx::new();
    let token = ctx.token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; cancelling");
            token.cancel();
        }
    });
    ctx
}

fn print_json<T: serde::Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

struct Env {
    layout: Layout,
    registry: Arc<Registry>,
}

impl Env {
    fn load() -> Result<Self> {
        let layout = Layout::from_env();
        let fetcher = HttpFetcher::from_env()?;
        let registry = default_registry(&layout, Arc::new(fetcher))?;
        Ok(Self { layout, registry: Arc::new(registry) })
    }

    fn applier(&self, cli: &Cli) -> Arc<ManifestApplier> {
        let assets = match &cli.assets_dir {
            Some(dir) => DirAssetStore::new(dir.clone()),
            None => DirAssetStore::from_env(&self.layout),
        };
        Arc::new(ManifestApplier::new(Arc::new(Kubectl::new(cli.context.clone())), Arc::new(assets)))
    }

    async fn orchestrator(&self, cli: &Cli) -> Result<Orchestrator> {
        let store = KubeStore::for_context(cli.context.as_deref()).await?;
        Ok(Orchestrator::new(self.registry.clone(), Arc::new(store), self.applier(cli), self.layout.clone()))
    }
}

/// Flags win; anything missing comes from the cluster's ClusterConfig.
async fn cluster_info(cli: &Cli, store: &dyn ObjectStore, ctx: &OpCtx) -> Result<ClusterInfo> {
    if let (Some(name), Some(version)) = (&cli.cluster_name, &cli.kube_version) {
        return Ok(ClusterInfo::new(name, version));
    }
    let mut info = ClusterInfo::load(store, ctx).await.context("reading ClusterConfig (or pass --cluster-name and --kube-version)")?;
    if let Some(name) = &cli.cluster_name {
        info.name = name.clone();
    }
    if let Some(version) = &cli.kube_version {
        info.kube_version = version.clone();
    }
    Ok(info)
}

#[derive(serde::Serialize)]
struct ComponentRow {
    name: String,
    version: Option<String>,
    tool: Option<String>,
    cluster: bool,
}

fn components(cli: &Cli, env: &Env) -> Result<()> {
    let mut rows = Vec::new();
    for name in env.registry.names() {
        let Some(installer) = env.registry.get(name) else { continue };
        let version = match &cli.kube_version {
            Some(kube) => match resolve_version(installer.as_ref(), kube) {
                Ok(v) => v,
                Err(KonError::VersionUnsupported { .. }) => Some("unsupported".to_string()),
                Err(e) => return Err(e.into()),
            },
            None => installer.as_versioned().and_then(|v| v.version_policy().resolve(name, "").ok()),
        };
        rows.push(ComponentRow {
            name: name.to_string(),
            version,
            tool: installer.as_tool().map(|t| t.provisioner().spec().name.clone()),
            cluster: installer.as_cluster().is_some(),
        });
    }
    match cli.output {
        Output::Human => {
            println!("{:<22} {:<14} {:<10} CLUSTER", "NAME", "VERSION", "TOOL");
            for r in rows {
                println!("{:<22} {:<14} {:<10} {}", r.name, r.version.as_deref().unwrap_or("-"), r.tool.as_deref().unwrap_or("-"), r.cluster);
            }
        }
        Output::Json => print_json(&rows)?,
    }
    Ok(())
}

async fn apply(cli: &Cli, env: &Env, file: &str, ctx: &OpCtx) -> Result<()> {
    let applier = env.applier(cli);
    if file.starts_with("http://") || file.starts_with("https://") {
        applier.apply_url(ctx, file).await?;
    } else if file == "-" {
        let mut buf = Vec::new();
        tokio::io::stdin().read_to_end(&mut buf).await.context("reading stdin")?;
        applier.apply_stream(ctx, buf).await?;
    } else {
        let bytes = tokio::fs::read(file).await.with_context(|| format!("reading {}", file))?;
        applier.apply_stream(ctx, bytes).await?;
    }
    info!(source = %file, "applied");
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let env = Env::load()?;
    let ctx = op_ctx();
    match &cli.command {
        Commands::Components => components(&cli, &env)?,
        Commands::Tools { names } => {
            let names: Vec<&str> = if names.is_empty() {
                env.registry.names().filter(|n| env.registry.get(n).map(|i| i.as_tool().is_some()).unwrap_or(false)).collect()
            } else {
                names.iter().map(String::as_str).collect()
            };
            let store: Arc<dyn ObjectStore> = Arc::new(kon_kubehub::MemStore::new());
            let o = Orchestrator::new(env.registry.clone(), store, env.applier(&cli), env.layout.clone());
            let installed = o.ensure_tools(&ctx, &names).await?;
            match cli.output {
                Output::Human if installed.is_empty() => println!("all tools up to date"),
                Output::Human => installed.iter().for_each(|t| println!("installed {}", t)),
                Output::Json => print_json(&installed)?,
            }
        }
        Commands::Install { names } => {
            check_prerequisites(&["kubectl"])?;
            let o = env.orchestrator(&cli).await?;
            let cluster = cluster_info(&cli, o.store().as_ref(), &ctx).await?;
            let catalogue = if names.is_empty() {
                default_catalogue()
            } else {
                Catalogue::new(&names.iter().map(String::as_str).collect::<Vec<_>>())
            };
            let reports = o.install_all(&ctx, &cluster, &catalogue).await?;
            match cli.output {
                Output::Human => {
                    for r in &reports {
                        println!("{} {} installed on {}", r.name, r.version.as_deref().unwrap_or("-"), cluster.name);
                    }
                }
                Output::Json => print_json(&reports)?,
            }
        }
        Commands::Sync => {
            check_prerequisites(&["kubectl"])?;
            let o = env.orchestrator(&cli).await?;
            let report = o.sync_cluster_config(&ctx).await?;
            match cli.output {
                Output::Human => {
                    for c in &report.installed {
                        println!("installed {} {}", c.name, c.version);
                    }
                    if !report.skipped.is_empty() {
                        println!("already installed: {}", report.skipped.join(", "));
                    }
                }
                Output::Json => print_json(&report)?,
            }
        }
        Commands::Apply { file } => {
            check_prerequisites(&["kubectl"])?;
            apply(&cli, &env, file, &ctx).await?;
        }
        Commands::Edit { gvk, key, file, create } => {
            let kind = ResourceKind::parse(gvk)?;
            let key = ObjectKey::parse(key)?;
            let desired = file.as_deref().map(DesiredSource::from_arg).unwrap_or(DesiredSource::Editor);
            let store = KubeStore::for_context(cli.context.as_deref()).await?;
            let outcome = Reconciler::new(Arc::new(store)).reconcile(&ctx, &kind, &key, desired, *create).await?;
            match cli.output {
                Output::Human => println!("{} {} {}", kind, key, outcome.as_str()),
                Output::Json => print_json(&serde_json::json!({ "kind": kind.gvk_key(), "key": key.to_string(), "outcome": outcome }))?,
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
