use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use keel_controller::{AgentConfig, ControllerConfig, MirrorConfig};
use keel_core::{label_key, tracked_labels, ImageRef};
use keel_exec::{EngineConfig, WaitConfig};
use keel_keyring::SecretRef;
use keel_kubehub::{get_kube_client, machine_view, CachedImage, KubeStore, ResourceStore};
use kube::CustomResourceExt;
use serde::Serialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "keel", version, about = "Keep declared container images cached on nodes")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(clap::Args, Debug)]
struct EngineArgs {
    /// Worker tasks draining the work queue
    #[arg(long, env = "KEEL_WORKERS", default_value_t = 4)]
    workers: usize,
    #[arg(long, env = "KEEL_QUEUE_CAPACITY", default_value_t = 256)]
    queue_capacity: usize,
    /// Seconds to wait for the runtime to reflect a pull or removal (off when unset)
    #[arg(long, env = "KEEL_WAIT_TIMEOUT")]
    wait_timeout: Option<u64>,
    #[arg(long, env = "KEEL_WAIT_INTERVAL", default_value_t = 2)]
    wait_interval: u64,
}

impl EngineArgs {
    fn config(&self) -> EngineConfig {
        EngineConfig {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            wait: self.wait_timeout.map(|t| WaitConfig {
                interval: Duration::from_secs(self.wait_interval),
                timeout: Duration::from_secs(t),
            }),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Declaration reconciler: node labels, status and finalizer
    Controller {
        /// Seconds between resyncs of a settled declaration
        #[arg(long, env = "KEEL_RESYNC", default_value_t = 60)]
        resync: u64,
        #[arg(long, env = "KEEL_DELETION_REQUEUE", default_value_t = 10)]
        deletion_requeue: u64,
        #[arg(long, env = "KEEL_ERROR_BACKOFF", default_value_t = 30)]
        error_backoff: u64,
    },
    /// Node agent: pulls and removes images on this node
    Agent {
        #[arg(long, env = "KEEL_NODE")]
        node: String,
        /// Seconds between convergence passes
        #[arg(long, env = "KEEL_INTERVAL", default_value_t = 30)]
        interval: u64,
        #[arg(long, env = "KEEL_CLEANUP_INTERVAL", default_value_t = 300)]
        cleanup_interval: u64,
        #[arg(long, env = "KEEL_CRICTL", default_value = "crictl")]
        crictl: String,
        /// CRI endpoint passed to crictl
        #[arg(long, env = "KEEL_RUNTIME_ENDPOINT")]
        runtime_endpoint: Option<String>,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Mirror replica: copies declared images into the local registry
    Mirror {
        #[arg(long, env = "KEEL_POD")]
        pod: String,
        #[arg(long, env = "KEEL_NAMESPACE", default_value = "keel-system")]
        namespace: String,
        #[arg(long, env = "KEEL_REGISTRY")]
        registry: String,
        /// Docker config secret for the mirror registry, as namespace/name
        #[arg(long, env = "KEEL_REGISTRY_SECRET")]
        registry_secret: Option<String>,
        #[arg(long, env = "KEEL_MEMBER_SELECTOR", default_value = "app.kubernetes.io/name=keel-mirror")]
        member_selector: String,
        #[arg(long, env = "KEEL_INSECURE_REGISTRY")]
        insecure: bool,
        #[arg(long, env = "KEEL_INTERVAL", default_value_t = 60)]
        interval: u64,
        #[arg(long, env = "KEEL_SKOPEO", default_value = "skopeo")]
        skopeo: String,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Print the normalized reference, identity hash and label key of an image
    Hash { image: String },
    /// Print the keel labels of a node
    Labels { node: String },
    /// Print the CachedImage CustomResourceDefinition as YAML
    Crd,
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
    metrics::gauge!("keel_build_info", 1.0, "version" => env!("CARGO_PKG_VERSION"));
}

/// Token cancelled on the first Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("interrupt received; shutting down"),
            Err(e) => warn!(error = %e, "signal handler failed; shutting down"),
        }
        token.cancel();
    });
    cancel
}

fn parse_secret(raw: &str) -> Result<SecretRef> {
    match raw.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Ok(SecretRef::new(ns, name)),
        _ => anyhow::bail!("registry secret must be namespace/name, got {:?}", raw),
    }
}

#[derive(Serialize)]
struct HashRow {
    image: String,
    hash: String,
    label: String,
}

#[derive(Serialize)]
struct LabelRow {
    hash: String,
    state: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Controller { resync, deletion_requeue, error_backoff } => {
            let config = ControllerConfig {
                resync: Duration::from_secs(resync),
                deletion_requeue: Duration::from_secs(deletion_requeue),
                error_backoff: Duration::from_secs(error_backoff),
            }
            .validate()?;
            let client = get_kube_client().await?;
            keel_controller::declaration::run(client, config, shutdown_token()).await;
        }
        Commands::Agent { node, interval, cleanup_interval, crictl, runtime_endpoint, engine } => {
            let config = AgentConfig {
                interval: Duration::from_secs(interval),
                cleanup_interval: Duration::from_secs(cleanup_interval),
                crictl,
                runtime_endpoint,
                engine: engine.config(),
                ..AgentConfig::new(node)
            }
            .validate()?;
            let client = get_kube_client().await?;
            keel_controller::run_agent(client, config, shutdown_token()).await?;
        }
        Commands::Mirror { pod, namespace, registry, registry_secret, member_selector, insecure, interval, skopeo, engine } => {
            let config = MirrorConfig {
                member_selector,
                registry_secret: registry_secret.as_deref().map(parse_secret).transpose()?,
                tls_verify: !insecure,
                interval: Duration::from_secs(interval),
                skopeo,
                engine: engine.config(),
                ..MirrorConfig::new(pod, namespace, &registry)
            }
            .validate()?;
            let client = get_kube_client().await?;
            keel_controller::run_mirror(client, config, shutdown_token()).await?;
        }
        Commands::Hash { image } => {
            let r = ImageRef::parse(&image).with_context(|| format!("parsing {:?}", image))?;
            let hash = r.identity();
            let row = HashRow { image: r.canonical(), label: label_key(&hash), hash: hash.to_string() };
            match cli.output {
                Output::Human => println!("{}\n  hash:  {}\n  label: {}", row.image, row.hash, row.label),
                Output::Json => println!("{}", serde_json::to_string_pretty(&row)?),
            }
        }
        Commands::Labels { node } => {
            let store = KubeStore::new(get_kube_client().await?);
            let view = machine_view(&store.get_node(&node).await?);
            let rows: Vec<LabelRow> = tracked_labels(&view.labels)
                .into_iter()
                .map(|(h, s)| LabelRow { hash: h.to_string(), state: s.map(|s| s.to_string()).unwrap_or_else(|| "invalid".into()) })
                .collect();
            match cli.output {
                Output::Human => {
                    if rows.is_empty() {
                        println!("{}: no keel labels", view.name);
                    }
                    for r in &rows {
                        let image = view.images.iter().find(|(h, _)| h.as_str() == r.hash).map(|(_, n)| n.as_str()).unwrap_or("-");
                        println!("{} • {} • {}", r.hash, r.state, image);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
        Commands::Crd => print!("{}", serde_yaml::to_string(&CachedImage::crd())?),
    }
    Ok(())
}
