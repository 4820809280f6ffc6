//! PVC Remap Operator
//!
//! Periodically reconciles the claim inventory of one database cluster
//! against the configured naming policy.
//!
//! # Modes
//!
//! - default: talks to the Kubernetes API server
//! - `--standalone`: in-memory store seeded from a YAML manifest (dry run)
//! - `--once`: a single pass, then exit

use anyhow::{Context, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use clap::Parser;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pvc_remap_operator::remap::ExecutorConfig;
use pvc_remap_operator::{
    ClusterRef, ClusterRemapCoordinator, ErrorAction, InstanceOrchestrator,
    InstanceStatus, KubeStore, MemoryStore, ObjectStoreRef, OperatorConfig, RemapEvents,
    RemapExecutor, RemapMetrics, RemapSummary, RoleLabelSwitchover,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// PVC Remap Operator - live claim identity migration for replicated databases
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Namespace of the database cluster
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Name of the database cluster (value of the cluster label)
    #[arg(long, env = "CLUSTER_NAME")]
    cluster: String,

    /// Data volume suffix, overrides the configuration file
    #[arg(long, env = "DATA_SUFFIX")]
    data_suffix: Option<String>,

    /// WAL volume suffix, overrides the configuration file
    #[arg(long, env = "WAL_SUFFIX")]
    wal_suffix: Option<String>,

    /// Seconds between passes, overrides the configuration file
    #[arg(long, env = "RECONCILE_INTERVAL")]
    interval_secs: Option<u64>,

    /// Disable automatic remapping
    #[arg(long, env = "DISABLE_AUTO_REMAP")]
    disable_auto_remap: bool,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run a single pass and exit
    #[arg(long)]
    once: bool,

    /// Run against an in-memory store (no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    /// Manifest seeding the in-memory store in standalone mode
    #[arg(long, requires = "standalone")]
    seed: Option<PathBuf>,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;
    let config = load_config(&args)?;

    info!("Starting PVC Remap Operator");
    info!("  Version: {}", pvc_remap_operator::VERSION);
    info!("  Cluster: {}/{}", args.namespace, args.cluster);
    info!("  Data suffix: {:?}", config.naming.data());
    info!("  WAL suffix: {:?}", config.naming.wal());
    info!("  Auto-remap: {}", config.auto_remap);
    info!("  Standalone mode: {}", args.standalone);

    let cancel = CancellationToken::new();
    let events = RemapEvents::default();
    let metrics = RemapMetrics::new()?;
    let ready = Arc::new(AtomicBool::new(false));

    {
        let metrics = metrics.clone();
        let rx = events.subscribe();
        let cancel = cancel.clone();
        tokio::spawn(async move { metrics.run(rx, cancel).await });
    }

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready).await {
            error!("Health server error: {:#}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let served = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, served).await {
            error!("Metrics server error: {:#}", e);
        }
    });

    let store: ObjectStoreRef = if args.standalone {
        let store = MemoryStore::new();
        if let Some(seed) = &args.seed {
            let seeded = seed_store(&store, seed)?;
            info!(objects = seeded, "Seeded in-memory store");
        }
        Arc::new(store)
    } else {
        let client = kube::Client::try_default()
            .await
            .context("creating Kubernetes client")?;
        Arc::new(KubeStore::new(client))
    };

    let executor = RemapExecutor::with_config(
        store.clone(),
        cancel.clone(),
        events.clone(),
        ExecutorConfig {
            pod_deletion_timeout: config.pod_deletion_timeout(),
            release_timeout: config.release_timeout(),
        },
    );
    let coordinator = ClusterRemapCoordinator::new(
        InstanceOrchestrator::new(executor, config.labels.clone()),
        Arc::new(RoleLabelSwitchover::new(store.clone(), config.labels.clone())),
        config.naming.clone(),
        config.labels.clone(),
    );
    let cluster = ClusterRef::new(&args.namespace, &args.cluster);

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    let mut retry = ExponentialBackoff {
        max_elapsed_time: None,
        max_interval: config.reconcile_interval().max(Duration::from_secs(60)),
        ..Default::default()
    };

    loop {
        let started = Instant::now();
        let result = reconcile_once(&store, &coordinator, &cluster, &config, &metrics).await;
        metrics.observe_pass(started.elapsed(), result.is_ok());
        ready.store(true, Ordering::Relaxed);

        let delay = match result {
            Ok(summary) => {
                retry.reset();
                if !summary.is_noop() {
                    info!(
                        remapped = ?summary.remapped,
                        deferred_primary = ?summary.deferred_primary,
                        switchover_done = summary.switchover_done,
                        "Remap pass finished"
                    );
                }
                config.reconcile_interval()
            }
            Err(e) => match e.action() {
                ErrorAction::RequeueWithBackoff => {
                    let delay = retry.next_backoff().unwrap_or(config.reconcile_interval());
                    warn!(error = %e, retry_in = ?delay, "Remap pass failed");
                    delay
                }
                ErrorAction::RequeueAfter(delay) => {
                    warn!(error = %e, retry_in = ?delay, "Remap pass incomplete");
                    delay
                }
                ErrorAction::NoRequeue => {
                    error!(error = %e, "Remap pass failed permanently");
                    config.reconcile_interval()
                }
            },
        };

        if args.once || cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    cancel.cancel();
    info!("Operator shutdown complete");
    Ok(())
}

/// One pass: read the inventory and hand it to the coordinator
async fn reconcile_once(
    store: &ObjectStoreRef,
    coordinator: &ClusterRemapCoordinator,
    cluster: &ClusterRef,
    config: &OperatorConfig,
    metrics: &RemapMetrics,
) -> pvc_remap_operator::Result<RemapSummary> {
    if !config.auto_remap {
        debug!("Automatic remapping disabled");
        return Ok(RemapSummary::default());
    }

    let selector = config.labels.cluster_selector(&cluster.name);
    let (claims, pods) = futures::try_join!(
        store.list_claims(&cluster.namespace, &selector),
        store.list_pods(&cluster.namespace, &selector),
    )?;
    let statuses = InstanceStatus::from_pods(&pods, &config.labels);
    let summary = coordinator
        .reconcile_remapping(cluster, &claims, &statuses)
        .await?;
    metrics.set_claims_pending(summary.claims_pending);
    Ok(summary)
}

// =============================================================================
// Configuration
// =============================================================================

fn load_config(args: &Args) -> Result<OperatorConfig> {
    let mut config = match &args.config {
        Some(path) => OperatorConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => OperatorConfig::default(),
    };

    if let Some(suffix) = &args.data_suffix {
        config.naming.data_suffix = suffix.clone();
    }
    if let Some(suffix) = &args.wal_suffix {
        config.naming.wal_suffix = suffix.clone();
    }
    if let Some(secs) = args.interval_secs {
        config.reconcile_interval_secs = secs;
    }
    if args.disable_auto_remap {
        config.auto_remap = false;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Kind discriminator of a manifest document
#[derive(Deserialize)]
struct TypeMeta {
    kind: String,
}

/// Load PVCs, PVs and pods from a multi-document YAML manifest
fn seed_store(store: &MemoryStore, path: &Path) -> Result<usize> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading seed manifest {}", path.display()))?;

    let mut seeded = 0;
    for document in serde_yaml::Deserializer::from_str(&raw) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        let meta: TypeMeta = serde_yaml::from_value(value.clone())?;
        match meta.kind.as_str() {
            "PersistentVolumeClaim" => {
                store.insert_claim(serde_yaml::from_value::<PersistentVolumeClaim>(value)?)
            }
            "PersistentVolume" => {
                store.insert_volume(serde_yaml::from_value::<PersistentVolume>(value)?)
            }
            "Pod" => store.insert_pod(serde_yaml::from_value::<Pod>(value)?),
            other => {
                warn!(kind = other, "Skipping unsupported manifest document");
                continue;
            }
        }
        seeded += 1;
    }
    Ok(seeded)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("kube=info".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn respond(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::Relaxed);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" if ready => respond(StatusCode::OK, "ok"),
                        "/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, "first pass pending"),
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid health server address {}", addr))?;

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)?.serve(make_svc).await?;
    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: RemapMetrics) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.gather_text() {
                            Ok(text) => {
                                let mut response = respond(StatusCode::OK, text);
                                response.headers_mut().insert(
                                    CONTENT_TYPE,
                                    HeaderValue::from_static("text/plain; version=0.0.4"),
                                );
                                response
                            }
                            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        },
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics server address {}", addr))?;

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)?.serve(make_svc).await?;
    Ok(())
}
