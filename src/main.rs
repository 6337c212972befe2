//! Coordinator process entrypoint.
//!
//! Loads the cluster topology, opens the per-cluster proxy pool (probing
//! each with `checkalive`), installs a default EC schema if one is
//! configured, then serves the client/proxy RPC surface, a Prometheus
//! metrics endpoint, and a health endpoint concurrently until the process
//! is asked to exit.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lrc_coordinator::adapters::LoggingEventPublisher;
use lrc_coordinator::domain::model::{EcSchema, EncodeType, MultiStripePlacement, SingleStripePlacement};
use lrc_coordinator::error::{Error, Result};
use lrc_coordinator::merge::PollConfig;
use lrc_coordinator::metrics::CoordinatorMetrics;
use lrc_coordinator::rpc::run_rpc_server;
use lrc_coordinator::state::Tables;
use lrc_coordinator::topology::{ProxyPool, Topology};
use lrc_coordinator::Coordinator;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Control-plane coordinator for an Azure-LRC / Optimal-Cauchy-LRC
/// erasure-coded object store.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the cluster topology XML file.
    #[arg(long, env = "TOPOLOGY_FILE")]
    topology_file: String,

    /// Client-facing + proxy-callback RPC bind address.
    #[arg(long, env = "RPC_ADDR", default_value = "0.0.0.0:7000")]
    rpc_addr: String,

    /// Metrics server bind address.
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address.
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Install a default EC schema at startup instead of waiting for the
    /// first `setParameter` call. Requires every `default_*` flag below.
    #[arg(long, env = "INSTALL_DEFAULT_SCHEMA")]
    install_default_schema: bool,

    /// Default `k`: data blocks per stripe.
    #[arg(long, env = "DEFAULT_K", default_value = "8")]
    default_k: u32,

    /// Default `g`: global parities per stripe.
    #[arg(long, env = "DEFAULT_G", default_value = "2")]
    default_g: u32,

    /// Default `l`: local groups per stripe.
    #[arg(long, env = "DEFAULT_L", default_value = "2")]
    default_l: u32,

    /// Default `b`: data blocks per local group (`k` must equal `l*b`).
    #[arg(long, env = "DEFAULT_B", default_value = "4")]
    default_b: u32,

    /// Default `x`: stripes per merge group.
    #[arg(long, env = "DEFAULT_X", default_value = "2")]
    default_x: u32,

    /// Default encode type: `azure_lrc` or `optimal_cauchy_lrc`.
    #[arg(long, env = "DEFAULT_ENCODE_TYPE", default_value = "azure_lrc")]
    default_encode_type: String,

    /// Default multi-stripe placement strategy: `ran`, `dis`, `agg`, `opt`.
    #[arg(long, env = "DEFAULT_MULTI_STRIPE_PLACEMENT", default_value = "dis")]
    default_multi_stripe_placement: String,

    /// Whether proxies should partially decode data before helping a
    /// parity recomputation.
    #[arg(long, env = "DEFAULT_PARTIAL_DECODING")]
    default_partial_decoding: bool,

    /// `checkStep` poll interval, in milliseconds.
    #[arg(long, env = "CHECK_STEP_POLL_MS", default_value = "50")]
    check_step_poll_ms: u64,

    /// Maximum `checkStep` poll attempts before a merge chunk fails.
    #[arg(long, env = "CHECK_STEP_MAX_ATTEMPTS", default_value = "40")]
    check_step_max_attempts: u32,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON.
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn default_schema(&self) -> Result<EcSchema> {
        let encode_type = match self.default_encode_type.as_str() {
            "azure_lrc" => EncodeType::AzureLrc,
            "optimal_cauchy_lrc" => EncodeType::OptimalCauchyLrc,
            other => {
                return Err(Error::SchemaRejected(format!(
                    "unknown default encode type: {other}"
                )))
            }
        };
        let multi_stripe_placement = match self.default_multi_stripe_placement.as_str() {
            "ran" => MultiStripePlacement::Ran,
            "dis" => MultiStripePlacement::Dis,
            "agg" => MultiStripePlacement::Agg,
            "opt" => MultiStripePlacement::Opt,
            other => {
                return Err(Error::SchemaRejected(format!(
                    "unknown default multi-stripe placement: {other}"
                )))
            }
        };
        let schema = EcSchema {
            k: self.default_k,
            g: self.default_g,
            l: self.default_l,
            b: self.default_b,
            x: self.default_x,
            encode_type,
            single_stripe_placement: SingleStripePlacement::Optimal,
            multi_stripe_placement,
            partial_decoding: self.default_partial_decoding,
        };
        schema.validate()?;
        Ok(schema)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    // Fail fast on a bad default schema, using the same validation
    // `setParameter` itself runs, rather than surfacing it lazily on the
    // first placement call.
    let default_schema = if args.install_default_schema {
        Some(args.default_schema()?)
    } else {
        None
    };

    info!(topology_file = %args.topology_file, "loading cluster topology");
    let topology = Topology::load(&args.topology_file)?;
    info!(clusters = topology.clusters.len(), "topology loaded");

    let (clusters, nodes) = topology.into_tables();
    let mut tables = Tables::new(clusters, nodes);
    if let Some(schema) = default_schema {
        tables.set_parameter(schema)?;
        info!("installed default EC schema");
    }

    info!("opening proxy stub pool");
    let proxies = ProxyPool::connect_http(&topology).await;

    let poll = PollConfig {
        interval: Duration::from_millis(args.check_step_poll_ms),
        max_attempts: args.check_step_max_attempts,
    };
    let events = Arc::new(LoggingEventPublisher::new());
    let coordinator = Arc::new(Coordinator::new(tables, proxies, events, poll));

    let metrics =
        CoordinatorMetrics::new(coordinator.tables_handle()).map_err(|e| Error::Internal(e.to_string()))?;

    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!(error = %e, "health server error");
        }
    });

    let metrics_addr = args.metrics_addr.clone();
    let metrics_for_server = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_for_server).await {
            error!(error = %e, "metrics server error");
        }
    });

    info!(addr = %args.rpc_addr, "starting coordinator RPC server");
    run_rpc_server(&args.rpc_addr, coordinator, metrics).await?;

    Ok(())
}

// =============================================================================
// Logging setup
// =============================================================================

fn init_logging(args: &Args) {
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
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("reqwest=warn".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry().with(filter).with(fmt::layer().json()).init();
    } else {
        tracing_subscriber::registry().with(filter).with(fmt::layer().with_target(true)).init();
    }
}

// =============================================================================
// Health server
// =============================================================================

async fn run_health_server(addr: &str) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn health_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/healthz" | "/livez" | "/readyz" => Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from("ok")))
                .unwrap(),
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("not found")))
                .unwrap(),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr.parse().map_err(|e| Error::Internal(format!("invalid health server address: {e}")))?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "health server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new().serve_connection(io, service_fn(health_handler)).await {
                error!(error = %e, "health server connection error");
            }
        });
    }
}

// =============================================================================
// Metrics server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: Arc<CoordinatorMetrics>) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use prometheus::{Encoder, TextEncoder};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn metrics_handler(
        req: Request<hyper::body::Incoming>,
        metrics: Arc<CoordinatorMetrics>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => {
                metrics.sample_table_sizes();
                let encoder = TextEncoder::new();
                let metric_families = prometheus::gather();
                let mut buffer = Vec::new();
                encoder.encode(&metric_families, &mut buffer).unwrap();
                Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", encoder.format_type())
                    .body(Full::new(Bytes::from(buffer)))
                    .unwrap()
            }
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("not found")))
                .unwrap(),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr.parse().map_err(|e| Error::Internal(format!("invalid metrics server address: {e}")))?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| metrics_handler(req, metrics.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!(error = %e, "metrics server connection error");
            }
        });
    }
}
