//! `relaycraftd` - the RelayCraft proxy daemon.
//!
//! Wires the configuration layer, flow database, rule loader, debug manager,
//! and traffic monitor into a [`relaycraft_proxy::addon::CoreAddon`], then
//! hands it to the proxy runtime substrate to serve.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use relaycraft_proxy::addon::CoreAddon;
use relaycraft_proxy::config::{parse_upstream_proxy, Config};
use relaycraft_proxy::db::{spawn_maintenance_thread, FlowDb};
use relaycraft_proxy::debug::DebugManager;
use relaycraft_proxy::metrics;
use relaycraft_proxy::monitor::TrafficMonitor;
use relaycraft_proxy::proxy::{create_http_client, ProxyServer};
use relaycraft_proxy::rules::loader::RuleLoader;

/// RelayCraft - an intercepting HTTP/HTTPS/WebSocket proxy core.
#[derive(Parser, Debug)]
#[command(name = "relaycraftd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listener port, overrides `listen.port` from the config file
    #[arg(long)]
    port: Option<u16>,

    /// Root of persisted state (flow database, CA material)
    #[arg(long, value_name = "DIR", env = "DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Directory of rule files to load
    #[arg(long, value_name = "DIR", env = "RULES_DIR")]
    rules_dir: Option<PathBuf>,

    /// Single rule file to load, instead of a directory
    #[arg(long, value_name = "FILE", env = "RULES_FILE")]
    rules_file: Option<PathBuf>,

    /// Chained upstream proxy, `scheme://[user:pass@]host:port`
    #[arg(long, env = "UPSTREAM_PROXY")]
    upstream_proxy: Option<String>,

    /// Disable TLS certificate verification for upstream connections
    #[arg(long)]
    insecure_upstream: bool,

    /// Log level (debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RELAYCRAFT_LOGLEVEL")]
    loglevel: String,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install default crypto provider"))?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.loglevel.clone())))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<(), anyhow::Error> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if let Some(port) = cli.port {
        config.listen.port = port;
    }
    if cli.data_dir.is_some() {
        config.data_dir = cli.data_dir.clone();
    }
    if cli.rules_dir.is_some() {
        config.rules_dir = cli.rules_dir.clone();
    }
    if cli.rules_file.is_some() {
        config.rules_file = cli.rules_file.clone();
    }
    config.validate()?;

    let data_dir = config.resolve_data_dir();
    let ca_dir = config.resolve_ca_dir();
    let rules_dir = config
        .rules_dir
        .clone()
        .unwrap_or_else(|| data_dir.join("rules"));

    info!(data_dir = %data_dir.display(), "starting relaycraftd");

    let db = Arc::new(FlowDb::open(&data_dir, config.db.clone())?);
    let session = db.create_session("session")?;
    db.switch_session(&session.id)?;
    info!(session_id = %session.id, "flow database session started");

    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_maintenance_thread(Arc::clone(&db), Arc::clone(&shutdown));

    let debug = Arc::new(DebugManager::new());
    let monitor = Arc::new(TrafficMonitor::new(Arc::clone(&debug), Arc::clone(&db), ca_dir.clone()));

    let loader = if let Some(ref file) = config.rules_file {
        RuleLoader::new(file.clone())
    } else {
        RuleLoader::new(rules_dir.clone())
    };

    let addon = Arc::new(CoreAddon::new(
        loader,
        debug,
        db,
        monitor,
        session.id.clone(),
        config.listen.port,
    ));

    if let Some(raw) = cli.upstream_proxy.as_deref() {
        match parse_upstream_proxy(raw) {
            Some(upstream) => warn!(
                host = %upstream.host,
                port = upstream.port,
                "UPSTREAM_PROXY is configured but upstream chaining is not yet wired into the connection pool; connecting directly"
            ),
            None => warn!(raw, "UPSTREAM_PROXY set but could not be parsed; connecting directly"),
        }
    }

    let http_client = create_http_client(&config.connection_pool, cli.insecure_upstream);

    let metrics_port = config.metrics.port;
    tokio::spawn(async move {
        if let Err(err) = run_metrics_server(metrics_port).await {
            error!(error = %err, "metrics server error");
        }
    });

    let server = ProxyServer::new(addon, http_client, config.listen.clone(), &ca_dir)?;
    server.run().await
}

/// Serve `metrics::collect_metrics()`'s Prometheus text exposition on its own
/// listener, separate from the proxy's own accept loop.
async fn run_metrics_server(port: u16) -> anyhow::Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{body::Incoming, Request, Response};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use tokio::net::TcpListener;

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("metrics server listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| async move {
                if req.uri().path() == "/metrics" {
                    Ok::<_, Infallible>(Response::new(metrics::collect_metrics()))
                } else {
                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(404)
                            .body("not found\n".to_string())
                            .unwrap(),
                    )
                }
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!(error = %err, "metrics connection error");
            }
        });
    }
}
