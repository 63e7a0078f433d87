//! Armada daemon: connects the configured engines, builds the cluster and
//! serves the Docker-compatible API over it.

mod config;

use anyhow::{Context, Result};
use armada_api::{ApiServer, AppState};
use armada_cluster::transport::{load_tls_config, TlsConfig};
use armada_cluster::{
    Cluster, DriverOpts, Engine, EngineOptions, EventQueue, HttpEngineClient, Store, Watchdog,
};
use clap::Parser;
use config::Config;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "armadad")]
#[command(author, version, about = "Armada cluster manager daemon", long_about = None)]
struct DaemonArgs {
    /// Configuration file (default: /etc/armada/armada.toml, ./armada.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address for the cluster API (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Engine address to manage; repeatable (overrides config).
    #[arg(long = "engine")]
    engines: Vec<String>,

    /// CA bundle for engine TLS (overrides config).
    #[arg(long)]
    tls_ca: Option<PathBuf>,

    /// Client certificate for engine TLS (overrides config).
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// Client key for engine TLS (overrides config).
    #[arg(long)]
    tls_key: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = DaemonArgs::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path).context("failed to load configuration file")?,
        None => Config::load().context("failed to load configuration")?,
    };
    if let Some(listen) = &args.listen {
        config.listen = listen.clone();
    }
    if !args.engines.is_empty() {
        config.engines = args.engines.clone();
    }
    if args.tls_ca.is_some() {
        config.tls.ca = args.tls_ca.clone();
    }
    if args.tls_cert.is_some() {
        config.tls.cert = args.tls_cert.clone();
    }
    if args.tls_key.is_some() {
        config.tls.key = args.tls_key.clone();
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    run(config).await
}

async fn run(mut config: Config) -> Result<()> {
    info!("starting armada daemon");

    let cluster_opts = DriverOpts::parse(&config.cluster_opts);
    if let Some(percent) = cluster_opts
        .get_int("armada.overcommit")
        .context("bad armada.overcommit cluster option")?
    {
        config.overcommit_ratio = percent as f64 / 100.0;
    }
    if let Some(secs) = cluster_opts
        .get_int("armada.refresh_interval")
        .context("bad armada.refresh_interval cluster option")?
    {
        config.refresh_interval_secs = secs.max(1) as u64;
    }

    let listen: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {:?}", config.listen))?;

    let tls = match &config.tls.ca {
        Some(ca) => Some(
            load_tls_config(ca, config.client_cert()).context("failed to load TLS material")?,
        ),
        None => None,
    };

    let store = Arc::new(Store::open(&config.store_root).context("failed to open state store")?);
    let cluster = Arc::new(Cluster::new());
    let queue = Arc::new(EventQueue::new());
    let watchdog = Watchdog::new(Arc::clone(&cluster), Arc::clone(&store));

    // Order matters: API watchers see an event before the watchdog starts
    // moving containers around because of it.
    cluster.register_handler(Arc::clone(&queue) as _);
    cluster.register_handler(watchdog as _);

    connect_engines(&config, &cluster, tls.clone()).await;
    if cluster.engines().is_empty() {
        warn!("no engines connected; the cluster is empty until engines come up");
    }

    let state = AppState::new(Arc::clone(&cluster), Arc::clone(&queue), tls);
    let server = ApiServer::new(listen);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run(state).await {
            tracing::error!("cluster API server error: {e}");
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received");

    server_handle.abort();
    queue.close();
    info!("armada daemon stopped");
    Ok(())
}

/// Connects every configured engine. A failing engine is logged and
/// skipped; it is never registered half-connected.
async fn connect_engines(config: &Config, cluster: &Arc<Cluster>, tls: Option<TlsConfig>) {
    let opts = EngineOptions {
        refresh_interval: Duration::from_secs(config.refresh_interval_secs),
        overcommit_ratio: config.overcommit_ratio,
    };
    let timeout = Duration::from_secs(config.request_timeout_secs);

    for addr in &config.engines {
        let client = Arc::new(HttpEngineClient::new(addr.clone(), tls.clone(), timeout));
        let engine = Arc::new(Engine::new(addr.clone(), client, opts.clone()));
        if let Err(e) = engine.connect().await {
            warn!(engine = %addr, "failed to connect engine, skipping: {e}");
            continue;
        }
        if let Err(e) = cluster.add_engine(engine) {
            warn!(engine = %addr, "failed to register engine: {e}");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
