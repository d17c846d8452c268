//! Prometheus Zenoh ambassador.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ambassador_common::subject::SubjectFormat;
use ambassador_common::{connect, init_tracing};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use url::Url;

use prometheus_zenoh_ambassador::{
    AmbassadorConfig, AmbassadorMetrics, AppState, ExporterResponder, FatalReporter, HttpServer,
    RemoteWriteIngress, RemoteWriteRelay, ScrapeProxy, SharedBus, ZenohBus,
};

/// Tunnel Prometheus scrapes and remote writes over Zenoh.
#[derive(Parser, Debug)]
#[command(name = "prometheus-zenoh-ambassador")]
#[command(about = "Tunnel Prometheus scrapes and remote writes over Zenoh")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Subscription records file (overrides config).
    #[arg(long)]
    subs: Option<PathBuf>,

    /// Pull subject prefix (overrides config).
    #[arg(long)]
    subject_base: Option<String>,

    /// Host rendering in pull subjects: mod, fwd or rev (overrides config).
    #[arg(long)]
    subject_format: Option<SubjectFormat>,

    /// Upstream remote-write URL; enables the relay (overrides config).
    #[arg(long)]
    relay_url: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(self, config: &mut AmbassadorConfig) {
        if let Some(listen) = self.listen {
            config.http.listen = listen;
        }
        if let Some(subs) = self.subs {
            config.subscriptions_file = Some(subs);
        }
        if let Some(base) = self.subject_base {
            config.subject.base = base;
        }
        if let Some(format) = self.subject_format {
            config.subject.format = format;
        }
        if let Some(url) = self.relay_url {
            config.remote_write.relay_url = Some(url);
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AmbassadorConfig::load_from_file(path)?,
        None => AmbassadorConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    init_tracing(&config.logging)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Prometheus Zenoh Ambassador");

    let routes = Arc::new(config.route_table()?);
    let listen_addr: SocketAddr = config
        .http
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;
    let relay_url = config
        .remote_write
        .relay_url
        .as_deref()
        .map(Url::parse)
        .transpose()
        .map_err(|e| anyhow::anyhow!("Invalid relay URL: {}", e))?;

    let session = Arc::new(connect(&config.zenoh).await?);
    let bus: SharedBus = Arc::new(ZenohBus::new(session.clone()));
    let metrics = Arc::new(AmbassadorMetrics::new(&config.metrics.prefix));
    let (fatal, mut fatal_rx) = FatalReporter::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::new();

    if routes.is_empty() {
        info!("No subscriptions configured, exporter responder disabled");
    } else {
        let responder = ExporterResponder::new(metrics.clone())?;
        let session = session.clone();
        let routes = routes.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = responder.serve(session, routes, shutdown).await {
                error!("Exporter responder error: {}", e);
            }
        }));
    }

    match relay_url {
        Some(url) => {
            let relay = RemoteWriteRelay::new(url, metrics.clone())?;
            let session = session.clone();
            let base = config.remote_write.subject.clone();
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = relay.serve(session, &base, shutdown).await {
                    error!("Remote write relay error: {}", e);
                }
            }));
        }
        None => info!("No relay_url configured, remote write relay disabled"),
    }

    let state = AppState {
        proxy: Arc::new(ScrapeProxy::new(
            bus.clone(),
            config.subject.resolver(),
            metrics.clone(),
            fatal,
        )),
        ingress: Arc::new(RemoteWriteIngress::new(
            bus.clone(),
            config.remote_write.subject.clone(),
        )),
        metrics: metrics.clone(),
        bus,
    };
    let http_server = HttpServer::new(state, listen_addr);
    let http_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = http_server.run(http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    }));

    let mut fatal_condition = None;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
        }
        Some(condition) = fatal_rx.recv() => {
            error!(condition = %condition, "Fatal condition, shutting down...");
            fatal_condition = Some(condition);
        }
    }

    shutdown_tx.send(true)?;

    if tokio::time::timeout(Duration::from_secs(5), async {
        for task in tasks {
            let _ = task.await;
        }
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for tasks to stop");
    }

    if let Err(e) = session.close().await {
        warn!(error = %e, "Failed to close Zenoh session");
    }

    info!("Ambassador stopped");

    match fatal_condition {
        Some(condition) => Err(anyhow::anyhow!("{}", condition)),
        None => Ok(()),
    }
}

async fn terminate() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}
