//! Wayside proxy binary.
//!
//! Usage:
//!   wayside-proxy [--config wayside.yaml] [--listen 127.0.0.1:8080] [OPTIONS]

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use wayside_proxy::config::{Config, MitmConfig};
use wayside_proxy::metrics::MetricsServer;
use wayside_proxy::mitm::CertificateAuthority;
use wayside_proxy::proxy::{bind_listener, TcpDialer, TransportOptions};
use wayside_proxy::Proxy;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Intercepting HTTP/HTTPS proxy
#[derive(Parser, Debug)]
#[command(name = "wayside-proxy")]
#[command(author, version, about = "Intercepting HTTP/HTTPS proxy with TLS interception")]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "WAYSIDE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides listen.address)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Per-request timeout in seconds (overrides timeouts.request_secs)
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Forward all traffic through this HTTP proxy (http://host:port)
    #[arg(long)]
    downstream_proxy: Option<String>,

    /// CA certificate used for TLS interception
    #[arg(long, requires = "mitm_ca_key")]
    mitm_ca_cert: Option<PathBuf>,

    /// CA private key used for TLS interception
    #[arg(long, requires = "mitm_ca_cert")]
    mitm_ca_key: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wayside_proxy=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(listen) = args.listen {
        config.listen.address = listen;
    }
    if let Some(timeout) = args.timeout {
        config.timeouts.request_secs = timeout;
    }
    if let Some(ref proxy) = args.downstream_proxy {
        config.downstream_proxy = Some(proxy.clone());
    }
    if let (Some(cert), Some(key)) = (&args.mitm_ca_cert, &args.mitm_ca_key) {
        let mitm = config
            .mitm
            .get_or_insert_with(|| MitmConfig::new(cert.clone(), key.clone()));
        mitm.ca_cert_path = cert.clone();
        mitm.ca_key_path = key.clone();
    }

    config.validate()?;
    Ok(config)
}

fn build_proxy(config: &Config) -> anyhow::Result<Proxy> {
    let proxy = Proxy::with_transport_options(TransportOptions {
        skip_verify: config.upstream_tls.skip_verify,
        max_idle_per_host: config.connection_pool.max_idle_per_host,
        idle_timeout: Duration::from_secs(config.connection_pool.idle_timeout_secs),
    });
    proxy.set_timeout(config.timeouts.request());
    proxy.set_dialer(Arc::new(TcpDialer::new(config.timeouts.connect())));
    proxy.set_downstream_proxy(config.downstream_proxy_uri()?);

    if let Some(ref mitm) = config.mitm {
        let ca = CertificateAuthority::load_or_generate(
            &mitm.ca_cert_path,
            &mitm.ca_key_path,
            mitm.generate_if_missing,
        )?
        .with_validity_days(mitm.validity_days);
        info!(
            cert = %mitm.ca_cert_path.display(),
            "TLS interception enabled; clients must trust this CA"
        );
        proxy.set_mitm(Some(Arc::new(ca)));
    }

    Ok(proxy)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let config = load_config(&args)?;
    let proxy = build_proxy(&config)?;

    let listener = bind_listener(config.listen.address, config.listen.reuse_port)
        .with_context(|| format!("Failed to bind {}", config.listen.address))?;

    let metrics_shutdown = CancellationToken::new();
    if config.metrics.enabled {
        let addr = SocketAddr::new(config.listen.address.ip(), config.metrics.port);
        let shutdown = metrics_shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = MetricsServer::new(addr).run(shutdown).await {
                error!("Metrics server failed: {}", e);
            }
        });
    }

    let server = proxy.clone();
    let mut serving = tokio::spawn(async move { server.serve(listener).await });

    tokio::select! {
        result = &mut serving => {
            metrics_shutdown.cancel();
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(anyhow::anyhow!("Proxy task failed: {e}")),
            };
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        }
    }

    proxy.close().await;
    metrics_shutdown.cancel();
    if let Err(e) = serving.await {
        warn!("Proxy task ended abnormally: {}", e);
    }
    info!("Wayside proxy stopped");
    Ok(())
}
