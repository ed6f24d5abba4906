use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tls_inspector::project::{self, MemoryRepository, ObserverError, Target};
use tls_inspector::proxy::{trace_requests, trace_responses};
use tls_inspector::{Interceptor, ProxyConfig};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Intercepting HTTP(S) proxy.
///
/// Terminates CONNECT tunnels with certificates issued on the fly by a
/// local root CA and logs the decrypted traffic.
#[derive(Parser, Debug)]
#[command(name = "tls-inspector")]
#[command(version, about)]
struct Args {
    /// Path to the configuration file (YAML).
    /// If not specified, built-in defaults are used.
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the config file.
    #[arg(short = 'l', long)]
    listen: Option<SocketAddr>,

    /// Directory holding root-ca.pem and root-ca.key, overriding the
    /// config file. Created on first run.
    #[arg(long)]
    ca_dir: Option<PathBuf>,

    /// Project to open for this session.
    #[arg(short = 'p', long)]
    project: Option<String>,

    /// Do not log intercepted requests and responses.
    #[arg(short = 'q', long)]
    quiet: bool,
}

/// Session settings recorded when a project opens.
#[derive(Serialize)]
struct SessionSettings {
    listen: SocketAddr,
    ca_cert: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(config_path) => ProxyConfig::load(config_path)
            .with_context(|| format!("failed to load config from {:?}", config_path))?,
        None => ProxyConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(dir) = &args.ca_dir {
        config.ca.in_dir(dir);
    }
    config.validate().context("invalid configuration")?;

    let interceptor = Interceptor::new(&config)?;
    if !args.quiet {
        interceptor.dispatcher().add_request_middleware(trace_requests());
        interceptor
            .dispatcher()
            .add_response_middleware(trace_responses());
    }

    let target = args
        .project
        .as_deref()
        .map(|name| open_project(name, &config))
        .transpose()?;

    let server = interceptor.bind(config.listen).await?;
    info!(
        "trust {} in clients to inspect HTTPS traffic",
        config.ca.cert_path.display()
    );

    let result = tokio::select! {
        result = server.run() => result.context("proxy server failed"),
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    };

    if let Some(target) = target
        && let Err(e) = target.close()
    {
        warn!("{}", e);
    }

    result
}

fn open_project(name: &str, config: &ProxyConfig) -> Result<Target> {
    let target = Target::new(Arc::new(MemoryRepository::new()));

    let repo = Arc::clone(target.repository());
    let session = SessionSettings {
        listen: config.listen,
        ca_cert: config.ca.cert_path.clone(),
    };
    target.on_open(Arc::new(move |name: &str| -> Result<(), ObserverError> {
        project::save_settings(repo.as_ref(), "session", &session)?;
        info!("project {} recording session settings", name);
        Ok(())
    }));

    target
        .open(name)
        .with_context(|| format!("failed to open project {name}"))?;
    Ok(target)
}
