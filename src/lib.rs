//! TLS break-and-inspect proxy.
//!
//! The proxy terminates client `CONNECT` tunnels with a certificate
//! issued on the fly for the requested host, signed by a locally trusted
//! root, and feeds the decrypted requests through request and response
//! middleware before re-encrypting them upstream.
//!
//! # Architecture
//!
//! 1. [`ca::RootAuthority`] loads or creates the root certificate and key
//! 2. [`ca::LeafCache`] issues and caches one leaf per SNI host
//! 3. [`proxy::Dispatcher`] answers `CONNECT` with `200 OK` and takes the
//!    connection over
//! 4. The TLS handshake runs on the taken-over stream, and the decrypted
//!    stream is served once through the same dispatcher
//! 5. Everything else is relayed upstream through the middleware chains
//!
//! # Example
//!
//! ```no_run
//! use tls_inspector::{Interceptor, ProxyConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = ProxyConfig::load("inspector.yaml")?;
//! let interceptor = Interceptor::new(&config)?;
//! interceptor
//!     .dispatcher()
//!     .add_request_middleware(tls_inspector::proxy::trace_requests());
//! interceptor.bind(config.listen).await?.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod ca;
mod config;
pub mod project;
pub mod proxy;

pub use config::{CaConfig, ConfigError, LeafConfig, ProxyConfig, TimeoutConfig, UpstreamConfig};

use anyhow::{Context, Result};
use rustls::pki_types::CertificateDer;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use ca::{LeafCache, LeafIssuer, RootAuthority};
use proxy::{Dispatcher, ProxyServer, Upstream};

/// A configured proxy: root authority, leaf cache, and dispatcher.
pub struct Interceptor {
    root: Arc<RootAuthority>,
    dispatcher: Arc<Dispatcher>,
}

impl Interceptor {
    /// Loads or creates the root authority and wires the dispatcher.
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let root = RootAuthority::load_or_create(
            &config.ca.cert_path,
            &config.ca.key_path,
            &config.ca.subject(),
        )
        .context("failed to load or create root CA")?;
        info!(
            "root CA {} valid until {}",
            config.ca.cert_path.display(),
            root.not_after()
        );

        let upstream = if config.upstream.extra_roots.is_empty() {
            Upstream::new()
        } else {
            let mut extra = Vec::new();
            for path in &config.upstream.extra_roots {
                extra.extend(read_certs(path)?);
            }
            let roots = proxy::roots_with(extra).context("failed to add upstream roots")?;
            Upstream::with_roots(roots)
        };

        Ok(Self::with_root(Arc::new(root), upstream, config))
    }

    /// Wires a dispatcher around an existing root authority.
    pub fn with_root(root: Arc<RootAuthority>, upstream: Upstream, config: &ProxyConfig) -> Self {
        let issuer = LeafIssuer::new(Arc::clone(&root), config.leaf.policy());
        let cache = Arc::new(LeafCache::new(
            issuer,
            config.leaf.cache_capacity,
            config.leaf.refresh_margin(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            cache,
            upstream,
            config.timeouts.timeouts(),
        ));

        Self { root, dispatcher }
    }

    pub fn root(&self) -> &Arc<RootAuthority> {
        &self.root
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Binds a proxy server for this dispatcher.
    pub async fn bind(&self, addr: SocketAddr) -> Result<ProxyServer> {
        ProxyServer::bind(addr, Arc::clone(&self.dispatcher))
            .await
            .with_context(|| format!("failed to bind proxy to {addr}"))
    }
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to read certificates from {}", path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}
