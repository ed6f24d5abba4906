//! TLS termination and certificate resolution.

use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tracing::{debug, error, warn};

use crate::ca::{CaError, LeafCache};

/// TLS acceptor that performs the server handshake with per-SNI leaves.
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
    handshake_timeout: Duration,
}

impl TlsAcceptor {
    /// Creates a new TLS acceptor issuing from the given leaf cache.
    pub fn new(cache: Arc<LeafCache>, handshake_timeout: Duration) -> Self {
        let config = Self::create_config(cache);
        Self {
            inner: tokio_rustls::TlsAcceptor::from(config),
            handshake_timeout,
        }
    }

    /// Creates a rustls ServerConfig with dynamic certificate resolution.
    /// Only HTTP/1.1 is offered over ALPN.
    fn create_config(cache: Arc<LeafCache>) -> Arc<ServerConfig> {
        let resolver = Arc::new(CertResolver { cache });
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Arc::new(config)
    }

    /// Accepts a TLS connection over any stream, performing the handshake.
    /// Returns the TLS stream and the SNI the client sent.
    pub async fn accept<IO>(&self, stream: IO) -> Result<(TlsStream<IO>, String), std::io::Error>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let tls_stream = tokio::time::timeout(self.handshake_timeout, self.inner.accept(stream))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "TLS handshake timed out")
            })??;

        // The resolver refuses to answer without SNI, so a completed
        // handshake always carries one.
        let sni = tls_stream
            .get_ref()
            .1
            .server_name()
            .map(|s| s.to_string())
            .unwrap_or_default();

        debug!("TLS handshake completed, SNI: {}", sni);

        Ok((tls_stream, sni))
    }
}

/// Certificate resolver that issues leaves on demand based on SNI.
struct CertResolver {
    cache: Arc<LeafCache>,
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertResolver").finish_non_exhaustive()
    }
}

impl rustls::server::ResolvesServerCert for CertResolver {
    fn resolve(
        &self,
        client_hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<rustls::sign::CertifiedKey>> {
        let Some(sni) = client_hello.server_name() else {
            warn!("{}", CaError::HandshakeAborted);
            return None;
        };
        debug!("resolving certificate for SNI: {}", sni);
        match self.cache.get_or_issue(sni) {
            Ok(leaf) => Some(leaf.certified_key()),
            Err(e) => {
                error!("failed to issue certificate for {}: {}", sni, e);
                None
            }
        }
    }
}
