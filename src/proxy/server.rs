//! Serve loop shared by the TCP listener and decrypted tunnels.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::dispatcher::Dispatcher;

#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    #[error("connection already accepted")]
    AlreadyAccepted,
    #[error("listener closed")]
    Closed,
    #[error("accept failed: {0}")]
    Io(#[from] io::Error),
}

/// Backoff after the process runs out of file descriptors.
const EXHAUSTED_BACKOFF: Duration = Duration::from_millis(100);

// EMFILE and ENFILE share these values on Linux and the BSDs.
const EMFILE: i32 = 24;
const ENFILE: i32 = 23;

/// Whether an accept error concerns only one connection or a passing
/// resource shortage, so the listener itself is still usable.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || is_exhausted(err)
}

fn is_exhausted(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(EMFILE | ENFILE))
}

/// A source of client connections.
pub trait Listener: Send + Sync + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&self) -> impl Future<Output = Result<(Self::Io, SocketAddr), AcceptError>> + Send;
}

impl Listener for TcpListener {
    type Io = TcpStream;

    async fn accept(&self) -> Result<(TcpStream, SocketAddr), AcceptError> {
        Ok(TcpListener::accept(self).await?)
    }
}

/// Accepts connections until the listener fails, serving each one on its
/// own task.
///
/// Accept errors that affect a single connection, or descriptor
/// exhaustion, are logged and the loop keeps going.
pub async fn serve<L: Listener>(listener: L, dispatcher: Arc<Dispatcher>) -> Result<(), AcceptError> {
    loop {
        let (io, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(AcceptError::Io(e)) if is_transient(&e) => {
                warn!("accept failed, continuing: {}", e);
                if is_exhausted(&e) {
                    tokio::time::sleep(EXHAUSTED_BACKOFF).await;
                }
                continue;
            }
            Err(e) => return Err(e),
        };
        debug!("accepted connection from {}", peer);

        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(serve_connection(io, peer, dispatcher));
    }
}

/// Serves HTTP/1.1 on one connection, with upgrades for CONNECT.
async fn serve_connection<IO>(io: IO, peer: SocketAddr, dispatcher: Arc<Dispatcher>)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let header_read_timeout = dispatcher.header_read_timeout();
    let service = service_fn(move |req| Arc::clone(&dispatcher).handle(req, peer));

    let mut builder = hyper::server::conn::http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(header_read_timeout);

    if let Err(e) = builder
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await
    {
        debug!("connection from {} ended: {}", peer, e);
    }
}

/// The intercepting proxy server.
pub struct ProxyServer {
    dispatcher: Arc<Dispatcher>,
    listener: TcpListener,
}

impl ProxyServer {
    /// Binds the proxy to `addr`.
    pub async fn bind(addr: SocketAddr, dispatcher: Arc<Dispatcher>) -> Result<Self, io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("proxy server listening on {}", local_addr);

        Ok(Self {
            dispatcher,
            listener,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.listener.local_addr()
    }

    /// Returns the dispatcher that handles every connection.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Runs the proxy server, accepting connections until accept fails
    /// for good.
    pub async fn run(self) -> Result<(), AcceptError> {
        serve(self.listener, self.dispatcher).await
    }
}
