//! CONNECT tunnel bridging: upgrade, TLS, and one nested serve loop.

use std::future::Future;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::dispatcher::Dispatcher;
use super::server::{self, AcceptError, Listener};

/// Lifecycle of one intercepted CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Accepted,
    Hijacked,
    TlsNegotiating,
    TlsEstablished,
    ServingOne,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("connection upgrade failed: {0}")]
    Upgrade(#[source] hyper::Error),
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),
    #[error("serving tunnel failed: {0}")]
    Serve(#[from] AcceptError),
}

/// Single-fire completion signal. Any number of tasks may wait on it.
#[derive(Clone)]
pub struct Completion {
    tx: Arc<watch::Sender<bool>>,
}

impl Completion {
    /// Creates an unfired signal.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fires the signal. Returns `true` only for the call that fired it.
    pub fn fire(&self) -> bool {
        !self.tx.send_replace(true)
    }

    /// Whether the signal has fired.
    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Waits until the signal has fired.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this only returns once fired.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream wrapper that fires a [`Completion`] when dropped.
pub struct NotifyOnClose<S> {
    inner: S,
    completion: Completion,
}

impl<S> NotifyOnClose<S> {
    /// Wraps `inner`; dropping the wrapper fires `completion`.
    pub fn new(inner: S, completion: Completion) -> Self {
        Self { inner, completion }
    }

    /// Returns a reference to the wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S> Drop for NotifyOnClose<S> {
    fn drop(&mut self) {
        self.completion.fire();
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for NotifyOnClose<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for NotifyOnClose<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

enum Slot<T> {
    Idle(T),
    Delivered,
    Closed,
}

/// A listener that yields one pre-established connection exactly once.
///
/// `Idle -> Delivered` on the first accept, `-> Closed` on close. Every
/// accept after delivery fails with [`AcceptError::AlreadyAccepted`].
pub struct OnceListener<T> {
    slot: Mutex<Slot<T>>,
    peer: SocketAddr,
}

impl<T> OnceListener<T> {
    /// Creates an idle listener holding `conn` from `peer`.
    pub fn new(conn: T, peer: SocketAddr) -> Self {
        Self {
            slot: Mutex::new(Slot::Idle(conn)),
            peer,
        }
    }

    /// Takes the connection out of the slot.
    pub fn take(&self) -> Result<T, AcceptError> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match mem::replace(&mut *slot, Slot::Delivered) {
            Slot::Idle(conn) => Ok(conn),
            Slot::Delivered => Err(AcceptError::AlreadyAccepted),
            Slot::Closed => {
                *slot = Slot::Closed;
                Err(AcceptError::Closed)
            }
        }
    }

    /// Closes the listener, dropping an undelivered connection. Idempotent.
    pub fn close(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Slot::Idle(_) = *slot {
            *slot = Slot::Closed;
        }
    }
}

impl<T> Listener for OnceListener<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Io = T;

    async fn accept(&self) -> Result<(T, SocketAddr), AcceptError> {
        self.take().map(|conn| (conn, self.peer))
    }
}

/// Counts a tunnel as active until dropped.
struct ActiveTunnel(Arc<AtomicUsize>);

impl ActiveTunnel {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveTunnel {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bridges one upgraded CONNECT into the dispatcher.
///
/// The tunnel counts as active from this call until the returned future
/// finishes or is dropped. Boxed so the serve loop and the dispatcher can
/// call each other.
pub(crate) fn run(
    on_upgrade: OnUpgrade,
    target: String,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let active = ActiveTunnel::enter(dispatcher.tunnel_counter());
    Box::pin(async move {
        let _active = active;
        match bridge(on_upgrade, &target, peer, dispatcher).await {
            Ok(()) => debug!("tunnel to {} {:?}", target, Phase::Closed),
            Err(e) => warn!("tunnel to {} from {} closed: {}", target, peer, e),
        }
    })
}

async fn bridge(
    on_upgrade: OnUpgrade,
    target: &str,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
) -> Result<(), TunnelError> {
    let upgraded = on_upgrade.await.map_err(TunnelError::Upgrade)?;
    debug!("tunnel to {} {:?}", target, Phase::Hijacked);

    debug!("tunnel to {} {:?}", target, Phase::TlsNegotiating);
    let (tls_stream, sni) = dispatcher
        .tls()
        .accept(TokioIo::new(upgraded))
        .await
        .map_err(TunnelError::Handshake)?;
    debug!("tunnel to {} {:?} (SNI {})", target, Phase::TlsEstablished, sni);

    let completion = Completion::new();
    let listener = OnceListener::new(NotifyOnClose::new(tls_stream, completion.clone()), peer);

    debug!("tunnel to {} {:?}", target, Phase::ServingOne);
    match server::serve(listener, dispatcher).await {
        Err(AcceptError::AlreadyAccepted) => {}
        Err(e) => return Err(e.into()),
        Ok(()) => {}
    }

    completion.wait().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    fn peer() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    /// First accept yields the connection; every later accept fails.
    #[tokio::test]
    async fn once_listener_delivers_once() {
        let (conn, _other) = duplex(64);
        let listener = OnceListener::new(conn, peer());

        let (_conn, addr) = listener.accept().await.unwrap();
        assert_eq!(addr, peer());
        for _ in 0..3 {
            assert!(matches!(
                listener.accept().await,
                Err(AcceptError::AlreadyAccepted)
            ));
        }
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (conn, _other) = duplex(64);
        let listener = OnceListener::new(conn, peer());

        listener.close();
        listener.close();
        assert!(matches!(listener.accept().await, Err(AcceptError::Closed)));
        assert!(matches!(listener.accept().await, Err(AcceptError::Closed)));

        let (conn, _other) = duplex(64);
        let delivered = OnceListener::new(conn, peer());
        let _conn = delivered.accept().await.unwrap();
        delivered.close();
        assert!(matches!(
            delivered.accept().await,
            Err(AcceptError::AlreadyAccepted)
        ));
    }

    #[tokio::test]
    async fn completion_fires_once_for_many_waiters() {
        let completion = Completion::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let completion = completion.clone();
                tokio::spawn(async move { completion.wait().await })
            })
            .collect();

        assert!(!completion.is_fired());
        assert!(completion.fire());
        assert!(!completion.fire());
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
        }
        // Waiting after the fact returns immediately.
        completion.wait().await;
    }

    #[test]
    fn active_tunnel_counts_until_dropped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let first = ActiveTunnel::enter(&counter);
        let second = ActiveTunnel::enter(&counter);
        assert_eq!(counter.load(Ordering::Acquire), 2);

        drop(first);
        assert_eq!(counter.load(Ordering::Acquire), 1);
        drop(second);
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }

    /// Dropping the wrapped stream fires the completion; data passes through.
    #[tokio::test]
    async fn notify_on_close_fires_on_drop() {
        let (conn, mut other) = duplex(64);
        let completion = Completion::new();
        let mut wrapped = NotifyOnClose::new(conn, completion.clone());

        wrapped.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        other.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert!(!completion.is_fired());
        drop(wrapped);
        assert!(completion.is_fired());
    }
}
