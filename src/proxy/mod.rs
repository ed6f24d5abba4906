//! Intercepting HTTP(S) proxy.
//!
//! Plain requests are forwarded upstream through the middleware chains.
//! CONNECT requests are taken over, TLS is terminated with a leaf issued
//! for the client's SNI, and the decrypted connection is fed back into the
//! same dispatcher as a one-shot listener.

mod dispatcher;
mod middleware;
mod server;
mod tls;
mod tunnel;
mod upstream;

pub use dispatcher::{Dispatcher, ProxyError, Timeouts};
pub use middleware::{
    Chain, MiddlewareError, RequestMiddleware, RequestModifier, ResponseMiddleware,
    ResponseModifier, Stage, nop_request_modifier, nop_response_modifier, trace_requests,
    trace_responses,
};
pub use server::{AcceptError, Listener, ProxyServer, serve};
pub use tls::TlsAcceptor;
pub use tunnel::{Completion, NotifyOnClose, OnceListener, Phase, TunnelError};
pub use upstream::{Upstream, roots_with};
