//! Top-level request handler: CONNECT interception and reverse proxying.

use std::convert::Infallible;
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderMap, HeaderName};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::upgrade::OnUpgrade;
use tracing::{debug, error, warn};

use super::middleware::{
    Chain, MiddlewareError, RequestMiddleware, RequestModifier, ResponseMiddleware,
    ResponseModifier, nop_request_modifier, nop_response_modifier,
};
use super::tls::TlsAcceptor;
use super::tunnel::{self, Phase};
use super::upstream::Upstream;
use crate::ca::LeafCache;

/// Headers that only describe a single hop.
const HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Client-supplied forwarding headers; the proxy neither trusts nor adds them.
const FORWARDING_HEADERS: &[&str] = &[
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "forwarded",
];

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("responder does not support connection takeover")]
    NotHijackable,
    #[error("request has no host")]
    MissingHost,
    #[error("invalid upstream URI: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),
    #[error("failed to read request body: {0}")]
    RequestBody(#[source] Box<dyn StdError + Send + Sync>),
    #[error("upstream request failed: {0}")]
    Upstream(#[source] hyper_util::client::legacy::Error),
    #[error("failed to read upstream body: {0}")]
    ResponseBody(#[source] hyper::Error),
    #[error(transparent)]
    Middleware(#[from] MiddlewareError),
    #[error("request canceled")]
    Canceled,
}

impl ProxyError {
    fn from_client(err: hyper_util::client::legacy::Error) -> Self {
        if is_canceled(&err) {
            Self::Canceled
        } else {
            Self::Upstream(err)
        }
    }

    fn from_body(err: hyper::Error) -> Self {
        if err.is_canceled() {
            Self::Canceled
        } else {
            Self::ResponseBody(err)
        }
    }
}

fn is_canceled(err: &(dyn StdError + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(e) = source {
        if let Some(hyper_err) = e.downcast_ref::<hyper::Error>()
            && hyper_err.is_canceled()
        {
            return true;
        }
        source = e.source();
    }
    false
}

/// Handshake and idle limits.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub handshake: Duration,
    pub header_read: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(10),
            header_read: Duration::from_secs(30),
        }
    }
}

/// Routes CONNECT to the tunnel bridge and everything else upstream
/// through the middleware chains.
pub struct Dispatcher {
    cache: Arc<LeafCache>,
    tls: TlsAcceptor,
    upstream: Upstream,
    request_chain: Chain<RequestModifier>,
    response_chain: Chain<ResponseModifier>,
    timeouts: Timeouts,
    tunnels: Arc<AtomicUsize>,
}

impl Dispatcher {
    /// Creates a dispatcher issuing leaves from `cache` and forwarding
    /// through `upstream`.
    pub fn new(cache: Arc<LeafCache>, upstream: Upstream, timeouts: Timeouts) -> Self {
        Self {
            tls: TlsAcceptor::new(Arc::clone(&cache), timeouts.handshake),
            cache,
            upstream,
            request_chain: Chain::new(),
            response_chain: Chain::new(),
            timeouts,
            tunnels: Arc::default(),
        }
    }

    /// Appends a request stage. Call during setup.
    pub fn add_request_middleware(&self, stage: RequestMiddleware) {
        self.request_chain.push(stage);
    }

    /// Appends a response stage. Call during setup.
    pub fn add_response_middleware(&self, stage: ResponseMiddleware) {
        self.response_chain.push(stage);
    }

    /// Returns the leaf cache backing the TLS acceptor.
    pub fn leaf_cache(&self) -> &Arc<LeafCache> {
        &self.cache
    }

    /// Returns the number of CONNECT tunnels whose bridge has not finished.
    pub fn active_tunnels(&self) -> usize {
        self.tunnels.load(Ordering::Acquire)
    }

    pub(crate) fn tunnel_counter(&self) -> &Arc<AtomicUsize> {
        &self.tunnels
    }

    pub(crate) fn tls(&self) -> &TlsAcceptor {
        &self.tls
    }

    pub(crate) fn header_read_timeout(&self) -> Duration {
        self.timeouts.header_read
    }

    /// Handles one request from a client or from inside a tunnel.
    pub async fn handle<B>(
        self: Arc<Self>,
        req: Request<B>,
        peer: SocketAddr,
    ) -> Result<Response<Full<Bytes>>, Infallible>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let result = if req.method() == Method::CONNECT {
            self.handle_connect(req, peer)
        } else {
            self.reverse_proxy(req).await
        };
        Ok(result.unwrap_or_else(|e| error_response(e, peer)))
    }

    fn handle_connect<B>(
        self: &Arc<Self>,
        mut req: Request<B>,
        peer: SocketAddr,
    ) -> Result<Response<Full<Bytes>>, ProxyError> {
        let on_upgrade = req
            .extensions_mut()
            .remove::<OnUpgrade>()
            .ok_or(ProxyError::NotHijackable)?;
        let target = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| req.uri().to_string());

        debug!("tunnel to {} from {} {:?}", target, peer, Phase::Accepted);
        tokio::spawn(tunnel::run(on_upgrade, target, peer, Arc::clone(self)));

        // The upgrade completes once this empty 200 has been written.
        Ok(Response::new(Full::new(Bytes::new())))
    }

    async fn reverse_proxy<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, ProxyError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let (mut parts, body) = req.into_parts();
        direct(&mut parts)?;
        let body = body
            .collect()
            .await
            .map_err(|e| ProxyError::RequestBody(e.into()))?
            .to_bytes();

        let mut req = Request::from_parts(parts, body);
        self.request_chain.compose(nop_request_modifier())(&mut req);
        let method = req.method().clone();

        let res = self
            .upstream
            .send(outbound(req))
            .await
            .map_err(ProxyError::from_client)?;

        let (parts, body) = res.into_parts();
        let body = body
            .collect()
            .await
            .map_err(ProxyError::from_body)?
            .to_bytes();

        let mut res = Response::from_parts(parts, body);
        self.response_chain.compose(nop_response_modifier())(&mut res)?;

        Ok(relay(&method, res))
    }
}

/// Points origin-form requests at `https://{Host}` and drops forwarding
/// headers.
pub(crate) fn direct(parts: &mut http::request::Parts) -> Result<(), ProxyError> {
    if parts.uri.scheme().is_none() {
        let host = parts
            .headers
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .filter(|h| !h.is_empty())
            .ok_or(ProxyError::MissingHost)?;
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        parts.uri = format!("https://{host}{path}").parse()?;
    }

    for name in FORWARDING_HEADERS {
        parts.headers.remove(*name);
    }
    Ok(())
}

fn strip_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_HEADERS {
        headers.remove(*name);
    }
}

fn set_content_length(headers: &mut HeaderMap, len: usize) {
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
}

fn outbound(req: Request<Bytes>) -> Request<Full<Bytes>> {
    let (mut parts, body) = req.into_parts();
    strip_hop_headers(&mut parts.headers);
    parts.headers.remove(CONTENT_LENGTH);
    if !body.is_empty() {
        set_content_length(&mut parts.headers, body.len());
    }
    Request::from_parts(parts, Full::new(body))
}

/// Whether a response to `method` with `status` never carries a body.
fn is_bodiless(method: &Method, status: StatusCode) -> bool {
    method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

fn relay(method: &Method, res: Response<Bytes>) -> Response<Full<Bytes>> {
    let (mut parts, body) = res.into_parts();
    strip_hop_headers(&mut parts.headers);
    if !is_bodiless(method, parts.status) {
        set_content_length(&mut parts.headers, body.len());
    } else if parts.status.is_informational() || parts.status == StatusCode::NO_CONTENT {
        parts.headers.remove(CONTENT_LENGTH);
    }
    // Otherwise HEAD and 304 keep the upstream length of the resource.
    Response::from_parts(parts, Full::new(body))
}

/// The single place proxy failures become client responses.
fn error_response(err: ProxyError, peer: SocketAddr) -> Response<Full<Bytes>> {
    let status = match &err {
        ProxyError::Canceled => {
            debug!("request from {} canceled", peer);
            StatusCode::BAD_GATEWAY
        }
        ProxyError::NotHijackable => {
            error!("CONNECT from {}: {}", peer, err);
            StatusCode::SERVICE_UNAVAILABLE
        }
        ProxyError::MissingHost | ProxyError::InvalidUri(_) | ProxyError::RequestBody(_) => {
            warn!("bad request from {}: {}", peer, err);
            StatusCode::BAD_REQUEST
        }
        _ => {
            error!("proxy error for {}: {}", peer, err);
            StatusCode::BAD_GATEWAY
        }
    };

    let reason = status.canonical_reason().unwrap_or("error");
    let mut res = Response::new(Full::new(Bytes::from(reason)));
    *res.status_mut() = status;
    res.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::{LeafIssuer, LeafPolicy, RootAuthority, RootSubject};
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    fn dispatcher() -> Arc<Dispatcher> {
        let root = RootAuthority::generate(&RootSubject {
            common_name: "dispatcher test root".into(),
            organization: "dispatcher tests".into(),
            validity: time::Duration::days(1),
        })
        .unwrap();
        let issuer = LeafIssuer::new(Arc::new(root), LeafPolicy::default());
        let cache = Arc::new(LeafCache::new(issuer, 8, time::Duration::minutes(5)));
        Arc::new(Dispatcher::new(cache, Upstream::new(), Timeouts::default()))
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    /// Serves `handler` over plain HTTP on an ephemeral port.
    async fn spawn_upstream<F, Fut>(handler: F) -> SocketAddr
    where
        F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<Full<Bytes>>, Infallible>> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let svc = service_fn(handler.clone());
                tokio::spawn(async move {
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await;
                });
            }
        });
        addr
    }

    /// Plain HTTP server that echoes what it received in the body.
    async fn echo_upstream() -> SocketAddr {
        spawn_upstream(|req: Request<Incoming>| async move {
            let seen = format!(
                "{} {} xff={:?} tag={:?} conn={:?}",
                req.method(),
                req.uri(),
                req.headers().get("x-forwarded-for"),
                req.headers().get("x-inspected"),
                req.headers().get("x-hop"),
            );
            let mut res = Response::new(Full::new(Bytes::from(seen)));
            res.headers_mut()
                .insert("keep-alive", HeaderValue::from_static("timeout=5"));
            Ok::<_, Infallible>(res)
        })
        .await
    }

    /// Serves a 1234-byte resource, and 204 on `/nothing`.
    async fn sized_upstream() -> SocketAddr {
        spawn_upstream(|req: Request<Incoming>| async move {
            let res = if req.uri().path() == "/nothing" {
                let mut res = Response::new(Full::new(Bytes::new()));
                *res.status_mut() = StatusCode::NO_CONTENT;
                res
            } else {
                let mut res = Response::new(Full::new(Bytes::from(vec![b'x'; 1234])));
                res.headers_mut()
                    .insert(CONTENT_LENGTH, HeaderValue::from(1234u32));
                res
            };
            Ok::<_, Infallible>(res)
        })
        .await
    }

    #[test]
    fn origin_form_is_directed_to_https_host() {
        let req = Request::builder()
            .uri("/search?q=rust")
            .header(HOST, "example.internal")
            .header("x-forwarded-for", "10.1.1.1")
            .header("forwarded", "for=10.1.1.1")
            .body(())
            .unwrap();
        let (mut parts, _) = req.into_parts();

        direct(&mut parts).unwrap();

        assert_eq!(parts.uri, "https://example.internal/search?q=rust");
        assert!(parts.headers.get("x-forwarded-for").is_none());
        assert!(parts.headers.get("forwarded").is_none());
    }

    #[test]
    fn absolute_form_is_kept() {
        let req = Request::builder()
            .uri("http://plain.example:8080/a")
            .header(HOST, "plain.example:8080")
            .body(())
            .unwrap();
        let (mut parts, _) = req.into_parts();

        direct(&mut parts).unwrap();
        assert_eq!(parts.uri, "http://plain.example:8080/a");
    }

    #[test]
    fn origin_form_without_host_is_rejected() {
        let (mut parts, _) = Request::builder().uri("/").body(()).unwrap().into_parts();
        assert!(matches!(direct(&mut parts), Err(ProxyError::MissingHost)));
    }

    #[test]
    fn outbound_strips_hop_headers() {
        let req = Request::builder()
            .uri("https://example.internal/")
            .header(CONNECTION, "keep-alive, x-hop")
            .header("x-hop", "1")
            .header("proxy-authorization", "Basic Zm9vOmJhcg==")
            .header("x-keep", "1")
            .body(Bytes::from_static(b"abc"))
            .unwrap();

        let out = outbound(req);
        let headers = out.headers();
        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get("x-hop").is_none());
        assert!(headers.get("proxy-authorization").is_none());
        assert_eq!(headers["x-keep"], "1");
        assert_eq!(headers[CONTENT_LENGTH], "3");
    }

    #[test]
    fn canceled_is_bad_gateway() {
        let res = error_response(ProxyError::Canceled, peer());
        assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    }

    /// CONNECT on a connection that cannot be taken over is refused.
    #[tokio::test]
    async fn connect_without_upgrade_is_unavailable() {
        let req = Request::builder()
            .method(Method::CONNECT)
            .uri("example.internal:443")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let res = dispatcher().handle(req, peer()).await.unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    /// A plain request runs both chains and reaches the upstream without
    /// forwarding or hop-by-hop headers.
    #[tokio::test]
    async fn plain_request_runs_middleware() {
        let upstream = echo_upstream().await;
        let dispatcher = dispatcher();
        dispatcher.add_request_middleware(Arc::new(|next: RequestModifier| -> RequestModifier {
            Arc::new(move |req: &mut Request<Bytes>| {
                req.headers_mut()
                    .insert("x-inspected", HeaderValue::from_static("1"));
                next(req);
            })
        }));
        dispatcher.add_response_middleware(Arc::new(
            |next: ResponseModifier| -> ResponseModifier {
                Arc::new(move |res: &mut Response<Bytes>| {
                    res.headers_mut()
                        .insert("x-relayed", HeaderValue::from_static("yes"));
                    next(res)
                })
            },
        ));

        let req = Request::builder()
            .uri(format!("http://{upstream}/echo?x=1"))
            .header(HOST, upstream.to_string())
            .header("x-forwarded-for", "10.0.0.1")
            .header(CONNECTION, "x-hop")
            .header("x-hop", "secret")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let res = dispatcher.handle(req, peer()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["x-relayed"], "yes");
        assert!(res.headers().get("keep-alive").is_none());

        let body = res.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8_lossy(&body);
        assert!(body.starts_with("GET /echo?x=1"), "{body}");
        assert!(body.contains("xff=None"), "{body}");
        assert!(body.contains("tag=Some(\"1\")"), "{body}");
        assert!(body.contains("conn=None"), "{body}");
    }

    #[tokio::test]
    async fn response_middleware_error_is_bad_gateway() {
        let upstream = echo_upstream().await;
        let dispatcher = dispatcher();
        dispatcher.add_response_middleware(Arc::new(
            |_next: ResponseModifier| -> ResponseModifier {
                Arc::new(|_: &mut Response<Bytes>| -> Result<(), MiddlewareError> {
                    Err(MiddlewareError("denied".into()))
                })
            },
        ));

        let req = Request::builder()
            .uri(format!("http://{upstream}/"))
            .header(HOST, upstream.to_string())
            .body(Full::new(Bytes::new()))
            .unwrap();

        let res = dispatcher.handle(req, peer()).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    }

    fn plain_request(method: Method, addr: SocketAddr, path: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(format!("http://{addr}{path}"))
            .header(HOST, addr.to_string())
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    /// HEAD keeps the length of the resource rather than of the empty body.
    #[tokio::test]
    async fn head_keeps_upstream_content_length() {
        let upstream = sized_upstream().await;
        let dispatcher = dispatcher();

        let req = plain_request(Method::HEAD, upstream, "/resource");
        let res = Arc::clone(&dispatcher).handle(req, peer()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[CONTENT_LENGTH], "1234");
        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());

        let req = plain_request(Method::GET, upstream, "/resource");
        let res = dispatcher.handle(req, peer()).await.unwrap();
        assert_eq!(res.headers()[CONTENT_LENGTH], "1234");
    }

    #[tokio::test]
    async fn no_content_carries_no_length() {
        let upstream = sized_upstream().await;

        let req = plain_request(Method::GET, upstream, "/nothing");
        let res = dispatcher().handle(req, peer()).await.unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert!(res.headers().get(CONTENT_LENGTH).is_none());
    }

    #[test]
    fn bodiless_responses() {
        assert!(is_bodiless(&Method::HEAD, StatusCode::OK));
        assert!(is_bodiless(&Method::GET, StatusCode::NOT_MODIFIED));
        assert!(is_bodiless(&Method::GET, StatusCode::NO_CONTENT));
        assert!(is_bodiless(&Method::GET, StatusCode::CONTINUE));
        assert!(!is_bodiless(&Method::GET, StatusCode::OK));
        assert!(!is_bodiless(&Method::POST, StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn unreachable_upstream_is_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let req = Request::builder()
            .uri(format!("http://{addr}/"))
            .header(HOST, addr.to_string())
            .body(Full::new(Bytes::new()))
            .unwrap();

        let res = dispatcher().handle(req, peer()).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    }
}
