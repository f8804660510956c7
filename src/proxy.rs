use crate::admin::VERSION;
use crate::assets::assets_for;
use crate::config::RouteKind;
use crate::context::AppContext;
use crate::error::{json_error_response, BodyError, ProxyErrorCode};
use crate::hub::{BroadcastHub, HubEvent, PREVIEW_SCAN_BYTES};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Deserialize;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{Instant, Sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Largest body frame handed to a client while streaming
pub const STREAM_CHUNK_BYTES: usize = 4096;

type ProxyResponse = Response<BoxBody<Bytes, BodyError>>;

/// One listening port of the proxy
pub struct ProxyServer {
    bind_addr: SocketAddr,
    ctx: Arc<AppContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, ctx: Arc<AppContext>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            ctx,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let listen_port = self.bind_addr.port();
        let kind = self.ctx.routes.get(listen_port).map(|r| r.kind);
        info!(addr = %self.bind_addr, ?kind, "Proxy listener started (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&self.ctx);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, listen_port, ctx).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(port = listen_port, "Proxy listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    listen_port: u16,
    ctx: Arc<AppContext>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { handle_request(req, listen_port, ctx, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

pub async fn handle_request(
    req: Request<Incoming>,
    listen_port: u16,
    ctx: Arc<AppContext>,
    client_addr: SocketAddr,
) -> Result<ProxyResponse, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(listen_port, %method, path, request_id, "Incoming request");

    let observe = &ctx.config.observe;
    let response = if method == Method::OPTIONS {
        preflight_response()
    } else if method == Method::GET && path == "/health" {
        diagnostics_response(&ctx).await
    } else if method == Method::GET && observe.is_observe_path(&path) {
        event_stream_response(&ctx.hub)
    } else if method == Method::POST && observe.is_send_path(&path) {
        send_response(req, &ctx).await
    } else {
        forward(req, listen_port, &ctx, client_addr, request_id).await
    };

    Ok(with_cors(response))
}

fn with_cors(mut response: ProxyResponse) -> ProxyResponse {
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    response
}

fn full_body(body: impl Into<Bytes>) -> BoxBody<Bytes, BodyError> {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

fn json_response(status: StatusCode, value: serde_json::Value) -> ProxyResponse {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(full_body(value.to_string()))
        .expect("valid response with StatusCode enum and static header")
}

fn preflight_response() -> ProxyResponse {
    Response::builder()
        .status(StatusCode::OK)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

async fn diagnostics_response(ctx: &AppContext) -> ProxyResponse {
    if let Err(e) = ctx.discovery.refresh(false).await {
        debug!(error = %e, "Discovery pending");
    }
    let endpoint = ctx.discovery.get();
    let rpc_port = endpoint.as_ref().and_then(|e| e.rpc_port);

    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": if rpc_port.is_some() { "connected" } else { "detecting" },
            "rpcPort": rpc_port,
            "uiPort": endpoint.as_ref().map(|e| e.ui_port),
            "tokenPreview": endpoint.as_ref().and_then(|e| e.token_preview()),
            "observerCount": ctx.hub.observer_count(),
            "health": ctx.supervisor.state(),
            "version": VERSION,
            "time": chrono::Utc::now().timestamp(),
        }),
    )
}

fn event_stream_response(hub: &BroadcastHub) -> ProxyResponse {
    let stream = hub.event_stream(VERSION);
    debug!(observer = stream.observer_id(), "Event stream opened");
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("X-Accel-Buffering", "no")
        .body(stream.map_err(|never| match never {}).boxed())
        .expect("valid response with static headers")
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    #[serde(default)]
    message: String,
}

async fn send_response(req: Request<Incoming>, ctx: &AppContext) -> ProxyResponse {
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return json_error_response(ProxyErrorCode::BadRequest, format!("Failed to read body: {}", e));
        }
    };
    let request: SendRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return json_error_response(ProxyErrorCode::BadRequest, format!("Invalid JSON: {}", e));
        }
    };

    let message = request.message.trim();
    if message.is_empty() {
        return json_response(
            StatusCode::OK,
            serde_json::json!({ "sent": false, "reason": "empty message" }),
        );
    }

    match ctx.injector.inject(message).await {
        Ok(()) => {
            ctx.hub.publish(HubEvent::sent(message));
            info!(length = message.chars().count(), "Message sent");
            json_response(
                StatusCode::OK,
                serde_json::json!({ "sent": true, "length": message.chars().count() }),
            )
        }
        Err(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "sent": false, "reason": e.to_string() }),
        ),
    }
}

async fn forward(
    mut req: Request<Incoming>,
    listen_port: u16,
    ctx: &AppContext,
    client_addr: SocketAddr,
    request_id: String,
) -> ProxyResponse {
    if ctx.routes.get(listen_port).is_none() {
        return json_error_response(ProxyErrorCode::NoRoute, "No route for this port");
    }

    let path = req.uri().path().to_string();
    let head = req.method() == Method::HEAD;

    let endpoint = match ctx.discovery.refresh(false).await {
        Ok(endpoint) => endpoint,
        Err(e) => {
            warn!(listen_port, error = %e, "Backend discovery failed");
            return json_error_response(ProxyErrorCode::DiscoveryFailed, e.to_string());
        }
    };

    // Re-read after the refresh, which may have moved the upstream
    let Some(route) = ctx.routes.get(listen_port) else {
        return json_error_response(ProxyErrorCode::NoRoute, "No route for this port");
    };

    let kind = if route.kind == RouteKind::Ui && path.starts_with(&ctx.config.rewrite.rpc_path_prefix) {
        RouteKind::Rpc
    } else {
        route.kind
    };
    let upstream_port = match (route.kind, kind) {
        (RouteKind::Ui, RouteKind::Rpc) => endpoint.rpc_port,
        _ => route.upstream_port,
    };
    let Some(upstream_port) = upstream_port else {
        return json_error_response(
            ProxyErrorCode::BackendNotDiscovered,
            "Backend not discovered yet",
        );
    };
    let upstream_host = route.upstream_host.clone();

    let headers = req.headers_mut();
    prepare_request_headers(headers, &upstream_host, upstream_port, &request_id, client_addr);
    if kind == RouteKind::Rpc {
        if let Some(token) = endpoint.auth_token.as_deref() {
            match (
                HeaderName::from_bytes(ctx.config.rewrite.token_header.as_bytes()),
                HeaderValue::from_str(token),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!("Auth token cannot be sent as a header"),
            }
        }
    }

    let timeout = ctx.config.server.request_timeout();
    let result = tokio::time::timeout(
        timeout,
        ctx.pool.send_request(req, &upstream_host, upstream_port),
    )
    .await;

    let response = match result {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!(listen_port, upstream_port, error = %e, "Failed to forward request");
            return json_error_response(ProxyErrorCode::ConnectionFailed, e.to_string());
        }
        Err(_) => {
            warn!(
                listen_port,
                upstream_port,
                timeout_secs = timeout.as_secs(),
                "Request timed out"
            );
            return json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", timeout.as_secs()),
            );
        }
    };

    debug!(listen_port, upstream_port, status = %response.status(), request_id, "Upstream responded");

    let (mut parts, body) = response.into_parts();
    // hop-by-hop
    for name in [header::TRANSFER_ENCODING, header::CONNECTION] {
        parts.headers.remove(name);
    }

    let body = TimedBody::new(body, timeout);
    match kind {
        RouteKind::Rpc => {
            let body = CaptureBody::new(body.boxed(), path, ctx.hub.clone());
            Response::from_parts(parts, body.boxed())
        }
        RouteKind::Ui if !head && has_body(parts.status) && is_html(&parts.headers) => {
            let collected = match tokio::time::timeout(timeout, body.collect()).await {
                Ok(Ok(collected)) => collected.to_bytes(),
                Ok(Err(BodyError::Upstream(e))) => {
                    error!(listen_port, error = %e, "Failed to read UI document");
                    return json_error_response(ProxyErrorCode::ConnectionFailed, e.to_string());
                }
                Ok(Err(BodyError::Stalled(_))) | Err(_) => {
                    warn!(listen_port, timeout_secs = timeout.as_secs(), "UI document timed out");
                    return json_error_response(
                        ProxyErrorCode::RequestTimeout,
                        format!("Request timed out after {} seconds", timeout.as_secs()),
                    );
                }
            };

            let rewrite = ctx.rewriter.rewrite(
                &collected,
                &assets_for(route.profile),
                &ctx.proxy_base_url(listen_port),
            );
            if rewrite.upstream_port.is_some() || rewrite.token.is_some() {
                ctx.discovery.observe_embedded(rewrite.upstream_port, rewrite.token);
            }

            parts.headers.remove(header::CONTENT_ENCODING);
            parts.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(rewrite.body.len()));
            Response::from_parts(parts, full_body(rewrite.body))
        }
        RouteKind::Ui => Response::from_parts(parts, body.boxed()),
    }
}

/// Statuses that never carry a body, whatever their headers say
fn has_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

fn prepare_request_headers(
    headers: &mut HeaderMap,
    upstream_host: &str,
    upstream_port: u16,
    request_id: &str,
    client_addr: SocketAddr,
) {
    for name in [
        header::HOST,
        header::ACCEPT_ENCODING,
        header::CONTENT_LENGTH,
        header::TRANSFER_ENCODING,
        header::CONNECTION,
    ] {
        headers.remove(name);
    }

    if let Ok(value) = HeaderValue::from_str(&format!("{}:{}", upstream_host, upstream_port)) {
        headers.insert(header::HOST, value);
    }
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("text/html"))
        .unwrap_or(false)
}

/// Upstream body that fails once no frame arrives for `timeout`. The
/// deadline restarts with every frame, so long streams are fine as long as
/// they keep moving.
pub struct TimedBody {
    inner: BoxBody<Bytes, hyper::Error>,
    timeout: Duration,
    idle: Pin<Box<Sleep>>,
}

impl TimedBody {
    pub fn new(inner: BoxBody<Bytes, hyper::Error>, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            idle: Box::pin(tokio::time::sleep(timeout)),
        }
    }
}

impl Body for TimedBody {
    type Data = Bytes;
    type Error = BodyError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                this.idle.as_mut().reset(Instant::now() + this.timeout);
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e.into()))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => match this.idle.as_mut().poll(cx) {
                Poll::Ready(()) => Poll::Ready(Some(Err(BodyError::Stalled(this.timeout)))),
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Streams an RPC response through in small frames while keeping a bounded
/// prefix and the total size. The capture is published to the hub once the
/// upstream body ends; a client that goes away drops it unpublished.
pub struct CaptureBody {
    inner: BoxBody<Bytes, BodyError>,
    pending: Bytes,
    prefix: Vec<u8>,
    size: u64,
    path: String,
    hub: BroadcastHub,
    finished: bool,
}

impl CaptureBody {
    pub fn new(inner: BoxBody<Bytes, BodyError>, path: String, hub: BroadcastHub) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
            prefix: Vec::new(),
            size: 0,
            path,
            hub,
            finished: false,
        }
    }

    fn next_chunk(&mut self) -> Bytes {
        let n = self.pending.len().min(STREAM_CHUNK_BYTES);
        self.pending.split_to(n)
    }

    fn record(&mut self, data: &Bytes) {
        self.size += data.len() as u64;
        let room = PREVIEW_SCAN_BYTES.saturating_sub(self.prefix.len());
        self.prefix.extend_from_slice(&data[..data.len().min(room)]);
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if self.size > 0 && self.hub.observer_count() > 0 {
            self.hub
                .publish(HubEvent::response(self.path.clone(), &self.prefix, self.size));
        }
    }

    fn emit_chunk(&mut self) -> Poll<Option<Result<Frame<Bytes>, BodyError>>> {
        let chunk = self.next_chunk();
        if self.pending.is_empty() && self.inner.is_end_stream() {
            self.finish();
        }
        Poll::Ready(Some(Ok(Frame::data(chunk))))
    }
}

impl Body for CaptureBody {
    type Data = Bytes;
    type Error = BodyError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if !this.pending.is_empty() {
            return this.emit_chunk();
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                Ok(data) => {
                    this.record(&data);
                    this.pending = data;
                    this.emit_chunk()
                }
                Err(frame) => Poll::Ready(Some(Ok(frame))),
            },
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.pending.is_empty() && self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        let mut hint = self.inner.size_hint();
        let pending = self.pending.len() as u64;
        hint.set_lower(hint.lower() + pending);
        if let Some(upper) = hint.upper() {
            hint.set_upper(upper + pending);
        }
        hint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn boxed(data: &'static [u8]) -> BoxBody<Bytes, BodyError> {
        full_body(Bytes::from_static(data))
    }

    /// Yields one frame and then never makes progress again
    struct StallAfter {
        first: Option<Bytes>,
    }

    impl Body for StallAfter {
        type Data = Bytes;
        type Error = hyper::Error;

        fn poll_frame(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
            match self.get_mut().first.take() {
                Some(data) => Poll::Ready(Some(Ok(Frame::data(data)))),
                None => Poll::Pending,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_body_fails_when_upstream_stalls() {
        let inner = StallAfter {
            first: Some(Bytes::from_static(b"partial")),
        };
        let mut body = TimedBody::new(inner.boxed(), Duration::from_secs(1));

        tokio::time::advance(Duration::from_millis(900)).await;
        let first = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(first.as_ref(), b"partial");

        // The frame pushed the deadline out by a full second
        let started = Instant::now();
        let err = body.frame().await.unwrap().unwrap_err();
        assert!(matches!(err, BodyError::Stalled(d) if d == Duration::from_secs(1)));
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_rpc_body_is_not_published() {
        let hub = BroadcastHub::new(8, Duration::from_secs(25));
        let mut observer = hub.subscribe();

        let inner = StallAfter {
            first: Some(Bytes::from_static(b"{\"partial\"")),
        };
        let timed = TimedBody::new(inner.boxed(), Duration::from_secs(1));
        let mut body = CaptureBody::new(timed.boxed(), "/exa.X/Y".to_string(), hub.clone());

        assert!(body.frame().await.unwrap().is_ok());
        assert!(body.frame().await.unwrap().is_err());

        hub.publish(HubEvent::Ping { t: 0 });
        assert!(matches!(observer.recv().await, Some(HubEvent::Ping { .. })));
    }

    #[tokio::test]
    async fn test_capture_body_chunks_and_publishes() {
        let hub = BroadcastHub::new(8, Duration::from_secs(25));
        let mut observer = hub.subscribe();

        let payload: &'static [u8] = Box::leak(vec![b'a'; 10_000].into_boxed_slice());
        let mut body = CaptureBody::new(boxed(payload), "/exa.Chat/Stream".to_string(), hub.clone());

        let mut sizes = Vec::new();
        while let Some(frame) = body.frame().await {
            let data = frame.unwrap().into_data().unwrap();
            sizes.push(data.len());
        }
        assert_eq!(sizes, vec![4096, 4096, 1808]);

        match observer.recv().await.unwrap() {
            HubEvent::Response { path, size, preview, .. } => {
                assert_eq!(path, "/exa.Chat/Stream");
                assert_eq!(size, 10_000);
                assert_eq!(preview.len(), 200);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_capture_body_publishes_once() {
        let hub = BroadcastHub::new(8, Duration::from_secs(25));
        let mut observer = hub.subscribe();

        let mut body = CaptureBody::new(boxed(b"{\"ok\":true}"), "/exa.X/Y".to_string(), hub.clone());
        while body.frame().await.is_some() {}
        // Polling past the end does not publish again
        assert!(body.frame().await.is_none());

        assert!(observer.recv().await.is_some());
        assert_eq!(hub.publish(HubEvent::Ping { t: 0 }), 1);
        assert!(matches!(observer.recv().await, Some(HubEvent::Ping { .. })));
    }

    #[tokio::test]
    async fn test_empty_rpc_body_not_published() {
        let hub = BroadcastHub::new(8, Duration::from_secs(25));
        let mut observer = hub.subscribe();
        let mut body = CaptureBody::new(boxed(b""), "/exa.X/Y".to_string(), hub.clone());
        while body.frame().await.is_some() {}

        hub.publish(HubEvent::Ping { t: 0 });
        assert!(matches!(observer.recv().await, Some(HubEvent::Ping { .. })));
    }

    #[test]
    fn test_prepare_request_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("proxy:8891"));
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/grpc-web"));

        let addr: SocketAddr = "192.168.1.20:5555".parse().unwrap();
        prepare_request_headers(&mut headers, "127.0.0.1", 37417, "req-1", addr);

        assert_eq!(headers.get(header::HOST).unwrap(), "127.0.0.1:37417");
        assert!(headers.get(header::ACCEPT_ENCODING).is_none());
        assert!(headers.get(header::CONTENT_LENGTH).is_none());
        assert!(headers.get(header::CONNECTION).is_none());
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "application/grpc-web");
        assert_eq!(headers.get(X_REQUEST_ID).unwrap(), "req-1");
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "192.168.1.20");
    }

    #[test]
    fn test_is_html() {
        let mut headers = HeaderMap::new();
        assert!(!is_html(&headers));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("Text/HTML; charset=utf-8"));
        assert!(is_html(&headers));
    }

    #[test]
    fn test_has_body() {
        assert!(has_body(StatusCode::OK));
        assert!(has_body(StatusCode::NOT_FOUND));
        assert!(!has_body(StatusCode::NO_CONTENT));
        assert!(!has_body(StatusCode::NOT_MODIFIED));
        assert!(!has_body(StatusCode::SWITCHING_PROTOCOLS));
    }

    #[test]
    fn test_cors_headers() {
        let response = with_cors(preflight_response());
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(),
            "true"
        );
    }
}
