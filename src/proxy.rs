//! Authenticated gateway in front of the supervised services
//!
//! Routes:
//! - `/proxy/:port/<rest>`: service registered on that port
//! - `/app/:name/<rest>`: service registered under that name
//!
//! Every request passes the identity gate before the registry is consulted,
//! and only services the supervisor reports as Healthy receive traffic.

use crate::auth::IdentityGate;
use crate::error::{json_error_response, BoxError, GatewayBody, GatewayErrorCode};
use crate::pool::{ConnectionPool, PoolError};
use crate::registry::ServiceDescriptor;
use crate::supervisor::{ServiceStatus, Supervisor};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{Instant, Sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_PREFIX: &str = "x-forwarded-prefix";
const X_AUTHENTICATED_USER: &str = "x-authenticated-user";

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Largest upgrade response head accepted from a backend
const MAX_HANDSHAKE_LEN: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget<'a> {
    Port(u16),
    Name(&'a str),
}

/// A parsed gateway path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route<'a> {
    pub target: RouteTarget<'a>,
    /// Path prefix consumed by the gateway, e.g. `/proxy/5006`
    pub prefix: &'a str,
    /// Remainder forwarded to the service, possibly empty
    pub rest: &'a str,
}

impl Route<'_> {
    /// Backend path and query for this route
    pub fn backend_path(&self, query: Option<&str>) -> String {
        let path = if self.rest.is_empty() { "/" } else { self.rest };
        match query {
            Some(q) => format!("{}?{}", path, q),
            None => path.to_string(),
        }
    }
}

pub fn parse_route(path: &str) -> Option<Route<'_>> {
    let (by_port, tail) = if let Some(tail) = path.strip_prefix("/proxy/") {
        (true, tail)
    } else if let Some(tail) = path.strip_prefix("/app/") {
        (false, tail)
    } else {
        return None;
    };

    let (segment, rest) = match tail.find('/') {
        Some(idx) => tail.split_at(idx),
        None => (tail, ""),
    };
    if segment.is_empty() {
        return None;
    }

    let target = if by_port {
        let port = segment.parse::<u16>().ok().filter(|p| *p != 0)?;
        RouteTarget::Port(port)
    } else {
        RouteTarget::Name(segment)
    };

    Some(Route {
        target,
        prefix: &path[..path.len() - rest.len()],
        rest,
    })
}

/// Remove hop-by-hop headers, including any named in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Check if a request asks for a protocol upgrade (WebSocket)
fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// State shared by every gateway connection
struct GatewayContext {
    supervisor: Arc<Supervisor>,
    gate: Arc<IdentityGate>,
    pool: Arc<ConnectionPool>,
}

pub struct GatewayServer {
    bind_addr: SocketAddr,
    context: Arc<GatewayContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(
        bind_addr: SocketAddr,
        supervisor: Arc<Supervisor>,
        gate: Arc<IdentityGate>,
        pool: Arc<ConnectionPool>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            context: Arc::new(GatewayContext {
                supervisor,
                gate,
                pool,
            }),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already-bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, context).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
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
    context: Arc<GatewayContext>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { handle_request(req, context, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    context: Arc<GatewayContext>,
    client_addr: SocketAddr,
) -> Result<Response<GatewayBody>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Nothing below runs for an unauthenticated caller
    let session = match context.gate.authenticate(req.headers()) {
        Ok(session) => session,
        Err(e) => {
            debug!(request_id, uri = %req.uri(), error = %e, "Rejected request");
            return Ok(json_error_response(
                GatewayErrorCode::Unauthenticated,
                "Authentication required",
            ));
        }
    };

    let path = req.uri().path().to_string();
    let Some(route) = parse_route(&path) else {
        return Ok(json_error_response(
            GatewayErrorCode::NotFound,
            "Use /proxy/:port/ or /app/:name/",
        ));
    };

    let registry = context.supervisor.registry();
    let lookup = match route.target {
        RouteTarget::Port(port) => registry.lookup_port(port),
        RouteTarget::Name(name) => registry.lookup(name),
    };
    let descriptor = match lookup {
        Ok(descriptor) => Arc::clone(descriptor),
        Err(e) => {
            debug!(request_id, path, "No service for route");
            return Ok(json_error_response(GatewayErrorCode::NotFound, e.to_string()));
        }
    };

    let status = context.supervisor.status(&descriptor.name);
    if status != ServiceStatus::Healthy {
        debug!(request_id, service = %descriptor.name, %status, "Service not healthy");
        return Ok(json_error_response(
            GatewayErrorCode::ServiceUnavailable,
            format!("Service '{}' is {}", descriptor.name, status),
        ));
    }

    debug!(
        request_id,
        service = %descriptor.name,
        user = %session.user,
        method = %req.method(),
        uri = %req.uri(),
        "Routing request"
    );

    let backend_path = route.backend_path(req.uri().query());
    match backend_path.parse::<Uri>() {
        Ok(uri) => *req.uri_mut() = uri,
        Err(e) => {
            error!(request_id, error = %e, "Failed to rewrite request URI");
            return Ok(json_error_response(
                GatewayErrorCode::InternalError,
                "Failed to rewrite request",
            ));
        }
    }

    let upgrade_type = is_upgrade_request(&req)
        .then(|| req.headers().get(hyper::header::UPGRADE).cloned())
        .flatten();

    let prefix = route.prefix.to_string();
    let headers = req.headers_mut();
    strip_hop_by_hop(headers);

    // Overwrite rather than append: the gateway is the first trusted hop
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    if let Ok(value) = HeaderValue::from_str(&prefix) {
        headers.insert(X_FORWARDED_PREFIX, value);
    }
    match HeaderValue::from_str(&session.user) {
        Ok(value) => {
            headers.insert(X_AUTHENTICATED_USER, value);
        }
        Err(_) => {
            headers.remove(X_AUTHENTICATED_USER);
        }
    }

    if let Some(upgrade) = upgrade_type {
        headers.insert(hyper::header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(hyper::header::UPGRADE, upgrade);
        return handle_upgrade(req, context, descriptor, request_id).await;
    }

    forward(req, &context, &descriptor, request_id).await
}

async fn forward(
    req: Request<Incoming>,
    context: &GatewayContext,
    descriptor: &ServiceDescriptor,
    request_id: String,
) -> Result<Response<GatewayBody>, hyper::Error> {
    let service = descriptor.name.as_str();
    let port = descriptor.port;
    let request_timeout = descriptor.policy.request_timeout;
    // One deadline for the whole exchange, body included
    let deadline = Instant::now() + request_timeout;

    let result = tokio::time::timeout_at(deadline, context.pool.send_request(req, port)).await;

    match result {
        Ok(Ok(response)) => {
            let (mut parts, body) = response.into_parts();
            strip_hop_by_hop(&mut parts.headers);

            let body = DeadlineBody::new(body, deadline, service.to_string(), request_id);
            Ok(Response::from_parts(parts, body.boxed()))
        }
        Ok(Err(e)) => {
            let code = match e {
                PoolError::Connect(_) => GatewayErrorCode::ConnectionFailed,
                PoolError::Closed(_) => GatewayErrorCode::UpstreamClosed,
                PoolError::RequestBuild(_) => GatewayErrorCode::InternalError,
            };
            error!(service, port, request_id, error = %e, "Failed to forward request");
            Ok(json_error_response(code, format!("Service '{}' did not respond", service)))
        }
        Err(_) => {
            context.pool.stats().record_failure();
            warn!(
                service,
                port,
                request_id,
                timeout_secs = request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                GatewayErrorCode::Timeout,
                format!(
                    "Request timed out after {} seconds",
                    request_timeout.as_secs()
                ),
            ))
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("response body not finished before the request deadline")]
struct BodyDeadlineExceeded;

/// Streams a backend response body and aborts it once the request
/// deadline passes. Failures are logged with their gateway error code.
struct DeadlineBody {
    inner: BoxBody<Bytes, hyper::Error>,
    deadline: Pin<Box<Sleep>>,
    service: String,
    request_id: String,
}

impl DeadlineBody {
    fn new(
        inner: BoxBody<Bytes, hyper::Error>,
        deadline: Instant,
        service: String,
        request_id: String,
    ) -> Self {
        Self {
            inner,
            deadline: Box::pin(tokio::time::sleep_until(deadline)),
            service,
            request_id,
        }
    }
}

impl Body for DeadlineBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        if let Poll::Ready(frame) = Pin::new(&mut self.inner).poll_frame(cx) {
            return Poll::Ready(frame.map(|result| {
                result.map_err(|e| {
                    warn!(
                        service = %self.service,
                        request_id = %self.request_id,
                        code = GatewayErrorCode::UpstreamClosed.as_header_value(),
                        error = %e,
                        "Backend failed mid-response"
                    );
                    BoxError::from(e)
                })
            }));
        }

        match self.deadline.as_mut().poll(cx) {
            Poll::Ready(()) => {
                warn!(
                    service = %self.service,
                    request_id = %self.request_id,
                    code = GatewayErrorCode::Timeout.as_header_value(),
                    "Response body exceeded the request deadline"
                );
                Poll::Ready(Some(Err(BodyDeadlineExceeded.into())))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Build the raw HTTP/1.1 upgrade request to send to the backend
fn build_upgrade_request(req: &Request<Incoming>, port: u16) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: 127.0.0.1:{}\r\n", port));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the status line and headers of a backend upgrade response head
fn parse_upgrade_response(head: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(head).ok()?;
    let mut lines = response_str.lines();

    // HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let code = status_line.split(' ').nth(1)?.parse::<u16>().ok()?;
    let status = StatusCode::from_u16(code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Read the backend's response head. Returns the head and any bytes read
/// past it, which already belong to the upgraded stream.
async fn read_upgrade_head(backend: &mut TcpStream) -> Result<(Vec<u8>, Vec<u8>), GatewayErrorCode> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = match backend.read(&mut chunk).await {
            Ok(0) => return Err(GatewayErrorCode::UpstreamClosed),
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "Failed to read upgrade response");
                return Err(GatewayErrorCode::UpstreamClosed);
            }
        };
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_head_end(&buf) {
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_HANDSHAKE_LEN {
            return Err(GatewayErrorCode::UpstreamClosed);
        }
    }
}

/// Connect to the backend and replay the upgrade handshake
async fn backend_handshake(
    raw_request: Vec<u8>,
    port: u16,
) -> Result<(TcpStream, StatusCode, Vec<(String, String)>, Vec<u8>), GatewayErrorCode> {
    let mut backend = TcpStream::connect(("127.0.0.1", port)).await.map_err(|e| {
        debug!(port, error = %e, "Failed to connect to backend for upgrade");
        GatewayErrorCode::ConnectionFailed
    })?;

    backend
        .write_all(&raw_request)
        .await
        .map_err(|_| GatewayErrorCode::UpstreamClosed)?;

    let (head, leftover) = read_upgrade_head(&mut backend).await?;
    let (status, headers) =
        parse_upgrade_response(&head).ok_or(GatewayErrorCode::UpstreamClosed)?;

    Ok((backend, status, headers, leftover))
}

async fn handle_upgrade(
    req: Request<Incoming>,
    context: Arc<GatewayContext>,
    descriptor: Arc<ServiceDescriptor>,
    request_id: String,
) -> Result<Response<GatewayBody>, hyper::Error> {
    let service = descriptor.name.clone();
    let port = descriptor.port;
    let request_timeout = descriptor.policy.request_timeout;
    debug!(service, request_id, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, port);
    let handshake = tokio::time::timeout(request_timeout, backend_handshake(raw_request, port)).await;
    let (backend, status, response_headers, leftover) = match handshake {
        Ok(Ok(parts)) => parts,
        Ok(Err(code)) => {
            context.pool.stats().record_failure();
            error!(service, port, request_id, code = code.as_header_value(), "Upgrade handshake failed");
            return Ok(json_error_response(
                code,
                format!("Service '{}' did not accept the upgrade", service),
            ));
        }
        Err(_) => {
            context.pool.stats().record_failure();
            warn!(service, port, request_id, "Upgrade handshake timed out");
            return Ok(json_error_response(
                GatewayErrorCode::Timeout,
                format!(
                    "Upgrade timed out after {} seconds",
                    request_timeout.as_secs()
                ),
            ));
        }
    };

    let response = match upgrade_response(status, &response_headers) {
        Some(response) => response,
        None => {
            context.pool.stats().record_failure();
            error!(service, port, request_id, "Backend sent an invalid upgrade response");
            return Ok(json_error_response(
                GatewayErrorCode::UpstreamClosed,
                format!("Service '{}' sent an invalid upgrade response", service),
            ));
        }
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(service, %status, "Backend rejected upgrade request");
        return Ok(response);
    }

    context.pool.stats().record_upgrade();
    info!(service, request_id, "Upgrade established");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                forward_bidirectional(upgraded, backend, leftover, &service, &request_id).await;
            }
            Err(e) => {
                error!(service, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}

/// Client-facing response for a backend upgrade reply. Headers that are
/// not valid HTTP are dropped; framing headers never apply to an upgrade.
fn upgrade_response(
    status: StatusCode,
    headers: &[(String, String)],
) -> Option<Response<GatewayBody>> {
    let mut response = Response::builder().status(status);
    for (name, value) in headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            debug!(header = %name, "Dropping invalid upgrade response header");
            continue;
        };
        if name == hyper::header::CONTENT_LENGTH || name == hyper::header::TRANSFER_ENCODING {
            continue;
        }
        if let Ok(value) = HeaderValue::from_str(value) {
            response = response.header(name, value);
        }
    }
    response
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .ok()
}

/// Relay bytes both ways until either side closes
async fn forward_bidirectional(
    client: Upgraded,
    mut backend: TcpStream,
    leftover: Vec<u8>,
    service: &str,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);

    if !leftover.is_empty() {
        if let Err(e) = client_io.write_all(&leftover).await {
            debug!(service, request_id, error = %e, "Client closed during upgrade");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                service,
                request_id,
                client_to_backend,
                backend_to_client,
                "Upgraded connection closed"
            );
        }
        Err(e) => {
            debug!(service, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}
