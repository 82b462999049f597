//! Operator API: service status, lifecycle control and session handoff.
//!
//! Bound to loopback only. `/health` and `/version` are open and
//! `DELETE /sessions` is authorized by the session it destroys. Everything
//! else requires the admin token.

use crate::auth::{IdentityGate, JwtSessions};
use crate::pool::ConnectionPool;
use crate::supervisor::{Supervisor, SupervisorError};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{AUTHORIZATION, SET_COOKIE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest JSON body accepted on the operator API
const MAX_BODY_LEN: usize = 64 * 1024;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("valid response with StatusCode enum and static header")
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    json_response(status, serde_json::json!({ "error": message.into() }))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    user: String,
    #[serde(default = "default_role")]
    role: String,
}

fn default_role() -> String {
    "user".to_string()
}

struct AdminContext {
    supervisor: Arc<Supervisor>,
    sessions: Arc<JwtSessions>,
    gate: Arc<IdentityGate>,
    pool: Arc<ConnectionPool>,
    auth_token: String,
}

pub struct AdminServer {
    bind_addr: SocketAddr,
    context: Arc<AdminContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        supervisor: Arc<Supervisor>,
        sessions: Arc<JwtSessions>,
        gate: Arc<IdentityGate>,
        pool: Arc<ConnectionPool>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            context: Arc::new(AdminContext {
                supervisor,
                sessions,
                gate,
                pool,
                auth_token,
            }),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Admin API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, context).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(stream: TcpStream, context: Arc<AdminContext>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let context = Arc::clone(&context);
        async move { handle_admin_request(req, context).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth(req: &Request<Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| constant_time_compare(token, expected_token))
        .unwrap_or(false)
}

/// Token comparison whose duration does not depend on where the inputs differ
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Lifecycle action in `POST /services/{name}/{action}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Start,
    Stop,
    Restart,
}

fn parse_action_path(path: &str) -> Option<(&str, Action)> {
    let rest = path.strip_prefix("/services/")?;
    let (name, action) = rest.split_once('/')?;
    if name.is_empty() {
        return None;
    }
    let action = match action {
        "start" => Action::Start,
        "stop" => Action::Stop,
        "restart" => Action::Restart,
        _ => return None,
    };
    Some((name, action))
}

async fn handle_admin_request(
    req: Request<Incoming>,
    context: Arc<AdminContext>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Admin API request");

    let public = matches!(
        (&method, path.as_str()),
        (&Method::GET, "/health") | (&Method::GET, "/version") | (&Method::DELETE, "/sessions")
    );
    if !public && !check_auth(&req, &context.auth_token) {
        warn!(%method, %path, "Unauthorized admin API request");
        return Ok(json_error(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => json_response(
            StatusCode::OK,
            serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            }),
        ),

        (&Method::GET, "/services") => {
            let services = context.supervisor.snapshots();
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "count": services.len(),
                    "services": services,
                    "gateway": context.pool.stats().snapshot(),
                }),
            )
        }

        (&Method::GET, p) if p.starts_with("/services/") => {
            let name = p.trim_start_matches("/services/");
            match context.supervisor.snapshot(name) {
                Some(snapshot) => json_response(StatusCode::OK, serde_json::json!(snapshot)),
                None => json_error(StatusCode::NOT_FOUND, format!("unknown service '{}'", name)),
            }
        }

        (&Method::POST, p) if p.starts_with("/services/") => match parse_action_path(p) {
            Some((name, action)) => run_action(&context.supervisor, name, action).await,
            None => json_error(StatusCode::NOT_FOUND, "not found"),
        },

        (&Method::POST, "/sessions") => login(req, &context).await,

        (&Method::DELETE, "/sessions") => logout(&req, &context),

        _ => json_error(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

async fn run_action(supervisor: &Arc<Supervisor>, name: &str, action: Action) -> Response<Full<Bytes>> {
    info!(service = name, ?action, "Operator action");

    let result = match action {
        Action::Start => supervisor.start(name).await,
        Action::Stop => supervisor.stop(name).await,
        Action::Restart => supervisor.restart(name).await,
    };

    match result {
        Ok(snapshot) => json_response(StatusCode::OK, serde_json::json!(snapshot)),
        Err(e @ SupervisorError::UnknownService(_)) => json_error(StatusCode::NOT_FOUND, e.to_string()),
        Err(e) => {
            error!(service = name, error = %e, "Operator action failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Issue a session for a user the portal has already authenticated
async fn login(req: Request<Incoming>, context: &AdminContext) -> Response<Full<Bytes>> {
    let body = match Limited::new(req.into_body(), MAX_BODY_LEN).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            return json_error(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        }
        Err(e) => {
            debug!(error = %e, "Failed to read login body");
            return json_error(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };

    let login: LoginRequest = match serde_json::from_slice(&body) {
        Ok(login) => login,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, format!("invalid login request: {}", e)),
    };
    if login.user.trim().is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "user must not be empty");
    }

    match context.sessions.issue(&login.user, &login.role) {
        Ok((token, session)) => {
            info!(user = %session.user, role = %session.role, "Session issued");
            let cookie = context.sessions.create_session_cookie(&token);
            let body = serde_json::json!({
                "token": token,
                "user": session.user,
                "role": session.role,
                "expires_at": session.expires_at,
            });
            let mut response = json_response(StatusCode::CREATED, body);
            if let Ok(value) = cookie.parse() {
                response.headers_mut().insert(SET_COOKIE, value);
            }
            response
        }
        Err(e) => {
            error!(error = %e, "Failed to issue session");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to issue session")
        }
    }
}

/// Destroy the caller's own session
fn logout(req: &Request<Incoming>, context: &AdminContext) -> Response<Full<Bytes>> {
    let session = match context.gate.authenticate(req.headers()) {
        Ok(session) => session,
        Err(e) => return json_error(StatusCode::UNAUTHORIZED, e.to_string()),
    };

    let revoked = context
        .gate
        .extract_token(req.headers())
        .map(|token| context.sessions.revoke(&token))
        .unwrap_or(false);
    if !revoked {
        return json_error(StatusCode::UNAUTHORIZED, "invalid session");
    }

    info!(user = %session.user, "Session revoked");
    let mut response = json_response(StatusCode::OK, serde_json::json!({ "revoked": true }));
    if let Ok(value) = context.sessions.create_logout_cookie().parse() {
        response.headers_mut().insert(SET_COOKIE, value);
    }
    response
}
