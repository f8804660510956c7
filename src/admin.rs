use crate::context::AppContext;
use crate::error::{ErrorResponse, ProxyErrorCode};
use crate::health::{RecoveryError, RecoveryTrigger};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Operator API: status, forced discovery and manual recovery
pub struct AdminServer {
    bind_addr: SocketAddr,
    ctx: Arc<AppContext>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        ctx: Arc<AppContext>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            ctx,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&self.ctx);
                            let auth_token = Arc::clone(&self.auth_token);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, ctx, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(
    stream: TcpStream,
    ctx: Arc<AppContext>,
    auth_token: Arc<String>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let ctx = Arc::clone(&ctx);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, ctx, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

pub async fn handle_admin_request<B>(
    req: Request<B>,
    ctx: Arc<AppContext>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    let path = path.as_str();

    debug!(%method, %path, "Admin API request");

    let public = matches!(
        (&method, path),
        (&Method::GET, "/health") | (&Method::GET, "/version")
    );
    if !public && !check_auth(&req, &auth_token) {
        warn!(path, "Unauthorized admin API request");
        return Ok(response(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let response = match (&method, path) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::GET, "/status") => {
            let stats = ctx.pool.stats();
            let body = serde_json::json!({
                "endpoint": ctx.discovery.get(),
                "routes": ctx.routes.list(),
                "health": ctx.supervisor.state(),
                "recovering": ctx.supervisor.is_recovering(),
                "recoveries": ctx.supervisor.recoveries(),
                "observers": ctx.hub.observer_count(),
                "pool": {
                    "requests": stats.get_total_requests(),
                    "fetches": stats.get_fetches(),
                    "max_idle_per_host": ctx.pool.config().max_idle_per_host,
                },
            });
            json_response(StatusCode::OK, body.to_string())
        }

        (&Method::POST, "/refresh") => match ctx.discovery.refresh(true).await {
            Ok(endpoint) => {
                info!(rpc_port = ?endpoint.rpc_port, ui_port = endpoint.ui_port, "Discovery refreshed via admin API");
                json_response(
                    StatusCode::OK,
                    serde_json::json!({ "endpoint": endpoint }).to_string(),
                )
            }
            Err(e) => json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({ "error": e.to_string() }).to_string(),
            ),
        },

        (&Method::POST, "/recover") => {
            if ctx.supervisor.is_recovering() {
                let code = ProxyErrorCode::RecoveryInProgress;
                json_response(
                    code.status_code(),
                    ErrorResponse::new(code, RecoveryError::InProgress.to_string()).to_json(),
                )
            } else {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    let ports = ctx.discovery.listening_ports().await.unwrap_or_else(|e| {
                        warn!(error = %e, "Could not read listening ports before recovery");
                        BTreeSet::new()
                    });
                    match ctx.supervisor.recover(RecoveryTrigger::Manual, ports).await {
                        Ok(report) => info!(restarted = report.restarted, "Manual recovery finished"),
                        Err(e) => warn!(error = %e, "Manual recovery not started"),
                    }
                });
                json_response(
                    StatusCode::ACCEPTED,
                    serde_json::json!({ "started": true }).to_string(),
                )
            }
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}
