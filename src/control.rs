//! Local control API for the host shell
//!
//! A small loopback HTTP server through which the host UI drives the
//! supervisor: health and version probes, a gateway status read, and a toggle
//! to start or stop the gateway. Gateway endpoints require the bearer token;
//! health and version do not.

use crate::supervisor::Supervisor;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Generate a fresh control token when none is configured.
pub fn generate_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

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

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    enable: bool,
}

/// Control API server driving a [`Supervisor`].
pub struct ControlServer {
    bind_addr: SocketAddr,
    supervisor: Supervisor,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl ControlServer {
    pub fn new(
        bind_addr: SocketAddr,
        supervisor: Supervisor,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            supervisor,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %listener.local_addr()?, "Control API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let supervisor = self.supervisor.clone();
                            let auth_token = Arc::clone(&self.auth_token);

                            tokio::spawn(async move {
                                if let Err(e) = serve_control_connection(stream, supervisor, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Control connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Control server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_control_connection<S>(
    stream: S,
    supervisor: Supervisor,
    auth_token: Arc<String>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let supervisor = supervisor.clone();
        let token = Arc::clone(&auth_token);
        async move { handle_control_request(req, supervisor, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Control connection error: {}", e))?;

    Ok(())
}

fn check_auth(req: &Request<hyper::body::Incoming>, expected_token: &str) -> bool {
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

async fn handle_control_request(
    req: Request<hyper::body::Incoming>,
    supervisor: Supervisor,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Control API request");

    let response = match (&method, path.as_str()) {
        // Liveness of the control API itself (no auth required)
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::GET, "/gateway/status") => {
            if !check_auth(&req, &auth_token) {
                warn!(%path, "Unauthorized control API request");
                response(StatusCode::UNAUTHORIZED, "unauthorized")
            } else {
                let body = serde_json::json!({
                    "status": supervisor.status(),
                    "pid": supervisor.pid(),
                });
                json_response(StatusCode::OK, body.to_string())
            }
        }

        (&Method::POST, "/gateway/toggle") => {
            if !check_auth(&req, &auth_token) {
                warn!(%path, "Unauthorized control API request");
                response(StatusCode::UNAUTHORIZED, "unauthorized")
            } else {
                let body = req.into_body().collect().await?.to_bytes();
                match serde_json::from_slice::<ToggleRequest>(&body) {
                    Ok(toggle) => {
                        info!(enable = toggle.enable, "Gateway toggle requested");
                        let success = supervisor.toggle(toggle.enable).await;
                        let body = serde_json::json!({
                            "success": success,
                            "status": supervisor.status(),
                        });
                        json_response(StatusCode::OK, body.to_string())
                    }
                    Err(e) => {
                        debug!(error = %e, "Malformed toggle request body");
                        response(StatusCode::BAD_REQUEST, "expected {\"enable\": bool}")
                    }
                }
            }
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}
