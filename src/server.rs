//! Gateway process: two concurrent listeners over one router
//!
//! The gateway binds a plaintext listener and, when the TLS material loads, a
//! TLS listener, both dispatching through the same [`HostRouter`]. Once every
//! enabled listener is bound it prints a single readiness line containing
//! [`READY_MARKER`] to stdout; the supervisor scrapes for that substring.
//! Process-level failures go to stderr as plain lines.

use crate::config::GatewayConfig;
use crate::error::BoxedBody;
use crate::router::HostRouter;
use crate::tls;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Fixed substring the supervisor scans stdout for. This is the cross-process
/// readiness contract; keep it stable.
pub const READY_MARKER: &str = "server ready";

/// Gateway server configuration plus shutdown wiring, prior to binding.
pub struct GatewayServer {
    config: GatewayConfig,
    router: Arc<HostRouter>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, shutdown_rx: watch::Receiver<bool>) -> Self {
        let router = Arc::new(HostRouter::new(config.virtual_hosts()));
        Self {
            config,
            router,
            shutdown_rx,
        }
    }

    /// Replace the router built from the config (used by tests to point
    /// origins at local mock servers).
    pub fn with_router(mut self, router: HostRouter) -> Self {
        self.router = Arc::new(router);
        self
    }

    /// Load TLS material and bind the listeners.
    ///
    /// A missing or corrupt certificate set disables the TLS listener only;
    /// the failure is reported on stderr and the gateway continues in
    /// HTTP-only mode. A failure to bind the plaintext listener is fatal.
    pub async fn bind(self) -> anyhow::Result<BoundGateway> {
        let tls_acceptor = match tls::load_acceptor(&self.config.tls_paths()) {
            Ok(acceptor) => Some(acceptor),
            Err(e) => {
                eprintln!("[gateway] HTTPS disabled: {}", e);
                error!(error = %e, "TLS material failed to load, continuing HTTP-only");
                None
            }
        };

        let http_addr: SocketAddr = format!("{}:{}", self.config.bind, self.config.http_port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP bind address: {}", e))?;
        let http = TcpListener::bind(http_addr).await.map_err(|e| {
            anyhow::anyhow!("Failed to bind HTTP listener on {}: {}", http_addr, e)
        })?;
        let http_addr = http.local_addr()?;
        info!(addr = %http_addr, "HTTP listener bound");

        let https = if let Some(acceptor) = tls_acceptor {
            let https_addr: SocketAddr =
                format!("{}:{}", self.config.bind, self.config.https_port)
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid HTTPS bind address: {}", e))?;
            match TcpListener::bind(https_addr).await {
                Ok(listener) => {
                    let addr = listener.local_addr()?;
                    info!(addr = %addr, "HTTPS listener bound");
                    Some((listener, acceptor))
                }
                Err(e) => {
                    eprintln!("[gateway] HTTPS disabled: bind {} failed: {}", https_addr, e);
                    error!(addr = %https_addr, error = %e, "HTTPS bind failed, continuing HTTP-only");
                    None
                }
            }
        } else {
            None
        };

        Ok(BoundGateway {
            router: self.router,
            shutdown_rx: self.shutdown_rx,
            http_addr,
            https_addr: https.as_ref().map(|(l, _)| l.local_addr()).transpose()?,
            http,
            https,
        })
    }
}

/// A gateway with its listeners bound but not yet serving.
pub struct BoundGateway {
    router: Arc<HostRouter>,
    shutdown_rx: watch::Receiver<bool>,
    http: TcpListener,
    https: Option<(TcpListener, TlsAcceptor)>,
    http_addr: SocketAddr,
    https_addr: Option<SocketAddr>,
}

impl BoundGateway {
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// `None` when running degraded HTTP-only.
    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https_addr
    }

    /// Serve both listeners until the shutdown channel fires. The readiness
    /// marker is printed exactly once, before the first accept.
    pub async fn serve(self) -> anyhow::Result<()> {
        match self.https_addr {
            Some(https_addr) => {
                println!(
                    "[gateway] {}: http={} https={}",
                    READY_MARKER, self.http_addr, https_addr
                );
            }
            None => {
                println!(
                    "[gateway] {} (http only): http={}",
                    READY_MARKER, self.http_addr
                );
            }
        }

        let http_loop = accept_loop(
            self.http,
            Arc::clone(&self.router),
            None,
            self.shutdown_rx.clone(),
        );

        // The two listeners run concurrently and fail independently
        match self.https {
            Some((listener, acceptor)) => {
                let https_loop = accept_loop(
                    listener,
                    Arc::clone(&self.router),
                    Some(acceptor),
                    self.shutdown_rx.clone(),
                );
                let (http_result, https_result) = tokio::join!(http_loop, https_loop);
                http_result?;
                https_result?;
            }
            None => http_loop.await?,
        }

        Ok(())
    }
}

/// Accept connections until shutdown. A handshake or connection error is
/// logged and dropped; it never stops the loop.
async fn accept_loop(
    listener: TcpListener,
    router: Arc<HostRouter>,
    tls_acceptor: Option<TlsAcceptor>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let protocol = if tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
    info!(addr = %listener.local_addr()?, protocol, "Gateway listener serving");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let router = Arc::clone(&router);
                        let tls_acceptor = tls_acceptor.clone();

                        tokio::spawn(async move {
                            if let Some(acceptor) = tls_acceptor {
                                match acceptor.accept(stream).await {
                                    Ok(tls_stream) => {
                                        if let Err(e) = serve_connection(tls_stream, router).await {
                                            debug!(addr = %addr, error = %e, "TLS connection error");
                                        }
                                    }
                                    Err(e) => {
                                        debug!(addr = %addr, error = %e, "TLS handshake failed");
                                    }
                                }
                            } else if let Err(e) = serve_connection(stream, router).await {
                                debug!(addr = %addr, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => {
                        // Listener-level failures belong on the supervisor's
                        // error stream, like the TLS-disabled lines
                        eprintln!("[gateway] {} accept error: {}", protocol, e);
                        error!(protocol, error = %e, "Failed to accept connection");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!(protocol, "Gateway listener shutting down");
                    break;
                }
            }
        }
    }

    Ok(())
}

async fn serve_connection<S>(stream: S, router: Arc<HostRouter>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { Ok::<Response<BoxedBody>, Infallible>(router.handle(req).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
