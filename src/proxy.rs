//! The front door: one public listener routing requests to services by path prefix

use crate::admin::{handle_control_request, is_control_path, GatewayBody};
use crate::config::RouteConfig;
use crate::context::ControlPlane;
use crate::error::{json_error_response, GatewayErrorCode};
use crate::service::ServiceId;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub prefix: String,
    pub service: ServiceId,
    pub strip_prefix: bool,
}

impl Route {
    /// Prefix match on a path-segment boundary
    fn matches(&self, path: &str) -> bool {
        let prefix = self.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return true;
        }
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Path and query to send upstream
    fn upstream_target(&self, path: &str, query: Option<&str>) -> String {
        let path = if self.strip_prefix {
            let rest = path
                .strip_prefix(self.prefix.trim_end_matches('/'))
                .unwrap_or(path);
            if rest.starts_with('/') {
                rest.to_string()
            } else {
                format!("/{}", rest)
            }
        } else {
            path.to_string()
        };
        match query {
            Some(query) => format!("{}?{}", path, query),
            None => path,
        }
    }
}

/// Routes ordered longest prefix first
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn from_config(routes: &[RouteConfig]) -> anyhow::Result<Self> {
        let mut table = routes
            .iter()
            .map(|r| {
                Ok(Route {
                    prefix: r.prefix.clone(),
                    service: r.service.parse()?,
                    strip_prefix: r.strip_prefix,
                })
            })
            .collect::<anyhow::Result<Vec<Route>>>()?;
        table.sort_by(|a, b| {
            b.prefix
                .trim_end_matches('/')
                .len()
                .cmp(&a.prefix.trim_end_matches('/').len())
        });
        Ok(Self { routes: table })
    }

    pub fn resolve(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.matches(path))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

pub struct FrontDoor {
    bind_addr: SocketAddr,
    plane: Arc<ControlPlane>,
    routes: Arc<RouteTable>,
    shutdown_rx: watch::Receiver<bool>,
}

impl FrontDoor {
    pub fn new(
        bind_addr: SocketAddr,
        plane: Arc<ControlPlane>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let routes = Arc::new(RouteTable::from_config(&plane.config().routes)?);
        Ok(Self {
            bind_addr,
            plane,
            routes,
            shutdown_rx,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, routes = self.routes.len(), "Front door listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let plane = Arc::clone(&self.plane);
                            let routes = Arc::clone(&self.routes);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, plane, routes).await {
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
                        info!("Front door shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    plane: Arc<ControlPlane>,
    routes: Arc<RouteTable>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let plane = Arc::clone(&plane);
        let routes = Arc::clone(&routes);
        async move { handle_request(req, plane, routes, addr).await }
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

async fn handle_request(
    mut req: Request<Incoming>,
    plane: Arc<ControlPlane>,
    routes: Arc<RouteTable>,
    client_addr: SocketAddr,
) -> Result<Response<GatewayBody>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut response = if is_control_path(req.uri().path()) {
        handle_control_request(req, plane, client_addr).await
    } else {
        // Overwritten, never appended: the front door is the first hop
        let headers = req.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

        forward(req, &plane, &routes, &request_id).await
    };

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    Ok(response)
}

async fn forward(
    req: Request<Incoming>,
    plane: &ControlPlane,
    routes: &RouteTable,
    request_id: &str,
) -> Response<GatewayBody> {
    let path = req.uri().path().to_string();
    let Some(route) = routes.resolve(&path) else {
        debug!(path = %path, request_id, "No route for request");
        return json_error_response(GatewayErrorCode::NoRoute, "no service handles this path");
    };
    let service = route.service;
    let target = route.upstream_target(&path, req.uri().query());

    debug!(service = %service, method = %req.method(), path = %path, target = %target, request_id, "Routing request");

    let supervisor = plane.supervisor();
    if let Err(e) = supervisor.ensure_running(service).await {
        // Detail stays in the log
        error!(service = %service, error = %e, request_id, "Service unavailable for request");
        return json_error_response(
            GatewayErrorCode::from_control_error(&e),
            format!("{} is unavailable", service),
        );
    }

    let Some(port) = supervisor.port(service) else {
        warn!(service = %service, request_id, "Service has no port to forward to");
        return json_error_response(
            GatewayErrorCode::ServiceStartFailed,
            format!("{} does not accept HTTP requests", service),
        );
    };

    let timeout = plane.config().server.request_timeout();
    match tokio::time::timeout(timeout, plane.pool().forward(req, port, &target)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!(service = %service, port, error = %e, request_id, "Failed to forward request");
            json_error_response(
                GatewayErrorCode::ConnectionFailed,
                format!("failed to reach {}", service),
            )
        }
        Err(_) => {
            warn!(
                service = %service,
                port,
                timeout_secs = timeout.as_secs(),
                request_id,
                "Request timed out"
            );
            json_error_response(
                GatewayErrorCode::RequestTimeout,
                format!("request timed out after {} seconds", timeout.as_secs()),
            )
        }
    }
}
