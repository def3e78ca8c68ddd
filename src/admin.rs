//! Control routes served by the front door under `/_switchboard`

use crate::context::ControlPlane;
use crate::error::{json_error_response, ControlError, GatewayErrorCode};
use crate::logs::Subscription;
use crate::service::ServiceId;
use futures::StreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Frame, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const CONTROL_PREFIX: &str = "/_switchboard";

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Frames buffered per SSE client before the pump waits
const SSE_CHANNEL_CAPACITY: usize = 64;

pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

fn full(body: impl Into<Bytes>) -> GatewayBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<GatewayBody> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(full(body))
            .expect("valid response with StatusCode enum and static header"),
        Err(e) => json_error_response(GatewayErrorCode::InternalError, e.to_string()),
    }
}

/// Whether `path` belongs to the control routes
pub fn is_control_path(path: &str) -> bool {
    path == CONTROL_PREFIX
        || path
            .strip_prefix(CONTROL_PREFIX)
            .map(|rest| rest.starts_with('/'))
            .unwrap_or(false)
}

fn is_loopback(addr: &SocketAddr) -> bool {
    addr.ip().to_canonical().is_loopback()
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    query
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = urlencoding::decode(key).ok()?.into_owned();
            let value = urlencoding::decode(&value.replace('+', " ")).ok()?.into_owned();
            Some((key, value))
        })
        .collect()
}

/// `services=a,b` into ids; missing or empty means every service
fn parse_services(query: &HashMap<String, String>) -> Result<Vec<ServiceId>, String> {
    let Some(list) = query.get("services") else {
        return Ok(Vec::new());
    };
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| name.parse::<ServiceId>().map_err(|e| e.to_string()))
        .collect()
}

pub async fn handle_control_request(
    req: Request<Incoming>,
    plane: Arc<ControlPlane>,
    client_addr: SocketAddr,
) -> Response<GatewayBody> {
    let method = req.method().clone();
    let path = req
        .uri()
        .path()
        .strip_prefix(CONTROL_PREFIX)
        .unwrap_or("")
        .to_string();
    let query = parse_query(req.uri().query());

    debug!(%method, path = %path, client = %client_addr, "Control request");

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match (&method, segments.as_slice()) {
        (&Method::GET, ["health"]) => {
            let report = plane.get_health().await;
            json_response(StatusCode::OK, &report)
        }

        (&Method::GET, ["version"]) => json_response(
            StatusCode::OK,
            &serde_json::json!({ "name": PKG_NAME, "version": VERSION }),
        ),

        (&Method::GET, ["logs"]) => {
            let services = match parse_services(&query) {
                Ok(services) => services,
                Err(e) => return json_error_response(GatewayErrorCode::BadRequest, e),
            };
            let requested = match query.get("limit").map(|l| l.parse::<usize>()) {
                Some(Ok(limit)) => Some(limit),
                Some(Err(_)) => {
                    return json_error_response(GatewayErrorCode::BadRequest, "limit must be a number")
                }
                None => None,
            };
            let limit = plane.config().logs.clamp_limit(requested);
            let entries = plane.logs().get_recent_logs(&services, limit).await;
            json_response(
                StatusCode::OK,
                &serde_json::json!({ "count": entries.len(), "limit": limit, "entries": entries }),
            )
        }

        (&Method::GET, ["logs", "stream"]) => match parse_services(&query) {
            Ok(services) => log_stream(&plane, services),
            Err(e) => json_error_response(GatewayErrorCode::BadRequest, e),
        },

        (_, ["services", ..]) if !is_loopback(&client_addr) => {
            warn!(client = %client_addr, path = %path, "Rejected non-loopback control request");
            json_error_response(
                GatewayErrorCode::Forbidden,
                "service control is only available from loopback",
            )
        }

        (&Method::GET, ["services"]) => {
            let supervisor = plane.supervisor();
            json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "services": supervisor.status(),
                    "allocations": plane.registry().allocations(),
                }),
            )
        }

        (&Method::GET, ["services", name, "status"]) => match resolve_service(&plane, name) {
            Ok(id) => match plane.supervisor().status_of(id) {
                Some(status) => json_response(StatusCode::OK, &status),
                None => json_error_response(GatewayErrorCode::UnknownService, "service not configured"),
            },
            Err(response) => response,
        },

        (&Method::POST, ["services", name, "restart"]) => match resolve_service(&plane, name) {
            Ok(id) => {
                info!(service = %id, client = %client_addr, "Restart requested via control route");
                match plane.supervisor().restart(id).await {
                    Ok(()) => json_response(StatusCode::OK, &plane.supervisor().status_of(id)),
                    Err(e) => {
                        warn!(service = %id, error = %e, "Restart via control route failed");
                        json_error_response(GatewayErrorCode::from_control_error(&e), e.to_string())
                    }
                }
            }
            Err(response) => response,
        },

        _ => json_error_response(GatewayErrorCode::NoRoute, "unknown control route"),
    }
}

fn resolve_service(plane: &ControlPlane, name: &str) -> Result<ServiceId, Response<GatewayBody>> {
    let id = name.parse::<ServiceId>().map_err(|e| {
        let err = ControlError::from(e);
        json_error_response(GatewayErrorCode::from_control_error(&err), err.to_string())
    })?;
    if plane.config().service(id).is_none() {
        return Err(json_error_response(
            GatewayErrorCode::UnknownService,
            format!("{} is not configured", id),
        ));
    }
    Ok(id)
}

/// Server-sent events body fed by a pump task
struct SseBody {
    rx: mpsc::Receiver<Bytes>,
}

impl Body for SseBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
        self.rx.poll_recv(cx).map(|chunk| chunk.map(|bytes| Ok(Frame::data(bytes))))
    }
}

fn sse_event(event: &str, data: &str) -> Bytes {
    Bytes::from(format!("event: {}\ndata: {}\n\n", event, data))
}

fn log_stream(plane: &Arc<ControlPlane>, services: Vec<ServiceId>) -> Response<GatewayBody> {
    // Same default as the one-shot query: every service
    let services = if services.is_empty() {
        ServiceId::ALL.to_vec()
    } else {
        services
    };
    let heartbeat = Duration::from_secs(plane.config().logs.heartbeat_secs.max(1));
    let subscriptions: Vec<Subscription> = services
        .iter()
        .map(|&id| plane.logs().subscribe(id))
        .collect();

    let (tx, rx) = mpsc::channel(SSE_CHANNEL_CAPACITY);
    let connected = serde_json::json!({ "services": services }).to_string();
    // Capacity is never zero, the first frame always fits
    let _ = tx.try_send(sse_event("connected", &connected));

    info!(services = ?services, "Log stream client connected");
    tokio::spawn(pump_events(tx, subscriptions, heartbeat));

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .body(SseBody { rx }.boxed())
        .expect("valid response with StatusCode enum and static headers")
}

async fn pump_events(tx: mpsc::Sender<Bytes>, subscriptions: Vec<Subscription>, heartbeat: Duration) {
    let mut events = futures::stream::select_all(
        subscriptions.into_iter().map(Subscription::into_stream),
    );
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await;
    // Without live sources the client still gets heartbeats until it leaves
    let mut sources_open = !events.is_empty();

    loop {
        let frame = tokio::select! {
            entry = events.next(), if sources_open => match entry {
                Some(entry) => match serde_json::to_string(&entry) {
                    Ok(json) => sse_event("log", &json),
                    Err(e) => {
                        warn!(error = %e, "Failed to encode log entry");
                        continue;
                    }
                },
                None => {
                    sources_open = false;
                    continue;
                }
            },
            _ = ticker.tick() => Bytes::from_static(b": heartbeat\n\n"),
            _ = tx.closed() => break,
        };
        if tx.send(frame).await.is_err() {
            break;
        }
    }
    // Dropping the streams drops the subscriptions
    debug!("Log stream client disconnected");
}
