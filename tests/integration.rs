//! Integration tests for Switchboard

use std::collections::HashSet;
use std::io::Write;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use switchboard::config::{Config, ProbeConfig, RouteConfig, ServiceConfig};
use switchboard::context::ControlPlane;
use switchboard::ports::PortRegistry;
use switchboard::process::ProcessState;
use switchboard::proxy::FrontDoor;
use switchboard::service::ServiceId;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Upstream that answers every request with the path it received
async fn spawn_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(serve_upstream(listener));
    port
}

async fn serve_upstream(listener: TcpListener) {
    while let Ok((mut stream, _)) = listener.accept().await {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap_or(0);
            let request = String::from_utf8_lossy(&buf[..n]);
            let target = request.split_whitespace().nth(1).unwrap_or("/").to_string();
            let body = format!("path={}", target);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
        });
    }
}

/// Send a raw HTTP/1.1 request and read the whole response
async fn http_request(port: u16, method: &str, path: &str) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        method, path, port
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(20), stream.read_to_string(&mut response)).await??;
    Ok(response)
}

async fn http_get(port: u16, path: &str) -> Result<String, Box<dyn std::error::Error>> {
    http_request(port, "GET", path).await
}

fn status_of(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or("")
}

fn json_body(response: &str) -> serde_json::Value {
    serde_json::from_str(body_of(response)).unwrap()
}

fn external_service(port: u16) -> ServiceConfig {
    let mut service = ServiceConfig::default().with_probe(ProbeConfig::Http {
        path: Some("/health".to_string()),
    });
    service.port = Some(port);
    service.startup_timeout_secs = Some(5);
    service.health_check_interval_ms = Some(25);
    service.monitor_interval_ms = Some(60_000);
    service
}

fn route(prefix: &str, service: &str, strip_prefix: bool) -> RouteConfig {
    RouteConfig {
        prefix: prefix.to_string(),
        service: service.to_string(),
        strip_prefix,
    }
}

fn base_config(log_dir: &Path) -> Config {
    let mut config = Config::default();
    config.server.log_dir = log_dir.to_string_lossy().into_owned();
    config.server.request_timeout_secs = 5;
    config
}

/// Serve the front door on an ephemeral loopback port
async fn start_front_door(plane: Arc<ControlPlane>) -> (u16, watch::Sender<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let front_door = FrontDoor::new(addr, plane, shutdown_rx).unwrap();
    tokio::spawn(async move {
        let _ = front_door.serve(listener).await;
    });
    (addr.port(), shutdown_tx)
}

fn append_line(path: &Path, line: &str) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    writeln!(file, "{}", line).unwrap();
}

// ============================================================================
// Front door routing
// ============================================================================

#[tokio::test]
async fn test_routes_by_prefix_and_strips() {
    let dir = tempfile::tempdir().unwrap();
    let api_port = spawn_upstream().await;
    let ui_port = spawn_upstream().await;

    let mut config = base_config(dir.path());
    config.server.external = true;
    config.services.insert("api".into(), external_service(api_port).critical());
    config.services.insert("devui".into(), external_service(ui_port));
    config.routes = vec![route("/", "devui", false), route("/api", "api", true)];

    let plane = ControlPlane::new(config).unwrap();
    let report = plane.boot().await.unwrap();
    assert_eq!(report.started, vec![ServiceId::Api, ServiceId::DevUi]);

    let (port, _shutdown) = start_front_door(Arc::clone(&plane)).await;

    let response = http_get(port, "/api/users?page=2").await.unwrap();
    assert_eq!(status_of(&response), 200);
    assert_eq!(body_of(&response), "path=/users?page=2");
    assert!(response.to_lowercase().contains("x-request-id:"));

    let response = http_get(port, "/app/index.html").await.unwrap();
    assert_eq!(body_of(&response), "path=/app/index.html");

    let response = http_get(port, "/_switchboard/health").await.unwrap();
    assert_eq!(json_body(&response)["services"]["gateway"]["requests_forwarded"], 2);
}

#[tokio::test]
async fn test_unrouted_path_is_json_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.services.insert("api".into(), ServiceConfig::command("sleep", &["60"]));
    config.routes = vec![route("/api", "api", false)];

    let plane = ControlPlane::new(config).unwrap();
    let (port, _shutdown) = start_front_door(plane).await;

    let response = http_get(port, "/elsewhere").await.unwrap();
    assert_eq!(status_of(&response), 404);
    assert!(response.to_lowercase().contains("x-gateway-error: no_route"));
    assert_eq!(json_body(&response)["code"], "NO_ROUTE");
}

#[tokio::test]
async fn test_lazy_service_starts_on_first_request() {
    let dir = tempfile::tempdir().unwrap();
    let ui_port = spawn_upstream().await;

    let mut config = base_config(dir.path());
    config.server.external = true;
    config.services.insert("devui".into(), external_service(ui_port).lazy());
    config.routes = vec![route("/", "devui", false)];

    let plane = ControlPlane::new(config).unwrap();
    let report = plane.boot().await.unwrap();
    assert_eq!(report.deferred, vec![ServiceId::DevUi]);
    assert_eq!(plane.supervisor().state(ServiceId::DevUi), ProcessState::Stopped);

    let (port, _shutdown) = start_front_door(Arc::clone(&plane)).await;
    let response = http_get(port, "/").await.unwrap();
    assert_eq!(status_of(&response), 200);
    assert_eq!(plane.supervisor().state(ServiceId::DevUi), ProcessState::Healthy);
}

#[tokio::test]
async fn test_unavailable_service_maps_to_gateway_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    let mut api = ServiceConfig::command("sleep", &["60"]);
    api.requires_database = true;
    config.services.insert("api".into(), api);
    config.routes = vec![route("/api", "api", false)];

    let plane = ControlPlane::new(config).unwrap();
    let (port, _shutdown) = start_front_door(plane).await;

    let response = http_get(port, "/api/x").await.unwrap();
    assert_eq!(status_of(&response), 503);
    assert!(response.to_lowercase().contains("x-gateway-error: service_start_failed"));
}

// ============================================================================
// Control routes
// ============================================================================

#[tokio::test]
async fn test_health_and_version_routes() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config
        .services
        .insert("api".into(), ServiceConfig::command("sleep", &["60"]).critical());

    let plane = ControlPlane::new(config).unwrap();
    let (port, _shutdown) = start_front_door(plane).await;

    let response = http_get(port, "/_switchboard/health").await.unwrap();
    assert_eq!(status_of(&response), 200);
    let health = json_body(&response);
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["services"]["gateway"]["status"], "up");
    assert_eq!(health["services"]["api"]["status"], "down");

    let response = http_get(port, "/_switchboard/version").await.unwrap();
    assert_eq!(json_body(&response)["name"], "switchboard");
}

#[tokio::test]
async fn test_logs_route_filters_and_clamps() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.logs.max_limit = 3;
    let plane = ControlPlane::new(config).unwrap();

    for i in 0..5 {
        append_line(&dir.path().join("api.log"), &format!("2024-01-01T00:00:0{}Z INFO api {}", i, i));
        append_line(&dir.path().join("bridge.log"), &format!("2024-01-01T00:00:0{}Z bridge {}", i, i));
    }

    let (port, _shutdown) = start_front_door(plane).await;

    let response = http_get(port, "/_switchboard/logs?services=api&limit=2").await.unwrap();
    assert_eq!(status_of(&response), 200);
    let body = json_body(&response);
    assert_eq!(body["count"], 2);
    let entries = body["entries"].as_array().unwrap();
    assert!(entries.iter().all(|e| e["service"] == "api"));
    assert_eq!(entries[1]["message"], "INFO api 4");
    assert_eq!(entries[1]["level"], "info");

    let response = http_get(port, "/_switchboard/logs?limit=50").await.unwrap();
    assert_eq!(json_body(&response)["count"], 3);

    let response = http_get(port, "/_switchboard/logs?limit=many").await.unwrap();
    assert_eq!(status_of(&response), 400);

    let response = http_get(port, "/_switchboard/logs?services=mailer").await.unwrap();
    assert_eq!(status_of(&response), 400);
}

#[tokio::test]
async fn test_service_routes_from_loopback() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.services.insert("api".into(), ServiceConfig::command("sleep", &["60"]));
    let plane = ControlPlane::new(config).unwrap();
    let (port, _shutdown) = start_front_door(plane).await;

    let response = http_get(port, "/_switchboard/services").await.unwrap();
    assert_eq!(status_of(&response), 200);
    let body = json_body(&response);
    assert_eq!(body["services"]["api"]["state"], "stopped");
    assert!(body["allocations"].as_array().unwrap().is_empty());

    let response = http_get(port, "/_switchboard/services/api/status").await.unwrap();
    assert_eq!(json_body(&response)["restart_count"], 0);

    let response = http_request(port, "POST", "/_switchboard/services/mailer/restart").await.unwrap();
    assert_eq!(status_of(&response), 404);
    assert!(response.to_lowercase().contains("x-gateway-error: unknown_service"));

    let response = http_get(port, "/_switchboard/services/bridge/status").await.unwrap();
    assert_eq!(status_of(&response), 404);
}

#[tokio::test]
async fn test_restart_route_restarts_external_service() {
    let dir = tempfile::tempdir().unwrap();
    let api_port = spawn_upstream().await;
    let mut config = base_config(dir.path());
    config.server.external = true;
    config.services.insert("api".into(), external_service(api_port));
    let plane = ControlPlane::new(config).unwrap();
    plane.boot().await.unwrap();

    let (port, _shutdown) = start_front_door(Arc::clone(&plane)).await;
    let response = http_request(port, "POST", "/_switchboard/services/api/restart").await.unwrap();
    assert_eq!(status_of(&response), 200);
    assert_eq!(json_body(&response)["state"], "healthy");
}

#[tokio::test]
async fn test_log_stream_delivers_entries_and_releases_tail() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.logs.poll_interval_ms = 20;
    config.logs.heartbeat_secs = 1;
    let plane = ControlPlane::new(config).unwrap();
    let (port, _shutdown) = start_front_door(Arc::clone(&plane)).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = format!(
        "GET /_switchboard/logs/stream?services=api HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        port
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut received = String::new();
    let mut buf = vec![0u8; 4096];
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut appended = false;
    while !received.contains("event: log") {
        assert!(Instant::now() < deadline, "no log event received: {}", received);
        if !appended && received.contains("event: connected") {
            assert!(received.to_lowercase().contains("content-type: text/event-stream"));
            assert!(plane.logs().is_tailing(ServiceId::Api));
            append_line(&dir.path().join("api.log"), "WARN queue is filling up");
            appended = true;
        }
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "stream closed early");
        received.push_str(&String::from_utf8_lossy(&buf[..n]));
    }
    assert!(received.contains("queue is filling up"));

    drop(stream);
    let deadline = Instant::now() + Duration::from_secs(10);
    while plane.logs().subscriber_count(ServiceId::Api) > 0 {
        assert!(Instant::now() < deadline, "subscription never released");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!plane.logs().is_tailing(ServiceId::Api));
}

#[tokio::test]
async fn test_unfiltered_log_stream_stays_open_without_services() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.logs.heartbeat_secs = 1;
    let plane = ControlPlane::new(config).unwrap();
    let (port, _shutdown) = start_front_door(Arc::clone(&plane)).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = format!(
        "GET /_switchboard/logs/stream HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        port
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut received = String::new();
    let mut buf = vec![0u8; 4096];
    let deadline = Instant::now() + Duration::from_secs(10);
    while received.matches(": heartbeat").count() < 2 {
        assert!(Instant::now() < deadline, "no heartbeats received: {}", received);
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "stream closed early: {}", received);
        received.push_str(&String::from_utf8_lossy(&buf[..n]));
    }
    assert!(received.contains("event: connected"));
    assert!(received.contains("\"devui\""));
    for service in ServiceId::ALL {
        assert_eq!(plane.logs().subscriber_count(service), 1);
    }
}

// ============================================================================
// Ports and supervision
// ============================================================================

#[test]
fn test_concurrent_allocation_yields_distinct_ports() {
    let registry = Arc::new(PortRegistry::with_default_ranges());

    let handles: Vec<_> = ServiceId::ALL
        .into_iter()
        .map(|service| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.allocate(service).map(|a| (service, a.port)))
        })
        .collect();

    let mut ports = HashSet::new();
    for handle in handles {
        let (service, port) = handle.join().unwrap().unwrap();
        let (start, end) = registry.range(service);
        assert!(port >= start && port <= end);
        assert!(ports.insert(port), "port {} handed out twice", port);
    }
    assert_eq!(registry.allocations().len(), ServiceId::ALL.len());

    for service in ServiceId::ALL {
        registry.release(service);
    }
    assert!(registry.allocations().is_empty());
}

/// A one-port range that is currently free
fn single_free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_spawned_service_receives_handed_off_port() {
    let dir = tempfile::tempdir().unwrap();
    let port = single_free_port();

    let mut service = ServiceConfig::command("sleep", &["60"])
        .with_probe(ProbeConfig::Http { path: Some("/health".into()) })
        .with_port_range(port, port);
    service.startup_timeout_secs = Some(10);
    service.health_check_interval_ms = Some(25);
    service.shutdown_grace_period_secs = Some(2);

    let mut config = base_config(dir.path());
    config.services.insert("bridge".into(), service);
    let plane = ControlPlane::new(config).unwrap();

    // Stands in for the child: binds once the reservation has been handed off
    let registry = Arc::clone(plane.registry());
    tokio::spawn(async move {
        loop {
            let handed_off = registry
                .get(ServiceId::Bridge)
                .map(|a| !a.reserved)
                .unwrap_or(false);
            if handed_off {
                if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await {
                    serve_upstream(listener).await;
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    plane.supervisor().start(ServiceId::Bridge).await.unwrap();
    let status = plane.supervisor().status_of(ServiceId::Bridge).unwrap();
    assert_eq!(status.state, ProcessState::Healthy);
    assert_eq!(status.port, Some(port));
    assert!(status.pid.is_some());

    let allocation = plane.registry().get(ServiceId::Bridge).unwrap();
    assert!(!allocation.reserved);

    assert!(plane.supervisor().stop(ServiceId::Bridge).await);
    assert!(plane.registry().get(ServiceId::Bridge).is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn test_boot_and_shutdown_in_order() {
    use tokio::net::UnixListener;

    let dir = tempfile::tempdir().unwrap();
    let sockets = tempfile::tempdir().unwrap();
    let listener = UnixListener::bind(sockets.path().join("bot-1.sock")).unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 512];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        }
    });

    let socket_service = || {
        let mut service = ServiceConfig::command("sleep", &["60"]).with_probe(
            ProbeConfig::SocketFanout {
                dir: sockets.path().to_string_lossy().into_owned(),
                path: None,
            },
        );
        service.needs_port = false;
        service.health_check_interval_ms = Some(25);
        service.shutdown_grace_period_secs = Some(2);
        service
    };

    let mut config = base_config(dir.path());
    config.services.insert("sessions".into(), socket_service());
    config.services.insert("bridge".into(), socket_service().critical());

    let plane = ControlPlane::new(config).unwrap();
    let report = plane.boot().await.unwrap();
    assert_eq!(report.started, vec![ServiceId::Bridge, ServiceId::Sessions]);

    let pids: Vec<u32> = [ServiceId::Bridge, ServiceId::Sessions]
        .iter()
        .map(|id| plane.supervisor().status_of(*id).unwrap().pid.unwrap())
        .collect();

    plane.shutdown().await;
    for id in [ServiceId::Bridge, ServiceId::Sessions] {
        assert_eq!(plane.supervisor().state(id), ProcessState::Stopped);
    }
    for pid in pids {
        // Signal 0 only checks existence; the child has been reaped
        let alive = unsafe { libc::kill(pid as i32, 0) } == 0;
        assert!(!alive, "pid {} still running", pid);
    }

    // Refuses to start anything afterwards
    assert!(plane.supervisor().start(ServiceId::Bridge).await.is_err());
}
