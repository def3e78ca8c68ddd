//! Liveness probes shared by the supervisor and the health aggregator

use crate::config::{ProbeConfig, ServiceConfig, ServiceDefaults};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// Why a probe did not succeed
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("connection failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("timed out")]
    Timeout,
    #[error("server error status {0}")]
    ServerError(u16),
    #[error("malformed response")]
    Malformed,
    #[error("no port assigned")]
    NoPort,
    #[error("no session sockets in {0}")]
    NoSockets(PathBuf),
    #[error("none of {0} session sockets responded")]
    NoneResponsive(usize),
    #[error("socket probes are not supported on this platform")]
    Unsupported,
}

/// Result of a successful probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// HTTP status returned by the service
    Http(u16),
    /// TCP connect succeeded
    Connected,
    /// `responsive` out of `total` session sockets answered
    Sockets { responsive: usize, total: usize },
}

/// How a service is probed
#[derive(Debug, Clone, PartialEq)]
pub enum HealthProbe {
    Http { path: String },
    Tcp,
    SocketFanout { dir: PathBuf, path: String },
}

impl HealthProbe {
    pub fn from_config(config: &ServiceConfig, defaults: &ServiceDefaults) -> Self {
        let path = config.health_path(defaults).to_string();
        match &config.probe {
            ProbeConfig::Http { .. } => HealthProbe::Http { path },
            ProbeConfig::Tcp => HealthProbe::Tcp,
            ProbeConfig::SocketFanout { dir, .. } => HealthProbe::SocketFanout {
                dir: PathBuf::from(dir),
                path,
            },
        }
    }

    /// Run the probe once, bounded by `timeout`
    pub async fn check(&self, port: Option<u16>, timeout: Duration) -> Result<ProbeOutcome, ProbeError> {
        match self {
            HealthProbe::Http { path } => {
                let port = port.ok_or(ProbeError::NoPort)?;
                probe_http(port, path, timeout).await.map(ProbeOutcome::Http)
            }
            HealthProbe::Tcp => {
                let port = port.ok_or(ProbeError::NoPort)?;
                probe_tcp(port, timeout).await.map(|_| ProbeOutcome::Connected)
            }
            HealthProbe::SocketFanout { dir, path } => probe_socket_dir(dir, path, timeout).await,
        }
    }
}

/// GET `path` on a loopback port; any non-5xx status counts as alive
pub async fn probe_http(port: u16, path: &str, timeout: Duration) -> Result<u16, ProbeError> {
    let host = format!("127.0.0.1:{}", port);
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(&host)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return Err(ProbeError::Connect(e)),
        Err(_) => return Err(ProbeError::Timeout),
    };
    let status = request_status(stream, &host, path, timeout).await?;
    if status >= 500 {
        return Err(ProbeError::ServerError(status));
    }
    Ok(status)
}

pub async fn probe_tcp(port: u16, timeout: Duration) -> Result<(), ProbeError> {
    match tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port))).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(ProbeError::Connect(e)),
        Err(_) => Err(ProbeError::Timeout),
    }
}

/// Send a minimal HTTP/1.1 GET and parse the status line
async fn request_status<S>(mut stream: S, host: &str, path: &str, timeout: Duration) -> Result<u16, ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );

    let read = tokio::time::timeout(timeout, async {
        stream.write_all(request.as_bytes()).await?;
        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await?;
        Ok::<_, std::io::Error>(status_line)
    })
    .await;

    match read {
        // Format: "HTTP/1.1 200 OK\r\n"
        Ok(Ok(status_line)) => status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or(ProbeError::Malformed),
        Ok(Err(e)) => Err(ProbeError::Connect(e)),
        Err(_) => Err(ProbeError::Timeout),
    }
}

/// Session sockets currently present in `dir`
pub fn discover_sockets(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut sockets: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|ext| ext == "sock").unwrap_or(false))
        .collect();
    sockets.sort();
    sockets
}

/// Probe every session socket concurrently; one responsive socket is enough
#[cfg(unix)]
pub async fn probe_socket_dir(dir: &Path, path: &str, timeout: Duration) -> Result<ProbeOutcome, ProbeError> {
    use tokio::net::UnixStream;

    let sockets = discover_sockets(dir);
    if sockets.is_empty() {
        return Err(ProbeError::NoSockets(dir.to_path_buf()));
    }

    let probes = sockets.iter().map(|socket| async move {
        let stream = match tokio::time::timeout(timeout, UnixStream::connect(socket)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(ProbeError::Connect(e)),
            Err(_) => return Err(ProbeError::Timeout),
        };
        match request_status(stream, "localhost", path, timeout).await {
            Ok(status) if status < 500 => Ok(status),
            Ok(status) => Err(ProbeError::ServerError(status)),
            Err(e) => Err(e),
        }
    });

    let results = futures::future::join_all(probes).await;
    let total = results.len();
    let responsive = results.iter().filter(|r| r.is_ok()).count();
    for (socket, result) in sockets.iter().zip(&results) {
        if let Err(e) = result {
            debug!(socket = %socket.display(), error = %e, "Session socket probe failed");
        }
    }

    if responsive == 0 {
        return Err(ProbeError::NoneResponsive(total));
    }
    Ok(ProbeOutcome::Sockets { responsive, total })
}

#[cfg(not(unix))]
pub async fn probe_socket_dir(_dir: &Path, _path: &str, _timeout: Duration) -> Result<ProbeOutcome, ProbeError> {
    Err(ProbeError::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn serve_status(status: u16) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let response = format!("HTTP/1.1 {} X\r\nContent-Length: 0\r\n\r\n", status);
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn test_http_probe_accepts_non_5xx() {
        let port = serve_status(404).await;
        let status = probe_http(port, "/health", Duration::from_secs(1)).await.unwrap();
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn test_http_probe_rejects_5xx() {
        let port = serve_status(503).await;
        let err = probe_http(port, "/health", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ProbeError::ServerError(503)));
    }

    #[tokio::test]
    async fn test_http_probe_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = probe_http(port, "/", Duration::from_millis(500)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Connect(_) | ProbeError::Timeout));
    }

    #[tokio::test]
    async fn test_http_probe_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        let err = probe_http(port, "/", Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, ProbeError::Timeout));
    }

    #[tokio::test]
    async fn test_probe_requires_port() {
        let probe = HealthProbe::Tcp;
        let err = probe.check(None, Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, ProbeError::NoPort));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_socket_fanout_any_responsive_socket() {
        use tokio::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        // A stale socket file with no listener behind it
        let dead = UnixListener::bind(dir.path().join("a.sock")).unwrap();
        drop(dead);

        let live = UnixListener::bind(dir.path().join("b.sock")).unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = live.accept().await {
                let mut buf = [0u8; 512];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await;
            }
        });
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let outcome = probe_socket_dir(dir.path(), "/health", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, ProbeOutcome::Sockets { responsive: 1, total: 2 });
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_socket_fanout_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = probe_socket_dir(dir.path(), "/health", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::NoSockets(_)));
    }
}
