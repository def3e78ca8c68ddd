//! Pooled HTTP clients towards the supervised services
//!
//! All upstreams live on loopback, so one keep-alive pool per body type is
//! enough: one for forwarded requests, one for the gateway's own GETs.

use crate::config::ServerConfig;
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HOST;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("upstream request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("invalid upstream request: {0}")]
    RequestBuild(String),
    #[error("reading upstream body failed: {0}")]
    Body(#[from] hyper::Error),
    #[error("upstream answered {0}")]
    Status(u16),
    #[error("upstream body is not JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("upstream did not answer within {}ms", .0.as_millis())]
    Timeout(Duration),
}

#[derive(Debug, Default)]
pub struct PoolStats {
    forwarded: AtomicU64,
    fetches: AtomicU64,
}

impl PoolStats {
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

impl From<&ServerConfig> for PoolConfig {
    fn from(server: &ServerConfig) -> Self {
        Self {
            max_idle_per_host: server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(server.pool_idle_timeout_secs),
        }
    }
}

pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    fetch_client: Client<HttpConnector, Empty<Bytes>>,
    stats: PoolStats,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        let fetch_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Upstream connection pool initialized"
        );

        Self {
            client,
            fetch_client,
            stats: PoolStats::default(),
        }
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Forward `req` to `127.0.0.1:<port>` with `path_and_query` as the new target
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        port: u16,
        path_and_query: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let uri = format!("http://127.0.0.1:{}{}", port, path_and_query);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder()
            .method(parts.method)
            .uri(&uri)
            .version(hyper::Version::HTTP_11);
        for (key, value) in parts.headers.iter() {
            // HTTP/2 requests carry no Host header; hyper derives one from the URI
            if key == HOST {
                continue;
            }
            builder = builder.header(key, value);
        }
        if let Some(host) = parts.headers.get(HOST) {
            builder = builder.header("X-Forwarded-Host", host);
        }

        let upstream_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
        let response = self.client.request(upstream_req).await?;
        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// GET a JSON document from a loopback service, bounded by `timeout`
    pub async fn fetch_json(
        &self,
        port: u16,
        path: &str,
        timeout: Duration,
    ) -> Result<serde_json::Value, PoolError> {
        let uri = format!("http://127.0.0.1:{}{}", port, path);
        let req = Request::builder()
            .method("GET")
            .uri(&uri)
            .header("Accept", "application/json")
            .body(Empty::<Bytes>::new())
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.fetches.fetch_add(1, Ordering::Relaxed);
        let fetch = async {
            let response = self.fetch_client.request(req).await?;
            let status = response.status();
            if !status.is_success() {
                return Err(PoolError::Status(status.as_u16()));
            }
            let body = response.into_body().collect().await?.to_bytes();
            Ok(serde_json::from_slice(&body)?)
        };

        tokio::time::timeout(timeout, fetch)
            .await
            .map_err(|_| PoolError::Timeout(timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(response: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    #[test]
    fn test_pool_config_from_server() {
        let server = ServerConfig {
            pool_max_idle_per_host: 3,
            pool_idle_timeout_secs: 7,
            ..ServerConfig::default()
        };
        let config = PoolConfig::from(&server);
        assert_eq!(config.max_idle_per_host, 3);
        assert_eq!(config.idle_timeout, Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_fetch_json() {
        let port = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 15\r\nConnection: close\r\n\r\n{\"sessions\":3}\n",
        )
        .await;
        let pool = ConnectionPool::new(PoolConfig::default());
        let value = pool
            .fetch_json(port, "/stats", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(value["sessions"], 3);
        assert_eq!(pool.stats().fetches(), 1);
    }

    #[tokio::test]
    async fn test_fetch_json_rejects_error_status() {
        let port = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let pool = ConnectionPool::new(PoolConfig::default());
        let err = pool
            .fetch_json(port, "/stats", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Status(503)));
    }

    #[tokio::test]
    async fn test_fetch_json_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        let pool = ConnectionPool::new(PoolConfig::default());
        let err = pool
            .fetch_json(port, "/stats", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Timeout(_)));
    }
}
