//! Aggregated health report for the gateway and the services behind it

use crate::config::HealthConfig;
use crate::pool::ConnectionPool;
use crate::process::{ProcessState, Supervisor};
use crate::service::ServiceId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Name of the gateway's own entry in the report
pub const GATEWAY_ENTRY: &str = "gateway";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Up,
    Degraded,
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    pub latency_ms: Option<u64>,
    pub details: Map<String, Value>,
}

impl ServiceHealth {
    fn down(details: Map<String, Value>) -> Self {
        Self {
            status: HealthStatus::Down,
            latency_ms: None,
            details,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub services: BTreeMap<String, ServiceHealth>,
}

pub struct HealthAggregator {
    supervisor: Arc<Supervisor>,
    pool: Arc<ConnectionPool>,
    timeout: Duration,
    stats_service: Option<ServiceId>,
    stats_path: String,
    stats_timeout: Duration,
    started_at: Instant,
}

impl HealthAggregator {
    pub fn new(supervisor: Arc<Supervisor>, pool: Arc<ConnectionPool>, config: &HealthConfig) -> Self {
        Self {
            supervisor,
            pool,
            timeout: Duration::from_millis(config.timeout_ms),
            stats_service: config
                .stats_service
                .as_deref()
                .and_then(|name| name.parse().ok()),
            stats_path: config.stats_path.clone(),
            stats_timeout: Duration::from_millis(config.stats_timeout_ms),
            started_at: Instant::now(),
        }
    }

    /// Probe every enabled service concurrently under one deadline
    pub async fn get_health(&self) -> HealthReport {
        let deadline = Instant::now() + self.timeout;
        let services = self.supervisor.services();

        let checks = services.iter().map(|&id| self.check_service(id, deadline));
        let results = futures::future::join_all(checks).await;

        let mut status = HealthStatus::Up;
        let mut entries = BTreeMap::new();
        entries.insert(GATEWAY_ENTRY.to_string(), self.gateway_entry());

        for (id, health) in services.into_iter().zip(results) {
            let critical = self
                .supervisor
                .service_config(id)
                .map(|c| c.critical)
                .unwrap_or(false);
            if critical && health.status == HealthStatus::Down {
                status = HealthStatus::Degraded;
            }
            entries.insert(id.to_string(), health);
        }

        HealthReport {
            status,
            timestamp: Utc::now(),
            services: entries,
        }
    }

    async fn check_service(&self, id: ServiceId, deadline: Instant) -> ServiceHealth {
        let state = self.supervisor.state(id);
        let mut details = Map::new();
        details.insert("state".to_string(), json!(state));

        if !state.is_running() {
            let lazy = self
                .supervisor
                .service_config(id)
                .map(|c| c.lazy)
                .unwrap_or(false);
            if lazy && state == ProcessState::Stopped {
                details.insert("lazy".to_string(), json!(true));
            }
            return ServiceHealth::down(details);
        }

        let Some(probe) = self.supervisor.probe(id) else {
            return ServiceHealth::down(details);
        };
        let port = self.supervisor.port(id);
        if let Some(port) = port {
            details.insert("port".to_string(), json!(port));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let probe_timeout = self.supervisor.probe_timeout(id).min(remaining);
        let started = Instant::now();

        let outcome = tokio::time::timeout_at(deadline, probe.check(port, probe_timeout)).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(outcome)) => {
                debug!(service = %id, ?outcome, latency_ms, "Health probe succeeded");
                let mut health = ServiceHealth {
                    status: HealthStatus::Up,
                    latency_ms: Some(latency_ms),
                    details,
                };
                if Some(id) == self.stats_service {
                    if let Some(port) = port {
                        self.enrich_with_stats(id, port, &mut health.details).await;
                    }
                }
                health
            }
            Ok(Err(e)) => {
                debug!(service = %id, error = %e, "Health probe failed");
                details.insert("error".to_string(), json!(e.to_string()));
                ServiceHealth {
                    status: HealthStatus::Down,
                    latency_ms: Some(latency_ms),
                    details,
                }
            }
            Err(_) => {
                debug!(service = %id, "Health probe hit the shared deadline");
                details.insert("error".to_string(), json!("timed out"));
                ServiceHealth {
                    status: HealthStatus::Down,
                    latency_ms: Some(latency_ms),
                    details,
                }
            }
        }
    }

    async fn enrich_with_stats(&self, id: ServiceId, port: u16, details: &mut Map<String, Value>) {
        match self
            .pool
            .fetch_json(port, &self.stats_path, self.stats_timeout)
            .await
        {
            Ok(stats) => {
                details.insert("stats".to_string(), stats);
            }
            Err(e) => {
                debug!(service = %id, error = %e, "Stats enrichment failed");
                details.insert("stats_error".to_string(), json!(e.to_string()));
            }
        }
    }

    fn gateway_entry(&self) -> ServiceHealth {
        let mut details = Map::new();
        details.insert(
            "uptime_secs".to_string(),
            json!(self.started_at.elapsed().as_secs()),
        );
        details.insert("memory_rss_bytes".to_string(), json!(resident_memory_bytes()));
        details.insert("version".to_string(), json!(env!("CARGO_PKG_VERSION")));
        details.insert("pid".to_string(), json!(std::process::id()));
        details.insert(
            "requests_forwarded".to_string(),
            json!(self.pool.stats().forwarded()),
        );
        ServiceHealth {
            status: HealthStatus::Up,
            latency_ms: Some(0),
            details,
        }
    }
}

/// Resident set size of this process
#[cfg(target_os = "linux")]
fn resident_memory_bytes() -> Option<u64> {
    // statm: size resident shared text lib data dt (in pages)
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some(resident * page_size as u64)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_bytes() -> Option<u64> {
    None
}
