//! The control plane object: owns every component and the boot sequence
//!
//! Nothing here is global. `main` builds one `ControlPlane` and hands clones of
//! its `Arc` to the front door; tests build as many isolated ones as they like.

use crate::config::Config;
use crate::error::ControlError;
use crate::health::{HealthAggregator, HealthReport};
use crate::logs::LogTailer;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::ports::PortRegistry;
use crate::process::Supervisor;
use crate::service::ServiceId;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

/// What happened to each service during boot
#[derive(Debug, Default, Serialize)]
pub struct BootReport {
    pub started: Vec<ServiceId>,
    /// Lazy services, started on first request
    pub deferred: Vec<ServiceId>,
    /// Optional services that failed; the gateway runs without them
    pub degraded: Vec<(ServiceId, String)>,
    /// Services still coming up in the background after a startup timeout
    pub pending: Vec<ServiceId>,
}

pub struct ControlPlane {
    config: Arc<Config>,
    registry: Arc<PortRegistry>,
    supervisor: Arc<Supervisor>,
    health: HealthAggregator,
    logs: Arc<LogTailer>,
    pool: Arc<ConnectionPool>,
}

impl ControlPlane {
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let config = Arc::new(config);
        let registry = Arc::new(PortRegistry::new(config.port_ranges())?);
        let supervisor = Supervisor::new(&config, Arc::clone(&registry));
        let pool = Arc::new(ConnectionPool::new(PoolConfig::from(&config.server)));
        let health = HealthAggregator::new(Arc::clone(&supervisor), Arc::clone(&pool), &config.health);
        let logs = LogTailer::new(&config.server.log_dir, &config.logs);

        Ok(Arc::new(Self {
            config,
            registry,
            supervisor,
            health,
            logs,
            pool,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PortRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn logs(&self) -> &Arc<LogTailer> {
        &self.logs
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub async fn get_health(&self) -> HealthReport {
        self.health.get_health().await
    }

    /// A failure on this service aborts boot
    fn is_boot_critical(&self, id: ServiceId) -> bool {
        let Some(service) = self.config.service(id) else {
            return false;
        };
        if service.critical {
            return true;
        }
        id == ServiceId::Database
            && self
                .config
                .enabled_services()
                .into_iter()
                .filter_map(|other| self.config.service(other))
                .any(|other| other.requires_database && !other.lazy)
    }

    /// Start the services one after another in boot order.
    ///
    /// Fatal errors on critical services abort; everything else is logged and
    /// the gateway carries on degraded.
    pub async fn boot(&self) -> Result<BootReport, ControlError> {
        let mut report = BootReport::default();
        info!(
            services = ?self.supervisor.services(),
            external = self.supervisor.is_external(),
            "Booting services"
        );

        for id in self.supervisor.services() {
            let lazy = self.config.service(id).map(|s| s.lazy).unwrap_or(false);
            if lazy {
                info!(service = %id, "Lazy service, deferring start until first request");
                report.deferred.push(id);
                continue;
            }

            let critical = self.is_boot_critical(id);
            match self.supervisor.start(id).await {
                Ok(()) => {
                    info!(service = %id, port = self.supervisor.port(id), "Service ready");
                    report.started.push(id);
                }
                Err(e @ ControlError::StartupTimeout { .. }) | Err(e @ ControlError::UnexpectedExit { .. }) => {
                    warn!(service = %id, error = %e, "Service not ready yet, restarts continue in the background");
                    report.pending.push(id);
                }
                Err(e) if critical && e.is_fatal_for_boot() => {
                    error!(service = %id, error = %e, "Critical service failed, aborting boot");
                    return Err(e);
                }
                Err(e) => {
                    warn!(service = %id, error = %e, critical, "Service failed to start, continuing degraded");
                    report.degraded.push((id, e.to_string()));
                }
            }
        }

        info!(
            started = report.started.len(),
            deferred = report.deferred.len(),
            pending = report.pending.len(),
            degraded = report.degraded.len(),
            "Boot sequence complete"
        );
        Ok(report)
    }

    /// Refuse new work and stop everything in reverse boot order
    pub async fn shutdown(&self) {
        self.supervisor.begin_shutdown();
        self.supervisor.stop_all().await;
        info!("All services stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;

    fn base_config() -> Config {
        let mut config = Config::default();
        config.server.log_dir = std::env::temp_dir()
            .join(format!("switchboard-boot-{}", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .into_owned();
        config
    }

    #[test]
    fn test_rejects_overlapping_ranges() {
        let mut config = base_config();
        config.services.insert(
            "api".into(),
            ServiceConfig::command("sleep", &["60"]).with_port_range(4110, 4112),
        );
        assert!(ControlPlane::new(config).is_err());
    }

    #[test]
    fn test_database_is_critical_when_required() {
        let mut config = base_config();
        config
            .services
            .insert("database".into(), ServiceConfig::command("sleep", &["60"]));
        let mut api = ServiceConfig::command("sleep", &["60"]);
        api.requires_database = true;
        config.services.insert("api".into(), api);
        config
            .services
            .insert("bridge".into(), ServiceConfig::command("sleep", &["60"]));

        let plane = ControlPlane::new(config).unwrap();
        assert!(plane.is_boot_critical(ServiceId::Database));
        assert!(!plane.is_boot_critical(ServiceId::Bridge));
    }

    #[tokio::test]
    async fn test_boot_aborts_on_critical_configuration_error() {
        let mut config = base_config();
        let mut api = ServiceConfig::command("sleep", &["60"]).critical();
        api.requires_database = true;
        config.services.insert("api".into(), api);

        let plane = ControlPlane::new(config).unwrap();
        let err = plane.boot().await.unwrap_err();
        assert!(matches!(err, ControlError::ConfigurationMissing { service: ServiceId::Api, .. }));
    }

    #[tokio::test]
    async fn test_boot_continues_past_optional_failure() {
        let mut config = base_config();
        let mut bridge = ServiceConfig::command("sleep", &["60"]);
        bridge.requires_database = true;
        config.services.insert("bridge".into(), bridge);
        config
            .services
            .insert("devui".into(), ServiceConfig::command("sleep", &["60"]).lazy());

        let plane = ControlPlane::new(config).unwrap();
        let report = plane.boot().await.unwrap();
        assert_eq!(report.degraded.len(), 1);
        assert_eq!(report.degraded[0].0, ServiceId::Bridge);
        assert_eq!(report.deferred, vec![ServiceId::DevUi]);
        assert!(report.started.is_empty());

        plane.shutdown().await;
        assert!(plane.supervisor().is_shutting_down());
    }
}
