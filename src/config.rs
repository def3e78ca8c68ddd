use crate::service::ServiceId;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Front door and process layout settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Default settings for supervised services
    #[serde(default)]
    pub defaults: ServiceDefaults,

    /// Restart and circuit breaker policy
    #[serde(default)]
    pub restart: RestartConfig,

    /// Health aggregation settings
    #[serde(default)]
    pub health: HealthConfig,

    /// Log tailing settings
    #[serde(default)]
    pub logs: LogConfig,

    /// Supervised services keyed by service name
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,

    /// URL prefix routes on the front door
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public port of the front door
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address for the front door (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Directory holding one append-only log per service
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Which execution plan to use for each service
    #[serde(default)]
    pub layout: Layout,

    /// Connect to already-running services instead of spawning them
    #[serde(default)]
    pub external: bool,

    /// Connection string handed to services that need the database
    pub database_url: Option<String>,

    /// Max time to wait for a proxied response in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per service (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            log_dir: default_log_dir(),
            layout: Layout::default(),
            external: false,
            database_url: None,
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn log_path(&self, service: ServiceId) -> PathBuf {
        Path::new(&self.log_dir).join(format!("{}.log", service))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Installation layout of the service binaries
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// Packaged plan if its command exists, dev plan otherwise
    #[default]
    Auto,
    /// Source checkout, run through the language toolchains
    Dev,
    /// Bundled binaries shipped next to the gateway
    Packaged,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceDefaults {
    /// Time to wait for the first healthy probe on a normal start
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Startup bound when the install marker is missing (dependencies being installed)
    #[serde(default = "default_first_run_startup_timeout")]
    pub first_run_startup_timeout_secs: u64,

    /// Probe interval while starting in milliseconds
    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,

    /// Probe interval once healthy in milliseconds
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_ms: u64,

    /// Timeout of a single probe in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Default health endpoint path
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

impl Default for ServiceDefaults {
    fn default() -> Self {
        Self {
            startup_timeout_secs: default_startup_timeout(),
            first_run_startup_timeout_secs: default_first_run_startup_timeout(),
            health_check_interval_ms: default_health_interval(),
            monitor_interval_ms: default_monitor_interval(),
            probe_timeout_ms: default_probe_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            health_path: default_health_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RestartConfig {
    /// First restart delay in milliseconds, doubled per consecutive failure
    #[serde(default = "default_restart_base_delay")]
    pub base_delay_ms: u64,

    /// Upper bound of the restart delay in milliseconds
    #[serde(default = "default_restart_max_delay")]
    pub max_delay_ms: u64,

    /// Consecutive failures that open the circuit breaker
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Failures further apart than this no longer count as consecutive
    #[serde(default = "default_instability_window")]
    pub instability_window_secs: u64,

    /// Healthy time after which the failure count resets
    #[serde(default = "default_stability_window")]
    pub stability_window_secs: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_restart_base_delay(),
            max_delay_ms: default_restart_max_delay(),
            max_failures: default_max_failures(),
            instability_window_secs: default_instability_window(),
            stability_window_secs: default_stability_window(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    /// Shared deadline for all upstream probes in milliseconds
    #[serde(default = "default_health_timeout")]
    pub timeout_ms: u64,

    /// Service whose introspection endpoint enriches the report
    #[serde(default = "default_stats_service")]
    pub stats_service: Option<String>,

    /// Path of the introspection endpoint
    #[serde(default = "default_stats_path")]
    pub stats_path: String,

    /// Independent timeout of the enrichment call in milliseconds
    #[serde(default = "default_stats_timeout")]
    pub stats_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_health_timeout(),
            stats_service: default_stats_service(),
            stats_path: default_stats_path(),
            stats_timeout_ms: default_stats_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    /// File poll interval in milliseconds
    #[serde(default = "default_log_poll_interval")]
    pub poll_interval_ms: u64,

    /// Entries kept per service
    #[serde(default = "default_log_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Heartbeat comment interval on log streams in seconds
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,

    /// Limit used when a query does not give one
    #[serde(default = "default_log_limit")]
    pub default_limit: usize,

    /// Largest limit a query may ask for
    #[serde(default = "default_log_max_limit")]
    pub max_limit: usize,

    /// Bytes read from the end of a file the first time it is tailed
    #[serde(default = "default_log_initial_read")]
    pub initial_read_bytes: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_log_poll_interval(),
            buffer_capacity: default_log_buffer_capacity(),
            heartbeat_secs: default_heartbeat(),
            default_limit: default_log_limit(),
            max_limit: default_log_max_limit(),
            initial_read_bytes: default_log_initial_read(),
        }
    }
}

impl LogConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Clamp a requested limit into `1..=max_limit`
    pub fn clamp_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit.max(1))
    }
}

/// How the supervisor decides a service is healthy
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeConfig {
    /// GET a local HTTP path until a non-5xx status arrives
    Http { path: Option<String> },
    /// A TCP connect to the assigned port succeeds
    Tcp,
    /// Any socket in `dir` answers a minimal health request
    SocketFanout { dir: String, path: Option<String> },
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig::Http { path: None }
    }
}

/// One way of launching a service
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ExecPlan {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    pub working_dir: Option<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ExecPlan {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
        }
    }

    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    /// Whether the command resolves to an existing file
    fn command_exists(&self) -> bool {
        let command = Path::new(&self.command);
        if command.is_absolute() {
            return command.exists();
        }
        match &self.working_dir {
            Some(dir) => Path::new(dir).join(command).exists(),
            None => command.exists(),
        }
    }
}

/// Configuration for a single supervised service
///
/// # Security Warning
///
/// `dev` and `packaged` plans execute arbitrary commands. Configuration files
/// must be readable only by the service user.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Start on first demand instead of at boot
    #[serde(default)]
    pub lazy: bool,

    /// A critical service being down degrades the gateway
    #[serde(default)]
    pub critical: bool,

    #[serde(default)]
    pub probe: ProbeConfig,

    /// Whether the registry assigns a port to this service
    #[serde(default = "default_true")]
    pub needs_port: bool,

    /// Hand `DATABASE_URL` to the service; refuse to start without one
    #[serde(default)]
    pub requires_database: bool,

    /// Inclusive port range `[start, end]` (overrides the built-in range)
    pub port_range: Option<[u16; 2]>,

    /// Fixed port of an externally managed instance
    pub port: Option<u16>,

    /// Execution plan for a source checkout
    pub dev: Option<ExecPlan>,

    /// Execution plan for a packaged install
    pub packaged: Option<ExecPlan>,

    /// Path that exists once first-run installation completed
    pub install_marker: Option<String>,

    /// Command line from the environment, replaces both plans
    #[serde(skip)]
    pub command_override: Option<Vec<String>>,

    pub startup_timeout_secs: Option<u64>,
    pub first_run_startup_timeout_secs: Option<u64>,
    pub health_check_interval_ms: Option<u64>,
    pub monitor_interval_ms: Option<u64>,
    pub probe_timeout_ms: Option<u64>,
    pub shutdown_grace_period_secs: Option<u64>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lazy: false,
            critical: false,
            probe: ProbeConfig::default(),
            needs_port: true,
            requires_database: false,
            port_range: None,
            port: None,
            dev: None,
            packaged: None,
            install_marker: None,
            command_override: None,
            startup_timeout_secs: None,
            first_run_startup_timeout_secs: None,
            health_check_interval_ms: None,
            monitor_interval_ms: None,
            probe_timeout_ms: None,
            shutdown_grace_period_secs: None,
        }
    }
}

impl ServiceConfig {
    /// Create a service running `command` in both layouts
    pub fn command(command: &str, args: &[&str]) -> Self {
        Self {
            dev: Some(ExecPlan::new(command).with_args(args)),
            ..Self::default()
        }
    }

    pub fn with_probe(mut self, probe: ProbeConfig) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_port_range(mut self, start: u16, end: u16) -> Self {
        self.port_range = Some([start, end]);
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    /// Pick the execution plan for `layout`
    pub fn resolve_plan(&self, layout: Layout) -> Option<ExecPlan> {
        if let Some(words) = &self.command_override {
            let (command, args) = words.split_first()?;
            let base = self.dev.as_ref().or(self.packaged.as_ref());
            return Some(ExecPlan {
                command: command.clone(),
                args: args.to_vec(),
                working_dir: base.and_then(|p| p.working_dir.clone()),
                env: base.map(|p| p.env.clone()).unwrap_or_default(),
            });
        }

        match layout {
            Layout::Dev => self.dev.clone().or_else(|| self.packaged.clone()),
            Layout::Packaged => self.packaged.clone().or_else(|| self.dev.clone()),
            Layout::Auto => match &self.packaged {
                Some(packaged) if packaged.command_exists() => Some(packaged.clone()),
                _ => self.dev.clone().or_else(|| self.packaged.clone()),
            },
        }
    }

    /// Whether first-run installation still has to happen
    pub fn is_first_run(&self) -> bool {
        self.install_marker
            .as_ref()
            .map(|marker| !Path::new(marker).exists())
            .unwrap_or(false)
    }

    pub fn startup_timeout(&self, defaults: &ServiceDefaults) -> Duration {
        if self.is_first_run() {
            return Duration::from_secs(
                self.first_run_startup_timeout_secs
                    .unwrap_or(defaults.first_run_startup_timeout_secs),
            );
        }
        Duration::from_secs(self.startup_timeout_secs.unwrap_or(defaults.startup_timeout_secs))
    }

    pub fn health_check_interval(&self, defaults: &ServiceDefaults) -> Duration {
        Duration::from_millis(
            self.health_check_interval_ms
                .unwrap_or(defaults.health_check_interval_ms),
        )
    }

    pub fn monitor_interval(&self, defaults: &ServiceDefaults) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.unwrap_or(defaults.monitor_interval_ms))
    }

    pub fn probe_timeout(&self, defaults: &ServiceDefaults) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.unwrap_or(defaults.probe_timeout_ms))
    }

    pub fn shutdown_grace_period(&self, defaults: &ServiceDefaults) -> Duration {
        Duration::from_secs(
            self.shutdown_grace_period_secs
                .unwrap_or(defaults.shutdown_grace_period_secs),
        )
    }

    /// Health path for HTTP-style probes
    pub fn health_path<'a>(&'a self, defaults: &'a ServiceDefaults) -> &'a str {
        match &self.probe {
            ProbeConfig::Http { path: Some(path) } => path,
            ProbeConfig::SocketFanout { path: Some(path), .. } => path,
            _ => &defaults.health_path,
        }
    }

    pub fn port_range_for(&self, service: ServiceId) -> (u16, u16) {
        self.port_range
            .map(|[start, end]| (start, end))
            .unwrap_or_else(|| service.default_port_range())
    }

    /// Validate the service configuration
    pub fn validate(&self, name: &str, external: bool) -> Result<(), String> {
        if let Some([start, end]) = self.port_range {
            if start == 0 || start > end {
                return Err(format!(
                    "Service '{}': invalid port range {}-{}",
                    name, start, end
                ));
            }
        }

        if external {
            if self.needs_port && self.port.is_none() && self.enabled {
                return Err(format!(
                    "Service '{}': external mode requires a 'port' override",
                    name
                ));
            }
        } else if self.enabled && self.dev.is_none() && self.packaged.is_none() && self.command_override.is_none() {
            return Err(format!(
                "Service '{}': requires a 'dev' or 'packaged' execution plan",
                name
            ));
        }

        if let Some(plan) = self.dev.iter().chain(self.packaged.iter()).find(|p| p.command.is_empty()) {
            return Err(format!(
                "Service '{}': execution plan has an empty command (args: {:?})",
                name, plan.args
            ));
        }

        Ok(())
    }
}

/// A front door route: requests under `prefix` go to `service`
#[derive(Debug, Deserialize, Clone)]
pub struct RouteConfig {
    pub prefix: String,
    pub service: String,
    /// Remove the prefix before forwarding
    #[serde(default)]
    pub strip_prefix: bool,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_first_run_startup_timeout() -> u64 {
    300 // dependency installation on first boot
}

fn default_health_interval() -> u64 {
    250
}

fn default_monitor_interval() -> u64 {
    5000
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_shutdown_grace_period() -> u64 {
    10
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_restart_base_delay() -> u64 {
    1000
}

fn default_restart_max_delay() -> u64 {
    30_000
}

fn default_max_failures() -> u32 {
    5
}

fn default_instability_window() -> u64 {
    300
}

fn default_stability_window() -> u64 {
    60
}

fn default_health_timeout() -> u64 {
    3000
}

fn default_stats_service() -> Option<String> {
    Some("bridge".to_string())
}

fn default_stats_path() -> String {
    "/stats".to_string()
}

fn default_stats_timeout() -> u64 {
    1500
}

fn default_log_poll_interval() -> u64 {
    500
}

fn default_log_buffer_capacity() -> usize {
    500
}

fn default_heartbeat() -> u64 {
    15
}

fn default_log_limit() -> usize {
    100
}

fn default_log_max_limit() -> usize {
    1000
}

fn default_log_initial_read() -> u64 {
    1024 * 1024
}

fn parse_bool(key: &str, value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("{}: expected a boolean, got '{}'", key, other),
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply environment overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("SWITCHBOARD_PORT") {
            self.server.port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("SWITCHBOARD_PORT: {}", e))?;
        }
        if let Some(bind) = lookup("SWITCHBOARD_BIND") {
            self.server.bind = bind;
        }
        if let Some(dir) = lookup("SWITCHBOARD_LOG_DIR") {
            self.server.log_dir = dir;
        }
        if let Some(external) = lookup("SWITCHBOARD_EXTERNAL") {
            self.server.external = parse_bool("SWITCHBOARD_EXTERNAL", &external)?;
        }
        if let Some(url) = lookup("DATABASE_URL").filter(|u| !u.is_empty()) {
            self.server.database_url = Some(url);
        }

        let lazy_all = match lookup("SWITCHBOARD_LAZY") {
            Some(value) => parse_bool("SWITCHBOARD_LAZY", &value)?,
            None => false,
        };

        for id in ServiceId::ALL {
            let prefix = id.env_prefix();
            let enabled = lookup(&format!("{}_ENABLED", prefix));
            let lazy = lookup(&format!("{}_LAZY", prefix));
            let port = lookup(&format!("{}_PORT", prefix));
            let command = lookup(&format!("{}_COMMAND", prefix));

            let listed = self.services.contains_key(id.as_str());
            let touched = enabled.is_some() || lazy.is_some() || port.is_some() || command.is_some();
            if !listed && !touched {
                continue;
            }

            let service = self.services.entry(id.as_str().to_string()).or_default();
            if let Some(value) = enabled {
                service.enabled = parse_bool(&format!("{}_ENABLED", prefix), &value)?;
            }
            if let Some(value) = port {
                service.port = Some(
                    value
                        .parse()
                        .map_err(|e| anyhow::anyhow!("{}_PORT: {}", prefix, e))?,
                );
            }
            if let Some(value) = command {
                let words = shell_words::split(&value)
                    .map_err(|e| anyhow::anyhow!("{}_COMMAND: {}", prefix, e))?;
                if !words.is_empty() {
                    service.command_override = Some(words);
                }
            }
            if lazy_all && !service.critical {
                service.lazy = true;
            }
            if let Some(value) = lazy {
                service.lazy = parse_bool(&format!("{}_LAZY", prefix), &value)?;
            }
        }

        Ok(())
    }

    /// Configuration of a service, if it is listed
    pub fn service(&self, id: ServiceId) -> Option<&ServiceConfig> {
        self.services.get(id.as_str())
    }

    /// Services that are listed and enabled, in boot order
    pub fn enabled_services(&self) -> Vec<ServiceId> {
        ServiceId::ALL
            .into_iter()
            .filter(|id| self.service(*id).map(|s| s.enabled).unwrap_or(false))
            .collect()
    }

    /// Port ranges for every service (configured or built-in)
    pub fn port_ranges(&self) -> Vec<(ServiceId, (u16, u16))> {
        ServiceId::ALL
            .into_iter()
            .map(|id| {
                let range = self
                    .service(id)
                    .map(|s| s.port_range_for(id))
                    .unwrap_or_else(|| id.default_port_range());
                (id, range)
            })
            .collect()
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for (name, service) in &self.services {
            if name.parse::<ServiceId>().is_err() {
                errors.push(format!("Unknown service '{}'", name));
                continue;
            }
            if let Err(e) = service.validate(name, self.server.external) {
                errors.push(e);
            }
        }

        let ranges = self.port_ranges();
        for (i, (a, (a_start, a_end))) in ranges.iter().enumerate() {
            for (b, (b_start, b_end)) in ranges.iter().skip(i + 1) {
                if a_start <= b_end && b_start <= a_end {
                    errors.push(format!(
                        "Port ranges of '{}' ({}-{}) and '{}' ({}-{}) overlap",
                        a, a_start, a_end, b, b_start, b_end
                    ));
                }
            }
        }

        for route in &self.routes {
            if !route.prefix.starts_with('/') {
                errors.push(format!("Route '{}': prefix must start with '/'", route.prefix));
            }
            match route.service.parse::<ServiceId>() {
                Ok(id) if self.service(id).is_none() => errors.push(format!(
                    "Route '{}': service '{}' is not configured",
                    route.prefix, route.service
                )),
                Ok(_) => {}
                Err(e) => errors.push(format!("Route '{}': {}", route.prefix, e)),
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 9000
log_dir = "/var/log/switchboard"
layout = "packaged"

[defaults]
startup_timeout_secs = 60
health_path = "/healthz"

[restart]
max_failures = 3

[services.api]
critical = true
requires_database = true
dev = { command = "node", args = ["dist/main.js"], working_dir = "api" }
packaged = { command = "bin/api" }

[services.sessions]
needs_port = false
probe = { type = "socket_fanout", dir = "/tmp/sessions" }
dev = { command = "python", args = ["-m", "sessions"] }

[services.database]
probe = { type = "tcp" }
dev = { command = "postgres" }

[[routes]]
prefix = "/api"
service = "api"
strip_prefix = true
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.layout, Layout::Packaged);
        assert_eq!(config.defaults.startup_timeout_secs, 60);
        assert_eq!(config.restart.max_failures, 3);
        assert_eq!(config.services.len(), 3);
        assert_eq!(config.routes.len(), 1);

        let api = config.service(ServiceId::Api).unwrap();
        assert!(api.critical);
        assert!(api.requires_database);
        assert_eq!(api.probe, ProbeConfig::Http { path: None });
        assert_eq!(api.health_path(&config.defaults), "/healthz");

        let sessions = config.service(ServiceId::Sessions).unwrap();
        assert!(!sessions.needs_port);
        assert_eq!(
            sessions.probe,
            ProbeConfig::SocketFanout { dir: "/tmp/sessions".into(), path: None }
        );
        assert_eq!(config.service(ServiceId::Database).unwrap().probe, ProbeConfig::Tcp);
        config.validate().unwrap();
    }

    #[test]
    fn test_default_configs() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.layout, Layout::Auto);
        assert!(!config.server.external);
        assert_eq!(config.restart.max_failures, 5);
        assert_eq!(config.restart.base_delay_ms, 1000);
        assert_eq!(config.restart.max_delay_ms, 30_000);
        assert_eq!(config.health.stats_service.as_deref(), Some("bridge"));
        assert_eq!(config.logs.buffer_capacity, 500);
        assert!(config.enabled_services().is_empty());
    }

    #[test]
    fn test_service_overrides_defaults() {
        let defaults = ServiceDefaults::default();
        let mut service = ServiceConfig::command("node", &["server.js"]);
        assert_eq!(service.startup_timeout(&defaults), Duration::from_secs(30));
        assert_eq!(service.monitor_interval(&defaults), Duration::from_millis(5000));

        service.startup_timeout_secs = Some(5);
        service.monitor_interval_ms = Some(100);
        service.shutdown_grace_period_secs = Some(1);
        assert_eq!(service.startup_timeout(&defaults), Duration::from_secs(5));
        assert_eq!(service.monitor_interval(&defaults), Duration::from_millis(100));
        assert_eq!(service.shutdown_grace_period(&defaults), Duration::from_secs(1));
    }

    #[test]
    fn test_first_run_uses_longer_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("node_modules");
        let defaults = ServiceDefaults::default();

        let mut service = ServiceConfig::command("node", &[]);
        service.install_marker = Some(marker.to_string_lossy().into_owned());
        assert!(service.is_first_run());
        assert_eq!(service.startup_timeout(&defaults), Duration::from_secs(300));

        std::fs::create_dir(&marker).unwrap();
        assert!(!service.is_first_run());
        assert_eq!(service.startup_timeout(&defaults), Duration::from_secs(30));
    }

    #[test]
    fn test_resolve_plan_auto_prefers_existing_packaged() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("api");
        let mut service = ServiceConfig::command("node", &["main.js"]);
        service.packaged = Some(ExecPlan::new(&binary.to_string_lossy()));

        assert_eq!(service.resolve_plan(Layout::Auto).unwrap().command, "node");
        std::fs::write(&binary, b"").unwrap();
        assert_eq!(
            service.resolve_plan(Layout::Auto).unwrap().command,
            binary.to_string_lossy()
        );
        assert_eq!(service.resolve_plan(Layout::Dev).unwrap().command, "node");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .services
            .insert("api".into(), ServiceConfig::command("node", &[]).critical());
        config
            .services
            .insert("bridge".into(), ServiceConfig::command("bridge", &[]));

        config
            .apply_env(env(&[
                ("SWITCHBOARD_PORT", "9100"),
                ("SWITCHBOARD_LAZY", "true"),
                ("SWITCHBOARD_DEVUI_ENABLED", "0"),
                ("SWITCHBOARD_BRIDGE_PORT", "5100"),
                ("SWITCHBOARD_API_COMMAND", "node --inspect 'dist/main.js'"),
                ("DATABASE_URL", "postgres://localhost/app"),
            ]))
            .unwrap();

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.database_url.as_deref(), Some("postgres://localhost/app"));

        let api = config.service(ServiceId::Api).unwrap();
        assert!(!api.lazy, "critical services are never made lazy globally");
        let plan = api.resolve_plan(Layout::Auto).unwrap();
        assert_eq!(plan.command, "node");
        assert_eq!(plan.args, vec!["--inspect", "dist/main.js"]);

        let bridge = config.service(ServiceId::Bridge).unwrap();
        assert!(bridge.lazy);
        assert_eq!(bridge.port, Some(5100));

        assert!(!config.service(ServiceId::DevUi).unwrap().enabled);
        assert_eq!(config.enabled_services(), vec![ServiceId::Api, ServiceId::Bridge]);
    }

    #[test]
    fn test_env_rejects_bad_boolean() {
        let mut config = Config::default();
        let err = config
            .apply_env(env(&[("SWITCHBOARD_EXTERNAL", "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains("SWITCHBOARD_EXTERNAL"));
    }

    #[test]
    fn test_validate_overlapping_ranges() {
        let mut config = Config::default();
        config.services.insert(
            "api".into(),
            ServiceConfig::command("node", &[]).with_port_range(4110, 4115),
        );
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("overlap"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let mut config = Config::default();
        config.services.insert("mailer".into(), ServiceConfig::command("x", &[]));
        config.services.insert("api".into(), ServiceConfig::default());
        config.routes.push(RouteConfig {
            prefix: "ui".into(),
            service: "devui".into(),
            strip_prefix: false,
        });

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("Unknown service 'mailer'"));
        assert!(err.contains("execution plan"));
        assert!(err.contains("must start with '/'"));
        assert!(err.contains("not configured"));
    }

    #[test]
    fn test_external_mode_requires_port() {
        let mut config = Config::default();
        config.server.external = true;
        config.services.insert("api".into(), ServiceConfig::default());
        assert!(config.validate().is_err());

        config.services.get_mut("api").unwrap().port = Some(3000);
        config.validate().unwrap();
    }

    #[test]
    fn test_clamp_limit() {
        let logs = LogConfig::default();
        assert_eq!(logs.clamp_limit(None), 100);
        assert_eq!(logs.clamp_limit(Some(0)), 1);
        assert_eq!(logs.clamp_limit(Some(5000)), 1000);
        assert_eq!(logs.clamp_limit(Some(42)), 42);
    }
}
