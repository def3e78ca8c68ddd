use crate::breaker::{CircuitBreaker, RestartDecision, RestartPolicy};
use crate::config::{Config, ExecPlan, ServerConfig, ServiceConfig, ServiceDefaults};
use crate::error::ControlError;
use crate::ports::PortRegistry;
use crate::probe::HealthProbe;
use crate::service::ServiceId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Extra time given to a SIGKILLed process to be reaped
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state of a supervised service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// No process and no pending restart
    Stopped,
    /// Spawned, waiting for the first healthy probe
    Spawning,
    /// Running and answering probes
    Healthy,
    /// Running but probes are failing
    Unhealthy,
    /// Exited unexpectedly, restart scheduled
    Backoff,
    /// Circuit breaker open, no automatic restart
    Failed,
    /// Shutting down on request
    Stopping,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Spawning => "spawning",
            ProcessState::Healthy => "healthy",
            ProcessState::Unhealthy => "unhealthy",
            ProcessState::Backoff => "backoff",
            ProcessState::Failed => "failed",
            ProcessState::Stopping => "stopping",
        }
    }

    /// A process exists (or is about to) for this state
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ProcessState::Spawning | ProcessState::Healthy | ProcessState::Unhealthy
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supervisor record of one service; survives restarts, dropped on stop
struct ManagedProcess {
    pid: Option<u32>,
    port: Option<u16>,
    state: ProcessState,
    restart_count: u32,
    last_restart_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    /// When the current healthy stretch began
    healthy_since: Option<Instant>,
    /// Unique per spawn; callbacks carrying another value are ignored
    generation: u64,
    breaker: CircuitBreaker,
    /// Asks the exit monitor to SIGKILL the child
    kill_tx: Option<oneshot::Sender<()>>,
    /// Holds the exit status once the current child is gone
    exit_rx: Option<watch::Receiver<Option<String>>>,
}

impl ManagedProcess {
    fn new() -> Self {
        Self {
            pid: None,
            port: None,
            state: ProcessState::Stopped,
            restart_count: 0,
            last_restart_at: None,
            started_at: None,
            last_error: None,
            healthy_since: None,
            generation: 0,
            breaker: CircuitBreaker::default(),
            kill_tx: None,
            exit_rx: None,
        }
    }
}

/// Static per-service data plus the lifecycle lock
struct ServiceSlot {
    config: ServiceConfig,
    probe: HealthProbe,
    /// Serializes start, restart and stop of this service
    lifecycle: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<ProcessState>,
}

/// Status information for a service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub service: ServiceId,
    pub state: ProcessState,
    pub healthy: bool,
    pub enabled: bool,
    pub lazy: bool,
    pub critical: bool,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub restart_count: u32,
    pub consecutive_failures: u32,
    pub breaker_open: bool,
    pub last_restart_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Spawns, restarts and health-polls the configured services.
///
/// Like the registry it is shared behind an `Arc`; methods that schedule
/// background work (exit monitors, restart timers, health monitors) take
/// `&Arc<Self>`.
pub struct Supervisor {
    slots: HashMap<ServiceId, ServiceSlot>,
    processes: DashMap<ServiceId, Mutex<ManagedProcess>>,
    registry: Arc<PortRegistry>,
    defaults: ServiceDefaults,
    policy: RestartPolicy,
    server: ServerConfig,
    /// Source of spawn generations; never reused, even across stop/start
    generations: AtomicU64,
    shutting_down: AtomicBool,
}

impl Supervisor {
    pub fn new(config: &Config, registry: Arc<PortRegistry>) -> Arc<Self> {
        let slots = config
            .services
            .iter()
            .filter_map(|(name, service)| {
                let id = name.parse::<ServiceId>().ok()?;
                let (state_tx, _) = watch::channel(ProcessState::Stopped);
                Some((
                    id,
                    ServiceSlot {
                        probe: HealthProbe::from_config(service, &config.defaults),
                        config: service.clone(),
                        lifecycle: tokio::sync::Mutex::new(()),
                        state_tx,
                    },
                ))
            })
            .collect();

        Arc::new(Self {
            slots,
            processes: DashMap::new(),
            registry,
            defaults: config.defaults.clone(),
            policy: RestartPolicy::from(&config.restart),
            server: config.server.clone(),
            generations: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &Arc<PortRegistry> {
        &self.registry
    }

    pub fn is_external(&self) -> bool {
        self.server.external
    }

    /// Enabled services in boot order
    pub fn services(&self) -> Vec<ServiceId> {
        ServiceId::ALL
            .into_iter()
            .filter(|id| self.slots.get(id).map(|s| s.config.enabled).unwrap_or(false))
            .collect()
    }

    pub fn service_config(&self, id: ServiceId) -> Option<&ServiceConfig> {
        self.slots.get(&id).map(|s| &s.config)
    }

    pub fn probe(&self, id: ServiceId) -> Option<&HealthProbe> {
        self.slots.get(&id).map(|s| &s.probe)
    }

    pub fn probe_timeout(&self, id: ServiceId) -> Duration {
        self.slots
            .get(&id)
            .map(|s| s.config.probe_timeout(&self.defaults))
            .unwrap_or_else(|| Duration::from_millis(self.defaults.probe_timeout_ms))
    }

    pub fn state(&self, id: ServiceId) -> ProcessState {
        self.processes
            .get(&id)
            .map(|p| p.lock().state)
            .unwrap_or(ProcessState::Stopped)
    }

    pub fn is_healthy(&self, id: ServiceId) -> bool {
        self.state(id) == ProcessState::Healthy
    }

    /// Port the service listens on, if it has one
    pub fn port(&self, id: ServiceId) -> Option<u16> {
        self.processes
            .get(&id)
            .and_then(|p| p.lock().port)
            .or_else(|| self.registry.port(id))
    }

    /// Receive every state change of `id`
    pub fn watch_state(&self, id: ServiceId) -> Option<watch::Receiver<ProcessState>> {
        self.slots.get(&id).map(|s| s.state_tx.subscribe())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Refuse new work from now on; exit handlers stop restarting
    pub fn begin_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            info!("Supervisor entering shutdown");
        }
    }

    fn slot(&self, id: ServiceId) -> Result<&ServiceSlot, ControlError> {
        match self.slots.get(&id) {
            Some(slot) if slot.config.enabled => Ok(slot),
            _ => Err(ControlError::ServiceDisabled(id)),
        }
    }

    /// Single mutation point for the state machine
    fn transition(&self, id: ServiceId, process: &mut ManagedProcess, to: ProcessState) {
        let from = process.state;
        if from == to {
            return;
        }
        process.state = to;
        process.healthy_since = (to == ProcessState::Healthy).then(Instant::now);

        match to {
            ProcessState::Healthy if from == ProcessState::Unhealthy => {
                info!(service = %id, %from, %to, "Service recovered")
            }
            ProcessState::Healthy => info!(service = %id, %from, %to, "Service is healthy"),
            ProcessState::Unhealthy => warn!(service = %id, %from, %to, "Service is unhealthy"),
            ProcessState::Backoff => warn!(service = %id, %from, %to, "Service waiting to restart"),
            ProcessState::Failed => error!(service = %id, %from, %to, "Service failed permanently"),
            _ => info!(service = %id, %from, %to, "Service state changed"),
        }

        if let Some(slot) = self.slots.get(&id) {
            slot.state_tx.send_replace(to);
        }
    }

    /// Run `f` on the record of `id` if its generation still matches
    fn with_generation<R>(
        &self,
        id: ServiceId,
        generation: u64,
        f: impl FnOnce(&mut ManagedProcess) -> R,
    ) -> Option<R> {
        let entry = self.processes.get(&id)?;
        let mut guard = entry.lock();
        if guard.generation != generation {
            return None;
        }
        Some(f(&mut guard))
    }

    /// Start a service and wait until it is healthy.
    ///
    /// A startup timeout or an early exit is returned to the caller while the
    /// restart path continues in the background.
    pub async fn start(self: &Arc<Self>, id: ServiceId) -> Result<(), ControlError> {
        if self.is_shutting_down() {
            return Err(ControlError::ShuttingDown);
        }
        let slot = self.slot(id)?;
        let _guard = slot.lifecycle.lock().await;

        if let Some(entry) = self.processes.get(&id) {
            let guard = entry.lock();
            if guard.state.is_running() {
                debug!(service = %id, state = %guard.state, "Service already running");
                return Ok(());
            }
            if guard.breaker.is_open() {
                return Err(ControlError::CircuitOpen {
                    service: id,
                    failures: guard.breaker.attempts(),
                });
            }
        }

        self.spawn_and_confirm(id).await
    }

    /// Start the service on first demand; no-op when it already runs
    pub async fn ensure_running(self: &Arc<Self>, id: ServiceId) -> Result<(), ControlError> {
        let slot = self.slot(id)?;
        let wait_bound = slot.config.startup_timeout(&self.defaults) + self.policy.max_delay;
        let mut state_rx = self
            .watch_state(id)
            .ok_or(ControlError::ServiceDisabled(id))?;

        loop {
            if self.is_shutting_down() {
                return Err(ControlError::ShuttingDown);
            }
            state_rx.borrow_and_update();

            let (state, failures) = match self.processes.get(&id) {
                Some(entry) => {
                    let guard = entry.lock();
                    (guard.state, guard.breaker.attempts())
                }
                None => (ProcessState::Stopped, 0),
            };

            match state {
                ProcessState::Healthy | ProcessState::Unhealthy => return Ok(()),
                ProcessState::Failed => {
                    return Err(ControlError::CircuitOpen { service: id, failures })
                }
                ProcessState::Stopped => return self.start(id).await,
                ProcessState::Spawning | ProcessState::Backoff | ProcessState::Stopping => {
                    debug!(service = %id, %state, "Waiting for service to settle");
                    match tokio::time::timeout(wait_bound, state_rx.changed()).await {
                        Ok(Ok(())) => continue,
                        Ok(Err(_)) => return Err(ControlError::ServiceDisabled(id)),
                        Err(_) => {
                            return Err(ControlError::StartupTimeout {
                                service: id,
                                timeout: wait_bound,
                            })
                        }
                    }
                }
            }
        }
    }

    /// Operator restart: stop, clear the breaker, start again
    pub async fn restart(self: &Arc<Self>, id: ServiceId) -> Result<(), ControlError> {
        self.slot(id)?;
        info!(service = %id, "Operator restart requested");
        self.stop(id).await;
        self.start(id).await
    }

    fn database_url(&self) -> Option<String> {
        if let Some(url) = &self.server.database_url {
            return Some(url.clone());
        }
        let supervised = self
            .slots
            .get(&ServiceId::Database)
            .map(|s| s.config.enabled)
            .unwrap_or(false);
        if !supervised {
            return None;
        }
        self.port(ServiceId::Database)
            .map(|port| format!("postgres://127.0.0.1:{}/postgres", port))
    }

    /// Spawn one attempt and wait for health. Caller holds the lifecycle lock.
    async fn spawn_and_confirm(self: &Arc<Self>, id: ServiceId) -> Result<(), ControlError> {
        let slot = self.slot(id)?;
        let config = &slot.config;

        let database_url = if config.requires_database {
            Some(self.database_url().ok_or_else(|| ControlError::ConfigurationMissing {
                service: id,
                what: "DATABASE_URL".to_string(),
            })?)
        } else {
            None
        };

        let port = if self.server.external {
            config.port.map(|port| self.registry.pin(id, port).port)
        } else if config.needs_port {
            Some(self.registry.allocate(id)?.port)
        } else {
            None
        };

        let plan = if self.server.external {
            None
        } else {
            Some(config.resolve_plan(self.server.layout).ok_or_else(|| {
                ControlError::ConfigurationMissing {
                    service: id,
                    what: "execution plan".to_string(),
                }
            })?)
        };

        let generation = {
            let entry = self
                .processes
                .entry(id)
                .or_insert_with(|| Mutex::new(ManagedProcess::new()));
            let mut guard = entry.lock();
            guard.generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
            guard.port = port;
            guard.pid = None;
            guard.last_error = None;
            self.transition(id, &mut guard, ProcessState::Spawning);
            guard.generation
        };

        let exit_rx = match plan {
            Some(plan) => match self.spawn_child(id, generation, &plan, port, database_url).await {
                Ok(rx) => Some(rx),
                Err(e) => {
                    error!(service = %id, error = %e, "Failed to spawn service");
                    self.registry.release(id);
                    self.with_generation(id, generation, |p| {
                        p.last_error = Some(e.to_string());
                        p.port = None;
                        self.transition(id, p, ProcessState::Stopped);
                    });
                    return Err(e);
                }
            },
            None => None,
        };

        let timeout = config.startup_timeout(&self.defaults);
        match self.wait_for_health(id, port, exit_rx, timeout).await {
            Ok(()) => {
                let confirmed = self
                    .with_generation(id, generation, |p| {
                        p.started_at = Some(Utc::now());
                        self.transition(id, p, ProcessState::Healthy);
                    })
                    .is_some();
                if confirmed {
                    self.spawn_stability_timer(id, generation);
                    self.spawn_health_monitor(id, generation, port);
                }
                Ok(())
            }
            Err(ControlError::StartupTimeout { timeout, .. }) => {
                error!(service = %id, timeout_secs = timeout.as_secs(), "Service startup timeout exceeded");
                if self.server.external {
                    self.with_generation(id, generation, |p| {
                        self.transition(id, p, ProcessState::Unhealthy)
                    });
                    self.spawn_health_monitor(id, generation, port);
                } else {
                    // The exit monitor sees the kill and drives the restart path
                    self.with_generation(id, generation, |p| {
                        p.last_error = Some("startup timeout".to_string());
                        if let Some(kill) = p.kill_tx.take() {
                            let _ = kill.send(());
                        }
                    });
                }
                Err(ControlError::StartupTimeout { service: id, timeout })
            }
            Err(e) => Err(e),
        }
    }

    async fn spawn_child(
        self: &Arc<Self>,
        id: ServiceId,
        generation: u64,
        plan: &ExecPlan,
        port: Option<u16>,
        database_url: Option<String>,
    ) -> Result<watch::Receiver<Option<String>>, ControlError> {
        info!(service = %id, command = %plan.command, args = ?plan.args, port, "Starting service");

        let mut cmd = Command::new(&plan.command);
        cmd.args(&plan.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = plan.working_dir {
            cmd.current_dir(working_dir);
        }
        for (key, value) in &plan.env {
            cmd.env(key, value);
        }
        if let Some(port) = port {
            cmd.env("PORT", port.to_string());
            cmd.env("HOST", "127.0.0.1");
        }
        if let Some(url) = database_url {
            cmd.env("DATABASE_URL", url);
        }

        // Last moment before the child binds the port itself
        self.registry.hand_off(id);

        let mut child = cmd
            .spawn()
            .map_err(|source| ControlError::Spawn { service: id, source })?;
        let pid = child.id();
        info!(service = %id, pid, "Service process spawned");

        self.capture_output(id, &mut child).await;

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        self.with_generation(id, generation, |p| {
            p.pid = pid;
            p.kill_tx = Some(kill_tx);
            p.exit_rx = Some(exit_rx.clone());
        });

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let description = match status {
                Ok(status) => status.to_string(),
                Err(e) => format!("wait failed: {}", e),
            };
            let _ = exit_tx.send(Some(description.clone()));
            supervisor.on_exit(id, generation, description);
        });

        Ok(exit_rx)
    }

    /// Tee stdout and stderr into the service log file and the console
    async fn capture_output(&self, id: ServiceId, child: &mut Child) {
        let log_path = self.server.log_path(id);
        if let Err(e) = tokio::fs::create_dir_all(&self.server.log_dir).await {
            warn!(service = %id, dir = %self.server.log_dir, error = %e, "Cannot create log directory");
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await;
        let mut file = match file {
            Ok(f) => Some(f),
            Err(e) => {
                warn!(service = %id, path = %log_path.display(), error = %e, "Cannot open service log");
                None
            }
        };

        let (line_tx, mut line_rx) = mpsc::channel::<(&'static str, String)>(256);
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, "stdout", line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, "stderr", line_tx);
        }

        tokio::spawn(async move {
            while let Some((stream, line)) = line_rx.recv().await {
                info!(target: "service", service = %id, stream, "{}", line);
                if let Some(f) = file.as_mut() {
                    let mut bytes = line.into_bytes();
                    bytes.push(b'\n');
                    if let Err(e) = f.write_all(&bytes).await {
                        warn!(service = %id, error = %e, "Failed to write service log");
                        file = None;
                    }
                }
            }
        });
    }

    /// Poll until the service answers, exits, or the timeout elapses
    async fn wait_for_health(
        &self,
        id: ServiceId,
        port: Option<u16>,
        mut exit_rx: Option<watch::Receiver<Option<String>>>,
        timeout: Duration,
    ) -> Result<(), ControlError> {
        let slot = self.slot(id)?;
        let interval = slot.config.health_check_interval(&self.defaults);
        let probe_timeout = slot.config.probe_timeout(&self.defaults);
        let deadline = Instant::now() + timeout;

        debug!(service = %id, port, timeout_secs = timeout.as_secs(), "Waiting for service health");

        loop {
            if self.is_shutting_down() {
                return Err(ControlError::ShuttingDown);
            }

            if let Some(rx) = exit_rx.as_ref() {
                if let Some(status) = rx.borrow().clone() {
                    return Err(ControlError::UnexpectedExit { service: id, status });
                }
            }

            match slot.probe.check(port, probe_timeout).await {
                Ok(outcome) => {
                    debug!(service = %id, ?outcome, "Startup probe succeeded");
                    return Ok(());
                }
                Err(e) => debug!(service = %id, error = %e, "Startup probe failed"),
            }

            if Instant::now() >= deadline {
                return Err(ControlError::StartupTimeout { service: id, timeout });
            }

            let sleep = tokio::time::sleep(interval.min(deadline.saturating_duration_since(Instant::now())));
            match exit_rx.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        _ = sleep => {}
                        changed = rx.changed() => {
                            if changed.is_err() {
                                exit_rx = None;
                            }
                        }
                    }
                }
                None => sleep.await,
            }
        }
    }

    /// Exit handler for one spawned child
    fn on_exit(self: &Arc<Self>, id: ServiceId, generation: u64, status: String) {
        let decision = self.with_generation(id, generation, |p| {
            p.pid = None;
            p.kill_tx = None;

            if self.is_shutting_down()
                || matches!(p.state, ProcessState::Stopping | ProcessState::Stopped)
            {
                info!(service = %id, %status, "Service process exited");
                return None;
            }

            warn!(service = %id, %status, state = %p.state, "Service exited unexpectedly");
            if p.last_error.is_none() {
                p.last_error = Some(format!("exited: {}", status));
            }
            Some(self.apply_failure(id, p))
        });

        if let Some(Some(decision)) = decision {
            self.after_failure(id, generation, decision);
        }
    }

    /// Feed a failure to the breaker and move the state machine
    fn apply_failure(&self, id: ServiceId, process: &mut ManagedProcess) -> RestartDecision {
        let decision = process.breaker.record_failure(&self.policy, Instant::now());
        match decision {
            RestartDecision::Restart { delay, attempt } => {
                warn!(
                    service = %id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling service restart"
                );
                self.transition(id, process, ProcessState::Backoff);
            }
            RestartDecision::Open { failures } => {
                error!(
                    service = %id,
                    failures,
                    "Circuit breaker open, service will not be restarted automatically"
                );
                process.port = None;
                self.registry.release(id);
                self.transition(id, process, ProcessState::Failed);
            }
        }
        decision
    }

    fn after_failure(self: &Arc<Self>, id: ServiceId, generation: u64, decision: RestartDecision) {
        if let RestartDecision::Restart { delay, .. } = decision {
            self.schedule_restart(id, generation, delay);
        }
    }

    fn schedule_restart(self: &Arc<Self>, id: ServiceId, generation: u64, delay: Duration) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if supervisor.is_shutting_down() {
                return;
            }
            let Ok(slot) = supervisor.slot(id) else {
                return;
            };
            let _guard = slot.lifecycle.lock().await;

            let still_ours = supervisor
                .with_generation(id, generation, |p| {
                    if p.state != ProcessState::Backoff {
                        return false;
                    }
                    p.restart_count += 1;
                    p.last_restart_at = Some(Utc::now());
                    true
                })
                .unwrap_or(false);
            if !still_ours || supervisor.is_shutting_down() {
                debug!(service = %id, "Restart timer superseded");
                return;
            }

            match supervisor.spawn_and_confirm(id).await {
                Ok(()) => info!(service = %id, "Service restarted"),
                // The exit monitor already accounted for these
                Err(ControlError::StartupTimeout { .. }) | Err(ControlError::UnexpectedExit { .. }) => {}
                Err(ControlError::ShuttingDown) => {}
                Err(e) => {
                    warn!(service = %id, error = %e, "Restart attempt failed");
                    supervisor.record_attempt_failure(id, e.to_string());
                }
            }
        });
    }

    /// A restart attempt failed before any child existed
    fn record_attempt_failure(self: &Arc<Self>, id: ServiceId, reason: String) {
        let outcome = self.processes.get(&id).map(|entry| {
            let mut guard = entry.lock();
            guard.last_error = Some(reason);
            (self.apply_failure(id, &mut guard), guard.generation)
        });
        if let Some((decision, generation)) = outcome {
            self.after_failure(id, generation, decision);
        }
    }

    /// Reset the failure streak once the service stayed healthy long enough.
    ///
    /// The window restarts whenever the service turns unhealthy and recovers.
    fn spawn_stability_timer(self: &Arc<Self>, id: ServiceId, generation: u64) {
        let supervisor = Arc::clone(self);
        let window = self.policy.stability_window;
        tokio::spawn(async move {
            let mut wake_at = tokio::time::Instant::now() + window;
            loop {
                tokio::time::sleep_until(wake_at).await;
                let now = Instant::now();
                let next = supervisor.with_generation(id, generation, |p| {
                    match (p.state, p.healthy_since) {
                        (ProcessState::Healthy, Some(since)) if now.duration_since(since) >= window => {
                            if p.breaker.attempts() > 0 || p.restart_count > 0 {
                                info!(
                                    service = %id,
                                    stable_secs = window.as_secs(),
                                    restarts = p.restart_count,
                                    "Service stable, resetting restart counter"
                                );
                                p.breaker.record_stable();
                                p.restart_count = 0;
                            }
                            None
                        }
                        (ProcessState::Healthy, Some(since)) => Some(window - now.duration_since(since)),
                        (ProcessState::Unhealthy, _) => Some(window),
                        _ => None,
                    }
                });
                match next.flatten() {
                    Some(remaining) => {
                        debug!(service = %id, remaining_ms = remaining.as_millis() as u64, "Stability window re-armed");
                        wake_at = tokio::time::Instant::now() + remaining;
                    }
                    None => return,
                }
            }
        });
    }

    /// Re-probe a confirmed service forever, flipping healthy/unhealthy
    fn spawn_health_monitor(self: &Arc<Self>, id: ServiceId, generation: u64, port: Option<u16>) {
        let Ok(slot) = self.slot(id) else {
            return;
        };
        let interval = slot.config.monitor_interval(&self.defaults);
        let probe_timeout = slot.config.probe_timeout(&self.defaults);
        let probe = slot.probe.clone();
        let supervisor = Arc::clone(self);

        debug!(service = %id, interval_ms = interval.as_millis() as u64, "Starting health monitor");

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if supervisor.is_shutting_down() {
                    return;
                }
                let active = supervisor
                    .with_generation(id, generation, |p| {
                        matches!(p.state, ProcessState::Healthy | ProcessState::Unhealthy)
                    })
                    .unwrap_or(false);
                if !active {
                    debug!(service = %id, "Health monitor stopped");
                    return;
                }

                let result = probe.check(port, probe_timeout).await;
                supervisor.with_generation(id, generation, |p| match (&result, p.state) {
                    (Ok(_), ProcessState::Unhealthy) => {
                        p.last_error = None;
                        supervisor.transition(id, p, ProcessState::Healthy);
                    }
                    (Err(e), ProcessState::Healthy) => {
                        let failure = ControlError::ProbeFailure {
                            service: id,
                            reason: e.to_string(),
                        };
                        p.last_error = Some(failure.to_string());
                        supervisor.transition(id, p, ProcessState::Unhealthy);
                    }
                    _ => {}
                });
            }
        });
    }

    /// Stop a service: SIGTERM, grace period, SIGKILL.
    ///
    /// Always clears restart bookkeeping. Returns whether a process was running.
    pub async fn stop(self: &Arc<Self>, id: ServiceId) -> bool {
        let Some(slot) = self.slots.get(&id) else {
            return false;
        };
        let _guard = slot.lifecycle.lock().await;
        self.stop_locked(id).await
    }

    async fn stop_locked(&self, id: ServiceId) -> bool {
        let grace_period = self
            .slots
            .get(&id)
            .map(|s| s.config.shutdown_grace_period(&self.defaults))
            .unwrap_or_else(|| Duration::from_secs(self.defaults.shutdown_grace_period_secs));

        let taken = self.processes.get(&id).map(|entry| {
            let mut guard = entry.lock();
            self.transition(id, &mut guard, ProcessState::Stopping);
            (guard.pid, guard.kill_tx.take(), guard.exit_rx.take())
        });

        let Some((pid, kill_tx, exit_rx)) = taken else {
            self.registry.release(id);
            return false;
        };

        let was_running = pid.is_some();
        if let Some(pid) = pid {
            info!(service = %id, pid, "Sending SIGTERM to service");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }

        #[cfg(not(unix))]
        let kill_tx = {
            if let Some(kill) = kill_tx {
                let _ = kill.send(());
            }
            None::<oneshot::Sender<()>>
        };

        if let Some(mut rx) = exit_rx {
            match tokio::time::timeout(grace_period, wait_exit(&mut rx)).await {
                Ok(status) => info!(service = %id, status = %status, "Service process exited gracefully"),
                Err(_) => {
                    warn!(
                        service = %id,
                        grace_period_secs = grace_period.as_secs(),
                        "Grace period exceeded, sending SIGKILL"
                    );
                    if let Some(kill) = kill_tx {
                        let _ = kill.send(());
                    }
                    if tokio::time::timeout(KILL_REAP_TIMEOUT, wait_exit(&mut rx)).await.is_err() {
                        error!(service = %id, "Service process did not exit after SIGKILL");
                    }
                }
            }
        }

        self.registry.release(id);
        if let Some((_, process)) = self.processes.remove(&id) {
            let mut process = process.into_inner();
            self.transition(id, &mut process, ProcessState::Stopped);
        }
        was_running
    }

    /// Stop every service in reverse boot order
    pub async fn stop_all(self: &Arc<Self>) {
        for id in ServiceId::ALL.into_iter().rev() {
            if self.processes.contains_key(&id) {
                self.stop(id).await;
            }
        }
    }

    pub fn status_of(&self, id: ServiceId) -> Option<ServiceStatus> {
        let slot = self.slots.get(&id)?;
        let status = match self.processes.get(&id) {
            Some(entry) => {
                let p = entry.lock();
                ServiceStatus {
                    service: id,
                    state: p.state,
                    healthy: p.state == ProcessState::Healthy,
                    enabled: slot.config.enabled,
                    lazy: slot.config.lazy,
                    critical: slot.config.critical,
                    pid: p.pid,
                    port: p.port,
                    restart_count: p.restart_count,
                    consecutive_failures: p.breaker.attempts(),
                    breaker_open: p.breaker.is_open(),
                    last_restart_at: p.last_restart_at,
                    started_at: p.started_at,
                    last_error: p.last_error.clone(),
                }
            }
            None => ServiceStatus {
                service: id,
                state: ProcessState::Stopped,
                healthy: false,
                enabled: slot.config.enabled,
                lazy: slot.config.lazy,
                critical: slot.config.critical,
                pid: None,
                port: None,
                restart_count: 0,
                consecutive_failures: 0,
                breaker_open: false,
                last_restart_at: None,
                started_at: None,
                last_error: None,
            },
        };
        Some(status)
    }

    /// Status of every configured service
    pub fn status(&self) -> BTreeMap<ServiceId, ServiceStatus> {
        ServiceId::ALL
            .into_iter()
            .filter_map(|id| self.status_of(id).map(|s| (id, s)))
            .collect()
    }
}

async fn wait_exit(rx: &mut watch::Receiver<Option<String>>) -> String {
    loop {
        if let Some(status) = rx.borrow_and_update().clone() {
            return status;
        }
        if rx.changed().await.is_err() {
            return "unknown".to_string();
        }
    }
}

/// Send complete output lines of a child pipe to `tx`.
///
/// Bytes are decoded lossily. The pipe is drained until EOF whatever happens,
/// so the child never writes into a closed pipe.
fn forward_lines<R>(reader: R, stream: &'static str, tx: mpsc::Sender<(&'static str, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => return,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send((stream, line)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(stream, error = %e, "Failed to read service output");
                    break;
                }
            }
        }
        if let Err(e) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
            debug!(stream, error = %e, "Service output pipe closed");
        }
    });
}
