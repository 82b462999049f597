use crate::registry::{ServiceDescriptor, ServiceRegistry};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Lifecycle status of a supervised service
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// No process, and none scheduled
    Stopped,
    /// Process spawned, waiting for the first successful probe
    Starting,
    /// Process is accepting connections
    Healthy,
    /// Process is running but probes keep failing
    Unhealthy,
    /// Process exited unexpectedly. A restart may be pending; see `gave_up`.
    Crashed,
}

impl ServiceStatus {
    /// A process exists for this status
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Starting | ServiceStatus::Healthy | ServiceStatus::Unhealthy
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Crashed => "crashed",
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exponential restart backoff with a ceiling on the number of restarts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Delay before the first restart
    pub base: Duration,
    /// Upper bound on any delay
    pub max: Duration,
    /// Crashes tolerated before giving up
    pub max_restarts: u32,
}

impl RestartPolicy {
    /// Delay before the restart that follows crash number `restart_count`
    /// (1-based): `base * 2^(restart_count - 1)`, capped at `max`.
    pub fn delay_for(&self, restart_count: u32) -> Duration {
        let exponent = restart_count.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    /// Whether another restart is allowed after `restart_count` crashes
    pub fn allows(&self, restart_count: u32) -> bool {
        restart_count <= self.max_restarts
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unknown service '{0}'")]
    UnknownService(String),
    #[error("failed to spawn service '{name}': {source}")]
    ProcessSpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Mutable per-service state. Owned by the supervisor; the health prober
/// writes to it only through [`Supervisor::record_probe`].
#[derive(Debug)]
struct ServiceProcessState {
    status: ServiceStatus,
    pid: Option<u32>,
    restart_count: u32,
    last_health_check: Option<DateTime<Utc>>,
    last_exit_code: Option<i32>,
    consecutive_successes: u32,
    consecutive_failures: u32,
    /// Bumped on every spawn and every stop; stale probes, startup
    /// watchdogs and scheduled restarts compare against it.
    generation: u64,
    started_at: Option<Instant>,
    next_restart_at: Option<Instant>,
    gave_up: bool,
}

impl Default for ServiceProcessState {
    fn default() -> Self {
        Self {
            status: ServiceStatus::Stopped,
            pid: None,
            restart_count: 0,
            last_health_check: None,
            last_exit_code: None,
            consecutive_successes: 0,
            consecutive_failures: 0,
            generation: 0,
            started_at: None,
            next_restart_at: None,
            gave_up: false,
        }
    }
}

/// Handle to the monitor task owning a child process
struct RunningProcess {
    stop_tx: oneshot::Sender<()>,
    monitor: JoinHandle<Option<i32>>,
}

struct ServiceSlot {
    descriptor: Arc<ServiceDescriptor>,
    state: Mutex<ServiceProcessState>,
    status_tx: watch::Sender<ServiceStatus>,
    /// Serializes start/stop/restart for this service
    lifecycle: tokio::sync::Mutex<Option<RunningProcess>>,
}

impl ServiceSlot {
    fn publish(&self, status: ServiceStatus) {
        self.status_tx.send_replace(status);
    }
}

/// Read-only view of a service for the router and the operator surface
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceSnapshot {
    pub name: String,
    pub port: u16,
    pub status: ServiceStatus,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_exit_code: Option<i32>,
    pub gave_up: bool,
    pub next_restart_in_ms: Option<u64>,
    pub uptime_secs: Option<u64>,
}

/// What the health prober needs to know before probing
#[derive(Debug, Clone, Copy)]
pub struct ProbeTarget {
    pub generation: u64,
    pub status: ServiceStatus,
}

/// Owns one OS process per registered service.
///
/// Like the rest of the gateway, the supervisor lives behind an `Arc`;
/// [`new`](Supervisor::new) returns `Arc<Self>` because monitor tasks and
/// scheduled restarts hold a reference to it.
pub struct Supervisor {
    registry: Arc<ServiceRegistry>,
    slots: HashMap<String, Arc<ServiceSlot>>,
}

impl Supervisor {
    pub fn new(registry: Arc<ServiceRegistry>) -> Arc<Self> {
        let slots = registry
            .all()
            .map(|descriptor| {
                let (status_tx, _) = watch::channel(ServiceStatus::Stopped);
                let slot = ServiceSlot {
                    descriptor: Arc::clone(descriptor),
                    state: Mutex::new(ServiceProcessState::default()),
                    status_tx,
                    lifecycle: tokio::sync::Mutex::new(None),
                };
                (descriptor.name.clone(), Arc::new(slot))
            })
            .collect();

        Arc::new(Self { registry, slots })
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    fn slot(&self, name: &str) -> Result<&Arc<ServiceSlot>, SupervisorError> {
        self.slots
            .get(name)
            .ok_or_else(|| SupervisorError::UnknownService(name.to_string()))
    }

    /// Current status; Stopped for unknown services
    pub fn status(&self, name: &str) -> ServiceStatus {
        self.slots
            .get(name)
            .map(|slot| slot.state.lock().status)
            .unwrap_or(ServiceStatus::Stopped)
    }

    /// Receiver notified on every status change
    pub fn subscribe(&self, name: &str) -> Option<watch::Receiver<ServiceStatus>> {
        self.slots.get(name).map(|slot| slot.status_tx.subscribe())
    }

    /// Wait until the service reaches `target`. Returns false on timeout.
    pub async fn wait_for_status(
        &self,
        name: &str,
        target: ServiceStatus,
        timeout: Duration,
    ) -> bool {
        let Some(mut rx) = self.subscribe(name) else {
            return false;
        };

        tokio::time::timeout(timeout, async {
            loop {
                if *rx.borrow_and_update() == target {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await
        .unwrap_or(false)
    }

    pub fn snapshot(&self, name: &str) -> Option<ServiceSnapshot> {
        self.slots.get(name).map(|slot| Self::snapshot_of(slot))
    }

    /// Snapshots for every service, in registry order
    pub fn snapshots(&self) -> Vec<ServiceSnapshot> {
        self.registry
            .all()
            .filter_map(|descriptor| self.snapshot(&descriptor.name))
            .collect()
    }

    fn snapshot_of(slot: &ServiceSlot) -> ServiceSnapshot {
        let state = slot.state.lock();
        let now = Instant::now();
        ServiceSnapshot {
            name: slot.descriptor.name.clone(),
            port: slot.descriptor.port,
            status: state.status,
            pid: state.pid,
            restart_count: state.restart_count,
            last_health_check: state.last_health_check,
            last_exit_code: state.last_exit_code,
            gave_up: state.gave_up,
            next_restart_in_ms: state
                .next_restart_at
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
            uptime_secs: state.started_at.map(|at| at.elapsed().as_secs()),
        }
    }

    pub fn probe_target(&self, name: &str) -> Option<ProbeTarget> {
        self.slots.get(name).map(|slot| {
            let state = slot.state.lock();
            ProbeTarget {
                generation: state.generation,
                status: state.status,
            }
        })
    }

    /// Record the outcome of a health probe.
    ///
    /// Only touches the status, the probe counters and the last check time.
    /// Results for an older generation of the process are ignored. Returns
    /// the new status when this probe caused a transition.
    pub fn record_probe(&self, name: &str, generation: u64, success: bool) -> Option<ServiceStatus> {
        let slot = self.slots.get(name)?;
        let mut state = slot.state.lock();

        if state.generation != generation || !state.status.is_running() {
            return None;
        }

        state.last_health_check = Some(Utc::now());
        let policy = &slot.descriptor.policy;
        let previous = state.status;

        if success {
            state.consecutive_successes += 1;
            state.consecutive_failures = 0;
            if matches!(previous, ServiceStatus::Starting | ServiceStatus::Unhealthy)
                && state.consecutive_successes >= policy.healthy_threshold
            {
                state.status = ServiceStatus::Healthy;
            }
        } else {
            state.consecutive_failures += 1;
            state.consecutive_successes = 0;
            if previous == ServiceStatus::Healthy
                && state.consecutive_failures >= policy.unhealthy_threshold
            {
                state.status = ServiceStatus::Unhealthy;
            }
        }

        if state.status == previous {
            return None;
        }

        match state.status {
            ServiceStatus::Healthy if previous == ServiceStatus::Unhealthy => {
                info!(service = name, "Service recovered and is healthy again");
            }
            ServiceStatus::Healthy => {
                let startup_ms = state
                    .started_at
                    .map(|at| at.elapsed().as_millis() as u64)
                    .unwrap_or(0);
                info!(service = name, startup_ms, "Service is healthy");
            }
            ServiceStatus::Unhealthy => {
                warn!(
                    service = name,
                    failures = state.consecutive_failures,
                    "Service marked unhealthy after consecutive probe failures"
                );
            }
            _ => {}
        }

        let status = state.status;
        drop(state);
        slot.publish(status);
        Some(status)
    }

    /// Start a service. No-op when it already has a running process.
    ///
    /// An operator start of a service that exhausted its restarts resets
    /// the restart budget.
    pub async fn start(self: &Arc<Self>, name: &str) -> Result<ServiceSnapshot, SupervisorError> {
        let slot = Arc::clone(self.slot(name)?);
        let mut running = slot.lifecycle.lock().await;

        {
            let mut state = slot.state.lock();
            if state.status.is_running() {
                debug!(service = name, "Service already running");
                drop(state);
                return Ok(Self::snapshot_of(&slot));
            }
            if state.gave_up {
                info!(service = name, "Resetting restart budget on operator start");
                state.gave_up = false;
                state.restart_count = 0;
            }
        }

        self.spawn_locked(&slot, &mut running).await?;
        drop(running);
        Ok(Self::snapshot_of(&slot))
    }

    /// Start every registered service; failures are contained per service
    pub async fn start_all(self: &Arc<Self>) {
        for descriptor in self.registry.all() {
            if let Err(e) = self.start(&descriptor.name).await {
                error!(service = %descriptor.name, error = %e, "Failed to start service");
            }
        }
    }

    /// Stop a service: cancel pending restarts, SIGTERM, wait for the grace
    /// period, then SIGKILL.
    pub async fn stop(&self, name: &str) -> Result<ServiceSnapshot, SupervisorError> {
        let slot = Arc::clone(self.slot(name)?);
        let mut running = slot.lifecycle.lock().await;
        self.stop_locked(&slot, &mut running).await;
        drop(running);
        Ok(Self::snapshot_of(&slot))
    }

    /// Stop then start, without letting another operation in between
    pub async fn restart(self: &Arc<Self>, name: &str) -> Result<ServiceSnapshot, SupervisorError> {
        let slot = Arc::clone(self.slot(name)?);
        let mut running = slot.lifecycle.lock().await;
        self.stop_locked(&slot, &mut running).await;
        {
            let mut state = slot.state.lock();
            state.gave_up = false;
            state.restart_count = 0;
        }
        self.spawn_locked(&slot, &mut running).await?;
        drop(running);
        Ok(Self::snapshot_of(&slot))
    }

    /// Stop every service concurrently
    pub async fn stop_all(self: &Arc<Self>) {
        let mut tasks = JoinSet::new();
        for name in self.slots.keys() {
            let supervisor = Arc::clone(self);
            let name = name.clone();
            tasks.spawn(async move {
                let _ = supervisor.stop(&name).await;
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    async fn stop_locked(&self, slot: &ServiceSlot, running: &mut Option<RunningProcess>) {
        let name = slot.descriptor.name.as_str();
        {
            let mut state = slot.state.lock();
            state.generation += 1;
            state.next_restart_at = None;
        }

        let mut exit_code = None;
        if let Some(process) = running.take() {
            let _ = process.stop_tx.send(());
            match process.monitor.await {
                Ok(code) => exit_code = code,
                Err(e) => warn!(service = name, error = %e, "Monitor task failed"),
            }
        }

        {
            let mut state = slot.state.lock();
            if state.status != ServiceStatus::Stopped {
                info!(service = name, "Service stopped");
            }
            state.status = ServiceStatus::Stopped;
            state.pid = None;
            state.started_at = None;
            state.consecutive_failures = 0;
            state.consecutive_successes = 0;
            if exit_code.is_some() {
                state.last_exit_code = exit_code;
            }
        }
        slot.publish(ServiceStatus::Stopped);
    }

    /// Spawn the child process. Caller holds the lifecycle lock.
    async fn spawn_locked(
        self: &Arc<Self>,
        slot: &Arc<ServiceSlot>,
        running: &mut Option<RunningProcess>,
    ) -> Result<(), SupervisorError> {
        let descriptor = &slot.descriptor;
        let name = descriptor.name.as_str();

        // A crashed process's monitor has already returned or is about to
        if let Some(previous) = running.take() {
            let _ = previous.monitor.await;
        }

        let spec = &descriptor.command;
        info!(service = name, program = %spec.program, port = descriptor.port, "Starting service");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = spec.working_dir {
            cmd.current_dir(working_dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd.env("PORT", descriptor.port.to_string());

        // Own process group so signals reach the whole tree (npm, node, ...)
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                error!(service = name, error = %source, "Failed to spawn service process");
                let generation = {
                    let mut state = slot.state.lock();
                    state.generation += 1;
                    state.generation
                };
                self.record_crash(slot, generation, None);
                return Err(SupervisorError::ProcessSpawnFailed {
                    name: name.to_string(),
                    source,
                });
            }
        };

        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            forward_output(name.to_string(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(name.to_string(), "stderr", stderr);
        }

        let generation = {
            let mut state = slot.state.lock();
            state.generation += 1;
            state.status = ServiceStatus::Starting;
            state.pid = pid;
            state.started_at = Some(Instant::now());
            state.next_restart_at = None;
            state.consecutive_failures = 0;
            state.consecutive_successes = 0;
            state.generation
        };
        slot.publish(ServiceStatus::Starting);
        info!(service = name, pid, generation, "Service process spawned");

        let (stop_tx, stop_rx) = oneshot::channel();
        let monitor = tokio::spawn(Arc::clone(self).monitor(
            Arc::clone(slot),
            generation,
            child,
            stop_rx,
        ));
        *running = Some(RunningProcess { stop_tx, monitor });

        // Startup watchdog
        let supervisor = Arc::clone(self);
        let watched = Arc::clone(slot);
        let startup_timeout = descriptor.policy.startup_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(startup_timeout).await;
            supervisor.fail_startup(&watched, generation).await;
        });

        Ok(())
    }

    /// Owns the child until it exits or a stop is requested. Returns the
    /// exit code when known.
    async fn monitor(
        self: Arc<Self>,
        slot: Arc<ServiceSlot>,
        generation: u64,
        mut child: Child,
        mut stop_rx: oneshot::Receiver<()>,
    ) -> Option<i32> {
        let name = slot.descriptor.name.clone();
        tokio::select! {
            status = child.wait() => {
                let code = match status {
                    Ok(status) => status.code(),
                    Err(e) => {
                        warn!(service = %name, error = %e, "Error waiting for service process");
                        None
                    }
                };
                self.record_crash(&slot, generation, code);
                code
            }
            _ = &mut stop_rx => {
                terminate(&name, &mut child, slot.descriptor.policy.shutdown_grace_period).await
            }
        }
    }

    /// Kill a service that stayed in Starting past its startup timeout and
    /// treat it as a crash.
    async fn fail_startup(self: &Arc<Self>, slot: &Arc<ServiceSlot>, generation: u64) {
        let mut running = slot.lifecycle.lock().await;
        if !Self::still_starting(slot, generation) {
            return;
        }

        let name = slot.descriptor.name.as_str();
        error!(
            service = name,
            timeout_secs = slot.descriptor.policy.startup_timeout.as_secs_f64(),
            "Service startup timeout exceeded"
        );

        let mut exit_code = None;
        if let Some(process) = running.take() {
            let _ = process.stop_tx.send(());
            exit_code = process.monitor.await.ok().flatten();
        }
        self.record_startup_crash(slot, generation, exit_code);
    }

    fn still_starting(slot: &ServiceSlot, generation: u64) -> bool {
        let state = slot.state.lock();
        state.generation == generation && state.status == ServiceStatus::Starting
    }

    /// Count a startup timeout as a crash, unless the child exited on its
    /// own while being stopped and its monitor already counted it.
    fn record_startup_crash(
        self: &Arc<Self>,
        slot: &Arc<ServiceSlot>,
        generation: u64,
        exit_code: Option<i32>,
    ) {
        if !Self::still_starting(slot, generation) {
            debug!(service = %slot.descriptor.name, "Crash already recorded by the monitor");
            return;
        }
        self.record_crash(slot, generation, exit_code);
    }

    /// Count a crash and schedule the next restart, or give up
    fn record_crash(self: &Arc<Self>, slot: &Arc<ServiceSlot>, generation: u64, exit_code: Option<i32>) {
        let name = slot.descriptor.name.as_str();
        let policy = &slot.descriptor.policy.restart;

        let mut state = slot.state.lock();
        if state.generation != generation {
            // Stopped or restarted while exiting
            return;
        }

        state.status = ServiceStatus::Crashed;
        state.pid = None;
        state.started_at = None;
        state.last_exit_code = exit_code;
        state.restart_count += 1;
        state.consecutive_failures = 0;
        state.consecutive_successes = 0;
        let restart_count = state.restart_count;

        if policy.allows(restart_count) {
            let delay = policy.delay_for(restart_count);
            state.next_restart_at = Some(Instant::now() + delay);
            drop(state);

            warn!(
                service = name,
                exit_code,
                restart_count,
                backoff_ms = delay.as_millis() as u64,
                "Service crashed, restart scheduled"
            );

            let supervisor = Arc::clone(self);
            let slot_for_restart = Arc::clone(slot);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                supervisor
                    .restart_after_crash(&slot_for_restart, generation)
                    .await;
            });
        } else {
            state.next_restart_at = None;
            state.gave_up = true;
            drop(state);

            error!(
                service = name,
                exit_code,
                restart_count,
                max_restarts = policy.max_restarts,
                "Service crashed too many times, giving up"
            );
        }

        slot.publish(ServiceStatus::Crashed);
    }

    async fn restart_after_crash(self: &Arc<Self>, slot: &Arc<ServiceSlot>, generation: u64) {
        let mut running = slot.lifecycle.lock().await;
        {
            let state = slot.state.lock();
            if state.generation != generation
                || state.status != ServiceStatus::Crashed
                || state.gave_up
            {
                return;
            }
        }

        info!(service = %slot.descriptor.name, "Restarting crashed service");
        if let Err(e) = self.spawn_locked(slot, &mut running).await {
            // Already counted as another crash by spawn_locked
            debug!(service = %slot.descriptor.name, error = %e, "Restart attempt failed");
        }
    }
}

/// Re-emit each line a child writes as a structured event
fn forward_output<R>(service: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if stream == "stderr" {
                warn!(service = %service, stream, line = %line, "service output");
            } else {
                info!(service = %service, stream, line = %line, "service output");
            }
        }
    });
}

/// SIGTERM the process group, wait for the grace period, then SIGKILL
async fn terminate(name: &str, child: &mut Child, grace_period: Duration) -> Option<i32> {
    let pid = child.id();
    if let Some(pid) = pid {
        info!(service = name, pid, "Sending SIGTERM to service");

        #[cfg(unix)]
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(service = name, ?status, "Service process exited gracefully");
            status.code()
        }
        Ok(Err(e)) => {
            warn!(service = name, error = %e, "Error waiting for service to exit");
            None
        }
        Err(_) => {
            warn!(
                service = name,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            #[cfg(unix)]
            if let Some(pid) = pid {
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGKILL);
                }
            }
            let _ = child.kill().await;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CommandSpec, ServicePolicy};

    fn command(program: &str, args: &[&str]) -> CommandSpec {
        CommandSpec {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            working_dir: None,
            env: HashMap::new(),
        }
    }

    fn fast_policy() -> ServicePolicy {
        ServicePolicy {
            startup_timeout: Duration::from_secs(30),
            shutdown_grace_period: Duration::from_secs(1),
            restart: RestartPolicy {
                base: Duration::from_millis(50),
                max: Duration::from_millis(400),
                max_restarts: 2,
            },
            ..ServicePolicy::default()
        }
    }

    fn supervisor_with(services: Vec<ServiceDescriptor>) -> Arc<Supervisor> {
        let mut registry = ServiceRegistry::new();
        for descriptor in services {
            registry.register(descriptor).unwrap();
        }
        Supervisor::new(Arc::new(registry))
    }

    fn sleeper(name: &str, port: u16) -> ServiceDescriptor {
        ServiceDescriptor::new(name, port, command("sleep", &["60"])).with_policy(fast_policy())
    }

    async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        condition()
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = RestartPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(10),
            max_restarts: 10,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for(64), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_is_non_decreasing() {
        let policy = RestartPolicy {
            base: Duration::from_millis(300),
            max: Duration::from_secs(45),
            max_restarts: 100,
        };
        let delays: Vec<_> = (1..=100).map(|n| policy.delay_for(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_restart_ceiling() {
        let policy = RestartPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(1),
            max_restarts: 2,
        };
        assert!(policy.allows(1));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
    }

    #[test]
    fn test_initial_state_is_stopped() {
        let supervisor = supervisor_with(vec![sleeper("scanner", 5006)]);
        assert_eq!(supervisor.status("scanner"), ServiceStatus::Stopped);
        assert_eq!(supervisor.status("unknown"), ServiceStatus::Stopped);

        let snapshot = supervisor.snapshot("scanner").unwrap();
        assert_eq!(snapshot.port, 5006);
        assert_eq!(snapshot.restart_count, 0);
        assert!(snapshot.pid.is_none());
        assert!(supervisor.snapshot("unknown").is_none());
    }

    #[tokio::test]
    async fn test_start_unknown_service() {
        let supervisor = supervisor_with(vec![]);
        let err = supervisor.start("ghost").await.unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownService(_)));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let supervisor = supervisor_with(vec![sleeper("scanner", 5006)]);

        let snapshot = supervisor.start("scanner").await.unwrap();
        assert_eq!(snapshot.status, ServiceStatus::Starting);
        assert!(snapshot.pid.is_some());

        // Second start is a no-op on the same process
        let again = supervisor.start("scanner").await.unwrap();
        assert_eq!(again.pid, snapshot.pid);

        let stopped = supervisor.stop("scanner").await.unwrap();
        assert_eq!(stopped.status, ServiceStatus::Stopped);
        assert!(stopped.pid.is_none());
        assert_eq!(stopped.restart_count, 0);
    }

    #[tokio::test]
    async fn test_stop_all_is_independent_per_service() {
        let supervisor = supervisor_with(vec![sleeper("a", 5101), sleeper("b", 5102)]);
        supervisor.start_all().await;
        assert_eq!(supervisor.status("a"), ServiceStatus::Starting);
        assert_eq!(supervisor.status("b"), ServiceStatus::Starting);

        supervisor.stop("a").await.unwrap();
        assert_eq!(supervisor.status("a"), ServiceStatus::Stopped);
        assert_eq!(supervisor.status("b"), ServiceStatus::Starting);

        supervisor.stop_all().await;
        assert_eq!(supervisor.status("b"), ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_probe_transitions() {
        let mut descriptor = sleeper("scanner", 5006);
        descriptor.policy.healthy_threshold = 2;
        descriptor.policy.unhealthy_threshold = 3;
        let supervisor = supervisor_with(vec![descriptor]);
        supervisor.start("scanner").await.unwrap();

        let target = supervisor.probe_target("scanner").unwrap();
        assert_eq!(target.status, ServiceStatus::Starting);

        // One success is not enough with a threshold of two
        assert_eq!(supervisor.record_probe("scanner", target.generation, true), None);
        assert_eq!(supervisor.status("scanner"), ServiceStatus::Starting);
        assert_eq!(
            supervisor.record_probe("scanner", target.generation, true),
            Some(ServiceStatus::Healthy)
        );
        assert!(supervisor.snapshot("scanner").unwrap().last_health_check.is_some());

        // Transient blips do not flip the status
        supervisor.record_probe("scanner", target.generation, false);
        supervisor.record_probe("scanner", target.generation, false);
        assert_eq!(supervisor.status("scanner"), ServiceStatus::Healthy);
        assert_eq!(
            supervisor.record_probe("scanner", target.generation, false),
            Some(ServiceStatus::Unhealthy)
        );

        supervisor.record_probe("scanner", target.generation, true);
        assert_eq!(
            supervisor.record_probe("scanner", target.generation, true),
            Some(ServiceStatus::Healthy)
        );

        supervisor.stop("scanner").await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_probe_is_ignored() {
        let supervisor = supervisor_with(vec![sleeper("scanner", 5006)]);
        supervisor.start("scanner").await.unwrap();
        let old = supervisor.probe_target("scanner").unwrap().generation;

        supervisor.restart("scanner").await.unwrap();
        assert_eq!(supervisor.record_probe("scanner", old, true), None);
        assert_eq!(supervisor.status("scanner"), ServiceStatus::Starting);

        supervisor.stop("scanner").await.unwrap();
        let current = supervisor.probe_target("scanner").unwrap().generation;
        assert_eq!(supervisor.record_probe("scanner", current, true), None);
        assert_eq!(supervisor.status("scanner"), ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_crash_restarts_then_gives_up() {
        let descriptor = ServiceDescriptor::new("flaky", 5201, command("sh", &["-c", "exit 1"]))
            .with_policy(fast_policy());
        let supervisor = supervisor_with(vec![descriptor]);
        supervisor.start("flaky").await.unwrap();

        let gave_up = wait_until(Duration::from_secs(5), || {
            supervisor.snapshot("flaky").unwrap().gave_up
        })
        .await;
        assert!(gave_up, "service never gave up");

        let snapshot = supervisor.snapshot("flaky").unwrap();
        assert_eq!(snapshot.status, ServiceStatus::Crashed);
        // Two restarts allowed, the third crash is final
        assert_eq!(snapshot.restart_count, 3);
        assert_eq!(snapshot.last_exit_code, Some(1));
        assert!(snapshot.next_restart_in_ms.is_none());
    }

    #[tokio::test]
    async fn test_crash_schedules_backoff() {
        let mut descriptor =
            ServiceDescriptor::new("scanner", 5202, command("sh", &["-c", "exit 1"]));
        descriptor.policy.restart = RestartPolicy {
            base: Duration::from_secs(10),
            max: Duration::from_secs(60),
            max_restarts: 5,
        };
        let supervisor = supervisor_with(vec![descriptor]);
        supervisor.start("scanner").await.unwrap();

        assert!(
            supervisor
                .wait_for_status("scanner", ServiceStatus::Crashed, Duration::from_secs(5))
                .await
        );
        let snapshot = supervisor.snapshot("scanner").unwrap();
        assert_eq!(snapshot.restart_count, 1);
        assert!(!snapshot.gave_up);
        let pending = snapshot.next_restart_in_ms.unwrap();
        assert!(pending > 5_000 && pending <= 10_000);

        // Stopping cancels the pending restart
        supervisor.stop("scanner").await.unwrap();
        let snapshot = supervisor.snapshot("scanner").unwrap();
        assert_eq!(snapshot.status, ServiceStatus::Stopped);
        assert!(snapshot.next_restart_in_ms.is_none());
        assert_eq!(snapshot.restart_count, 1);
    }

    #[tokio::test]
    async fn test_backoff_doubles_between_crashes() {
        let mut descriptor =
            ServiceDescriptor::new("scanner", 5206, command("sh", &["-c", "exit 1"]));
        descriptor.policy.restart = RestartPolicy {
            base: Duration::from_millis(300),
            max: Duration::from_secs(10),
            max_restarts: 5,
        };
        let supervisor = supervisor_with(vec![descriptor]);
        supervisor.start("scanner").await.unwrap();

        let second_crash = wait_until(Duration::from_secs(5), || {
            supervisor.snapshot("scanner").unwrap().restart_count == 2
        })
        .await;
        assert!(second_crash, "service never crashed twice");

        // Second delay is twice the base
        let pending = supervisor.snapshot("scanner").unwrap().next_restart_in_ms.unwrap();
        assert!(pending > 400 && pending <= 600, "pending {}ms", pending);

        supervisor.stop("scanner").await.unwrap();
    }

    #[tokio::test]
    async fn test_startup_timeout_does_not_double_count_exit() {
        let mut descriptor = sleeper("racy", 5207);
        descriptor.policy.restart.max_restarts = 0;
        let supervisor = supervisor_with(vec![descriptor]);
        supervisor.start("racy").await.unwrap();

        let slot = Arc::clone(supervisor.slot("racy").unwrap());
        let generation = supervisor.probe_target("racy").unwrap().generation;

        // The child exits on its own just as the startup watchdog stops it
        supervisor.record_crash(&slot, generation, Some(1));
        supervisor.record_startup_crash(&slot, generation, None);

        let snapshot = supervisor.snapshot("racy").unwrap();
        assert_eq!(snapshot.status, ServiceStatus::Crashed);
        assert_eq!(snapshot.restart_count, 1);
        assert_eq!(snapshot.last_exit_code, Some(1));
        assert!(snapshot.gave_up);

        supervisor.stop("racy").await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_counts_as_crash() {
        let mut descriptor = ServiceDescriptor::new(
            "missing",
            5203,
            command("/nonexistent/portgate-test-binary", &[]),
        );
        descriptor.policy.restart.max_restarts = 0;
        let supervisor = supervisor_with(vec![descriptor]);

        let err = supervisor.start("missing").await.unwrap_err();
        assert!(matches!(err, SupervisorError::ProcessSpawnFailed { .. }));

        let snapshot = supervisor.snapshot("missing").unwrap();
        assert_eq!(snapshot.status, ServiceStatus::Crashed);
        assert_eq!(snapshot.restart_count, 1);
        assert!(snapshot.gave_up);
    }

    #[tokio::test]
    async fn test_startup_timeout_is_a_crash() {
        let mut descriptor = sleeper("slow", 5204);
        descriptor.policy.startup_timeout = Duration::from_millis(200);
        descriptor.policy.restart.max_restarts = 0;
        let supervisor = supervisor_with(vec![descriptor]);
        supervisor.start("slow").await.unwrap();

        let gave_up = wait_until(Duration::from_secs(5), || {
            supervisor.snapshot("slow").unwrap().gave_up
        })
        .await;
        assert!(gave_up);
        assert_eq!(supervisor.status("slow"), ServiceStatus::Crashed);
        assert_eq!(supervisor.snapshot("slow").unwrap().restart_count, 1);
    }

    #[tokio::test]
    async fn test_operator_start_resets_budget() {
        let mut descriptor =
            ServiceDescriptor::new("flaky", 5205, command("sh", &["-c", "exit 3"]));
        descriptor.policy.restart.max_restarts = 0;
        let supervisor = supervisor_with(vec![descriptor]);

        supervisor.start("flaky").await.unwrap();
        assert!(
            wait_until(Duration::from_secs(5), || supervisor
                .snapshot("flaky")
                .unwrap()
                .gave_up)
            .await
        );
        assert_eq!(supervisor.snapshot("flaky").unwrap().last_exit_code, Some(3));

        supervisor.start("flaky").await.unwrap();
        assert!(
            wait_until(Duration::from_secs(5), || supervisor
                .snapshot("flaky")
                .unwrap()
                .gave_up)
            .await
        );
        assert_eq!(supervisor.snapshot("flaky").unwrap().restart_count, 1);
    }
}
