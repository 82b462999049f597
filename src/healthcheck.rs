//! Health prober for supervised services
//!
//! Runs one probe loop per registered service. Each loop checks that the
//! service's port accepts connections (or that its liveness path answers
//! 2xx) and reports the result to the supervisor, which owns the status.

use crate::registry::ServiceDescriptor;
use crate::supervisor::{ServiceStatus, Supervisor};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// How a service is probed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// Port accepts a TCP connection
    Tcp { port: u16 },
    /// GET on a liveness path returns 2xx
    Http { port: u16, path: String },
}

impl Probe {
    pub fn for_service(descriptor: &ServiceDescriptor) -> Self {
        match &descriptor.policy.health_path {
            Some(path) => Probe::Http {
                port: descriptor.port,
                path: path.clone(),
            },
            None => Probe::Tcp {
                port: descriptor.port,
            },
        }
    }

    /// Run the probe within `timeout`. Failures are a `false`, never an error.
    pub async fn check(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.run()).await {
            Ok(healthy) => healthy,
            Err(_) => {
                debug!(probe = ?self, "Probe timed out");
                false
            }
        }
    }

    async fn run(&self) -> bool {
        match self {
            Probe::Tcp { port } => match TcpStream::connect(("127.0.0.1", *port)).await {
                Ok(_stream) => true,
                Err(e) => {
                    debug!(port, error = %e, "Probe failed (connection error)");
                    false
                }
            },
            Probe::Http { port, path } => check_http(*port, path).await,
        }
    }
}

async fn check_http(port: u16, path: &str) -> bool {
    let mut stream = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(s) => s,
        Err(e) => {
            debug!(port, error = %e, "Probe failed (connection error)");
            return false;
        }
    };

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
        path, port
    );
    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }

    // Format: "HTTP/1.1 200 OK\r\n"
    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    if reader.read_line(&mut status_line).await.is_err() {
        return false;
    }

    status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .map(|code| (200..300).contains(&code))
        .unwrap_or(false)
}

/// Probes every registered service until shutdown
pub struct HealthProber {
    supervisor: Arc<Supervisor>,
    shutdown_rx: watch::Receiver<bool>,
}

impl HealthProber {
    pub fn new(supervisor: Arc<Supervisor>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            supervisor,
            shutdown_rx,
        }
    }

    /// Run one independent probe loop per service
    pub async fn run(self) {
        info!(
            services = self.supervisor.registry().len(),
            "Health prober started"
        );

        let mut loops = JoinSet::new();
        for descriptor in self.supervisor.registry().all() {
            loops.spawn(probe_loop(
                Arc::clone(&self.supervisor),
                Arc::clone(descriptor),
                self.shutdown_rx.clone(),
            ));
        }
        while loops.join_next().await.is_some() {}

        info!("Health prober shutting down");
    }
}

async fn probe_loop(
    supervisor: Arc<Supervisor>,
    descriptor: Arc<ServiceDescriptor>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let name = descriptor.name.as_str();
    let policy = &descriptor.policy;
    let probe = Probe::for_service(&descriptor);

    loop {
        let interval = match supervisor.status(name) {
            ServiceStatus::Starting => policy.startup_probe_interval,
            _ => policy.probe_interval,
        };

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return;
                }
            }
        }

        let Some(target) = supervisor.probe_target(name) else {
            return;
        };
        if !target.status.is_running() {
            continue;
        }

        let healthy = probe.check(policy.probe_timeout).await;
        supervisor.record_probe(name, target.generation, healthy);
    }
}
