use portgate::admin::{AdminServer, PKG_NAME, VERSION};
use portgate::auth::{AuthConfig, IdentityGate, JwtSessions};
use portgate::config::Config;
use portgate::healthcheck::HealthProber;
use portgate::pool::{ConnectionPool, PoolConfig};
use portgate::proxy::GatewayServer;
use portgate::registry::ServiceRegistry;
use portgate::supervisor::Supervisor;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("portgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("portgate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    // A bad registry is fatal: nothing is spawned
    let registry = ServiceRegistry::from_config(&config).map_err(|e| {
        error!(error = %e, "Invalid service registry");
        anyhow::anyhow!(e)
    })?;

    print_startup_banner(&config, &registry);

    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let gateway_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid gateway bind address");
            anyhow::anyhow!("Invalid gateway bind address: {}", e)
        })?;

    let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;

    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    if config.auth.secret.is_none() {
        warn!("No auth.secret configured; sessions will not survive a restart");
    }
    let sessions = Arc::new(JwtSessions::new(AuthConfig::from(&config.auth)));
    let gate = Arc::new(IdentityGate::new(
        Arc::clone(&sessions) as Arc<dyn portgate::auth::SessionValidator>,
        config.auth.cookie_name.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor = Supervisor::new(Arc::new(registry));
    supervisor.start_all().await;

    let prober = HealthProber::new(Arc::clone(&supervisor), shutdown_rx.clone());
    let prober_handle = tokio::spawn(prober.run());

    let pool = Arc::new(ConnectionPool::new(PoolConfig::from(&config.server)));

    let gateway = GatewayServer::new(
        gateway_addr,
        Arc::clone(&supervisor),
        Arc::clone(&gate),
        Arc::clone(&pool),
        shutdown_rx.clone(),
    );
    let gateway_handle = tokio::spawn(async move {
        if let Err(e) = gateway.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    let admin_server = AdminServer::new(
        admin_addr,
        Arc::clone(&supervisor),
        Arc::clone(&sessions),
        Arc::clone(&gate),
        Arc::clone(&pool),
        shutdown_rx.clone(),
        admin_token,
    );
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    info!("Stopping all services...");
    supervisor.stop_all().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = gateway_handle.await;
        let _ = admin_handle.await;
        let _ = prober_handle.await;
    })
    .await;

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;

        // Lock is held for as long as the handle is open
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;

        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config, registry: &ServiceRegistry) {
    info!(name = PKG_NAME, version = VERSION, "Starting service gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = config.server.admin_port,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        startup_timeout_secs = config.defaults.startup_timeout_secs,
        request_timeout_secs = config.defaults.request_timeout_secs,
        shutdown_grace_period_secs = config.defaults.shutdown_grace_period_secs,
        "Supervision defaults"
    );
    info!(
        probe_interval_ms = config.defaults.probe_interval_ms,
        probe_timeout_ms = config.defaults.probe_timeout_ms,
        healthy_threshold = config.defaults.healthy_threshold,
        unhealthy_threshold = config.defaults.unhealthy_threshold,
        "Health probe settings"
    );
    info!(
        restart_backoff_base_ms = config.defaults.restart_backoff_base_ms,
        restart_backoff_max_ms = config.defaults.restart_backoff_max_ms,
        max_restarts = config.defaults.max_restarts,
        "Restart policy"
    );
    for descriptor in registry.all() {
        info!(service = %descriptor.name, port = descriptor.port, "Registered service");
    }
}
