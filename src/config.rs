use crate::registry::{CommandSpec, ServicePolicy};
use crate::supervisor::RestartPolicy;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Session token settings for the identity gate
    #[serde(default)]
    pub auth: AuthSettings,

    /// Global default policy for services
    #[serde(default)]
    pub defaults: ServiceDefaults,

    /// Services keyed by logical application name
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Gateway port (default: 5000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the operator API, always bound to loopback
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Token for the operator API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            pid_file: None,
        }
    }
}

/// Session settings
#[derive(Debug, Deserialize, Clone)]
pub struct AuthSettings {
    /// HMAC secret for session tokens. Random per process when unset,
    /// which invalidates every session on restart.
    pub secret: Option<String>,

    #[serde(default = "default_token_expiry_hours")]
    pub token_expiry_hours: i64,

    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    #[serde(default = "default_true")]
    pub cookie_secure: bool,

    #[serde(default = "default_true")]
    pub cookie_http_only: bool,

    #[serde(default = "default_cookie_same_site")]
    pub cookie_same_site: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            secret: None,
            token_expiry_hours: default_token_expiry_hours(),
            cookie_name: default_cookie_name(),
            cookie_secure: true,
            cookie_http_only: true,
            cookie_same_site: default_cookie_same_site(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceDefaults {
    /// Max time a service may stay in Starting before it is treated as crashed
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Probe interval while a service is starting, in milliseconds
    #[serde(default = "default_startup_probe_interval")]
    pub startup_probe_interval_ms: u64,

    /// Probe interval once a service has started, in milliseconds
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// Deadline for a single probe, in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Liveness path probed with HTTP GET. TCP connect when unset.
    pub health_path: Option<String>,

    /// Consecutive successful probes before a service is Healthy
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,

    /// Consecutive failed probes before a Healthy service is Unhealthy
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Max time to wait for a backend response, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Delay before the first restart after a crash, in milliseconds
    #[serde(default = "default_restart_backoff_base")]
    pub restart_backoff_base_ms: u64,

    /// Upper bound on the restart delay, in milliseconds
    #[serde(default = "default_restart_backoff_max")]
    pub restart_backoff_max_ms: u64,

    /// Crashes tolerated before a service is left Crashed for good
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

impl Default for ServiceDefaults {
    fn default() -> Self {
        Self {
            startup_timeout_secs: default_startup_timeout(),
            startup_probe_interval_ms: default_startup_probe_interval(),
            probe_interval_ms: default_probe_interval(),
            probe_timeout_ms: default_probe_timeout(),
            health_path: None,
            healthy_threshold: default_healthy_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            request_timeout_secs: default_request_timeout(),
            restart_backoff_base_ms: default_restart_backoff_base(),
            restart_backoff_max_ms: default_restart_backoff_max(),
            max_restarts: default_max_restarts(),
        }
    }
}

/// Configuration for a single service
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the permissions of the
/// gateway process. Configuration files must be readable only by the
/// service user.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Program to run. Split with shell quoting rules when `args` is empty,
    /// so `command = "npm run dev"` works.
    #[serde(default)]
    pub command: String,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Environment overrides
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Port the service listens on
    pub port: u16,

    pub health_path: Option<String>,
    pub startup_timeout_secs: Option<u64>,
    pub startup_probe_interval_ms: Option<u64>,
    pub probe_interval_ms: Option<u64>,
    pub probe_timeout_ms: Option<u64>,
    pub healthy_threshold: Option<u32>,
    pub unhealthy_threshold: Option<u32>,
    pub shutdown_grace_period_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub restart_backoff_base_ms: Option<u64>,
    pub restart_backoff_max_ms: Option<u64>,
    pub max_restarts: Option<u32>,
}

impl ServiceConfig {
    /// Create a service config with defaults for every policy field
    pub fn new(command: &str, port: u16) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            port,
            health_path: None,
            startup_timeout_secs: None,
            startup_probe_interval_ms: None,
            probe_interval_ms: None,
            probe_timeout_ms: None,
            healthy_threshold: None,
            unhealthy_threshold: None,
            shutdown_grace_period_secs: None,
            request_timeout_secs: None,
            restart_backoff_base_ms: None,
            restart_backoff_max_ms: None,
            max_restarts: None,
        }
    }

    /// Set arguments (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set environment overrides (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Set working directory (builder pattern)
    pub fn with_working_dir(mut self, dir: &str) -> Self {
        self.working_dir = Some(dir.to_string());
        self
    }

    /// Resolve program and arguments
    pub fn command_spec(&self) -> Result<CommandSpec, String> {
        let (program, args) = if self.args.is_empty() {
            let mut words = shell_words::split(&self.command)
                .map_err(|e| format!("cannot parse command '{}': {}", self.command, e))?;
            if words.is_empty() {
                return Err("'command' must not be empty".to_string());
            }
            let program = words.remove(0);
            (program, words)
        } else {
            if self.command.trim().is_empty() {
                return Err("'command' must not be empty".to_string());
            }
            (self.command.clone(), self.args.clone())
        };

        Ok(CommandSpec {
            program,
            args,
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
        })
    }

    /// Resolve the effective policy against the global defaults
    pub fn policy(&self, defaults: &ServiceDefaults) -> ServicePolicy {
        ServicePolicy {
            startup_timeout: Duration::from_secs(
                self.startup_timeout_secs.unwrap_or(defaults.startup_timeout_secs),
            ),
            startup_probe_interval: Duration::from_millis(
                self.startup_probe_interval_ms
                    .unwrap_or(defaults.startup_probe_interval_ms),
            ),
            probe_interval: Duration::from_millis(
                self.probe_interval_ms.unwrap_or(defaults.probe_interval_ms),
            ),
            probe_timeout: Duration::from_millis(
                self.probe_timeout_ms.unwrap_or(defaults.probe_timeout_ms),
            ),
            health_path: self
                .health_path
                .clone()
                .or_else(|| defaults.health_path.clone()),
            healthy_threshold: self.healthy_threshold.unwrap_or(defaults.healthy_threshold),
            unhealthy_threshold: self
                .unhealthy_threshold
                .unwrap_or(defaults.unhealthy_threshold),
            shutdown_grace_period: Duration::from_secs(
                self.shutdown_grace_period_secs
                    .unwrap_or(defaults.shutdown_grace_period_secs),
            ),
            request_timeout: Duration::from_secs(
                self.request_timeout_secs
                    .unwrap_or(defaults.request_timeout_secs),
            ),
            restart: RestartPolicy {
                base: Duration::from_millis(
                    self.restart_backoff_base_ms
                        .unwrap_or(defaults.restart_backoff_base_ms),
                ),
                max: Duration::from_millis(
                    self.restart_backoff_max_ms
                        .unwrap_or(defaults.restart_backoff_max_ms),
                ),
                max_restarts: self.max_restarts.unwrap_or(defaults.max_restarts),
            },
        }
    }

    /// Validate the service configuration
    pub fn validate(&self, name: &str, defaults: &ServiceDefaults) -> Result<(), String> {
        if let Err(e) = self.command_spec() {
            return Err(format!("Service '{}': {}", name, e));
        }

        if self.port == 0 {
            return Err(format!("Service '{}': 'port' must be greater than 0", name));
        }

        let policy = self.policy(defaults);
        if policy.healthy_threshold == 0 || policy.unhealthy_threshold == 0 {
            return Err(format!(
                "Service '{}': probe thresholds must be at least 1",
                name
            ));
        }
        if policy.probe_interval.is_zero() || policy.startup_probe_interval.is_zero() {
            return Err(format!(
                "Service '{}': probe intervals must be greater than 0",
                name
            ));
        }
        if policy.restart.base > policy.restart.max {
            return Err(format!(
                "Service '{}': 'restart_backoff_base_ms' exceeds 'restart_backoff_max_ms'",
                name
            ));
        }
        if let Some(path) = &policy.health_path {
            if !path.starts_with('/') {
                return Err(format!(
                    "Service '{}': 'health_path' must start with '/'",
                    name
                ));
            }
        }

        Ok(())
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    5000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9999
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_token_expiry_hours() -> i64 {
    24
}

fn default_cookie_name() -> String {
    "portgate_session".to_string()
}

fn default_cookie_same_site() -> String {
    "Strict".to_string()
}

fn default_true() -> bool {
    true
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_startup_probe_interval() -> u64 {
    250
}

fn default_probe_interval() -> u64 {
    5000
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_healthy_threshold() -> u32 {
    1
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_shutdown_grace_period() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    30
}

fn default_restart_backoff_base() -> u64 {
    1000
}

fn default_restart_backoff_max() -> u64 {
    30_000
}

fn default_max_restarts() -> u32 {
    5
}

/// Sessions last at most a year
const MAX_TOKEN_EXPIRY_HOURS: i64 = 24 * 366;

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let mut names: Vec<&String> = self.services.keys().collect();
        names.sort();

        let mut ports: HashMap<u16, &str> = HashMap::new();
        for name in names {
            let service = &self.services[name];
            if let Err(e) = service.validate(name, &self.defaults) {
                errors.push(e);
            }
            if service.port != 0 {
                if let Some(other) = ports.insert(service.port, name) {
                    errors.push(format!(
                        "Service '{}': port {} is already used by '{}'",
                        name, service.port, other
                    ));
                }
            }
        }

        if self.auth.token_expiry_hours <= 0 {
            errors.push("auth: 'token_expiry_hours' must be positive".to_string());
        } else if self.auth.token_expiry_hours > MAX_TOKEN_EXPIRY_HOURS {
            errors.push(format!(
                "auth: 'token_expiry_hours' must be at most {}",
                MAX_TOKEN_EXPIRY_HOURS
            ));
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

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
bind = "127.0.0.1"
admin_port = 9000

[defaults]
probe_interval_ms = 5000
health_path = "/healthz"

[services.portal]
command = "node"
args = ["server.js"]
port = 5000
working_dir = "/srv/portal"

[services.scanner]
command = "npm run dev"
port = 5006
max_restarts = 2
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.admin_port, 9000);
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services["scanner"].max_restarts, Some(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 5000);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.admin_port, 9999);
        assert_eq!(config.pool_max_idle_per_host, 10);
        assert_eq!(config.pool_idle_timeout_secs, 90);
    }

    #[test]
    fn test_default_service_defaults() {
        let defaults = ServiceDefaults::default();
        assert_eq!(defaults.startup_timeout_secs, 30);
        assert_eq!(defaults.probe_interval_ms, 5000);
        assert_eq!(defaults.probe_timeout_ms, 2000);
        assert!(defaults.health_path.is_none());
        assert_eq!(defaults.healthy_threshold, 1);
        assert_eq!(defaults.unhealthy_threshold, 3);
        assert_eq!(defaults.restart_backoff_base_ms, 1000);
        assert_eq!(defaults.restart_backoff_max_ms, 30_000);
        assert_eq!(defaults.max_restarts, 5);
    }

    #[test]
    fn test_policy_uses_defaults() {
        let defaults = ServiceDefaults::default();
        let service = ServiceConfig::new("node server.js", 3000);
        let policy = service.policy(&defaults);

        assert_eq!(policy.startup_timeout, Duration::from_secs(30));
        assert_eq!(policy.probe_interval, Duration::from_secs(5));
        assert_eq!(policy.probe_timeout, Duration::from_secs(2));
        assert_eq!(policy.unhealthy_threshold, 3);
        assert_eq!(policy.restart.base, Duration::from_secs(1));
        assert_eq!(policy.restart.max_restarts, 5);
        assert!(policy.health_path.is_none());
    }

    #[test]
    fn test_policy_overrides_defaults() {
        let defaults = ServiceDefaults::default();
        let service: ServiceConfig = toml::from_str(
            r#"
command = "node"
port = 3000
health_path = "/ready"
probe_interval_ms = 1000
unhealthy_threshold = 5
healthy_threshold = 2
restart_backoff_base_ms = 200
restart_backoff_max_ms = 800
max_restarts = 1
request_timeout_secs = 7
"#,
        )
        .unwrap();
        let policy = service.policy(&defaults);

        assert_eq!(policy.health_path.as_deref(), Some("/ready"));
        assert_eq!(policy.probe_interval, Duration::from_secs(1));
        assert_eq!(policy.unhealthy_threshold, 5);
        assert_eq!(policy.healthy_threshold, 2);
        assert_eq!(policy.restart.base, Duration::from_millis(200));
        assert_eq!(policy.restart.max, Duration::from_millis(800));
        assert_eq!(policy.restart.max_restarts, 1);
        assert_eq!(policy.request_timeout, Duration::from_secs(7));
    }

    #[test]
    fn test_command_string_is_split() {
        let service = ServiceConfig::new("npm run 'dev server'", 3000);
        let spec = service.command_spec().unwrap();
        assert_eq!(spec.program, "npm");
        assert_eq!(spec.args, vec!["run", "dev server"]);
    }

    #[test]
    fn test_explicit_args_are_not_split() {
        let service =
            ServiceConfig::new("/opt/my app/bin", 3000).with_args(vec!["--flag".to_string()]);
        let spec = service.command_spec().unwrap();
        assert_eq!(spec.program, "/opt/my app/bin");
        assert_eq!(spec.args, vec!["--flag"]);
    }

    #[test]
    fn test_service_env_and_working_dir() {
        let toml = r#"
command = "node"
port = 3000
working_dir = "apps/crm"

[env]
NODE_ENV = "production"
"#;
        let service: ServiceConfig = toml::from_str(toml).unwrap();
        let spec = service.command_spec().unwrap();
        assert_eq!(spec.working_dir.as_deref(), Some("apps/crm"));
        assert_eq!(spec.env.get("NODE_ENV"), Some(&"production".to_string()));
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.auth.cookie_name, "portgate_session");
        assert!(config.services.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_command() {
        let toml = r#"
[services.crm]
port = 3000
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("Service 'crm'"));
        assert!(err.contains("'command' must not be empty"));
    }

    #[test]
    fn test_validate_port_nonzero() {
        let toml = r#"
[services.crm]
command = "node"
port = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'port' must be greater than 0"));
    }

    #[test]
    fn test_validate_duplicate_ports() {
        let toml = r#"
[services.crm]
command = "node"
port = 5001

[services.payments]
command = "node"
port = 5001
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("port 5001 is already used by 'crm'"));
    }

    #[test]
    fn test_validate_backoff_bounds() {
        let mut service = ServiceConfig::new("node", 3000);
        service.restart_backoff_base_ms = Some(5000);
        service.restart_backoff_max_ms = Some(1000);
        let err = service
            .validate("crm", &ServiceDefaults::default())
            .unwrap_err();
        assert!(err.contains("restart_backoff_base_ms"));
    }

    #[test]
    fn test_validate_probe_intervals_nonzero() {
        let mut service = ServiceConfig::new("node", 3000);
        service.probe_interval_ms = Some(0);
        let err = service
            .validate("crm", &ServiceDefaults::default())
            .unwrap_err();
        assert!(err.contains("probe intervals must be greater than 0"));

        let defaults = ServiceDefaults {
            startup_probe_interval_ms: 0,
            ..ServiceDefaults::default()
        };
        let err = ServiceConfig::new("node", 3000)
            .validate("crm", &defaults)
            .unwrap_err();
        assert!(err.contains("probe intervals must be greater than 0"));
    }

    #[test]
    fn test_validate_token_expiry_bounds() {
        let config: Config =
            toml::from_str("[auth]\ntoken_expiry_hours = 9223372036854775807\n").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'token_expiry_hours' must be at most"), "{}", err);

        let config: Config = toml::from_str("[auth]\ntoken_expiry_hours = 0\n").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'token_expiry_hours' must be positive"), "{}", err);

        let config: Config = toml::from_str("[auth]\ntoken_expiry_hours = 720\n").unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[services.a]
port = 3000

[services.b]
command = "node"
port = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("Service 'a'"));
        assert!(err.contains("Service 'b'"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portgate.toml");
        std::fs::write(
            &path,
            r#"
[services.scanner]
command = "node index.js"
port = 5006
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.services["scanner"].port, 5006);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portgate.toml");
        std::fs::write(&path, "[services.scanner]\nport = 0\ncommand = \"x\"\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
