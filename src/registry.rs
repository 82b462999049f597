//! Static table of services: logical name -> port and launch command.
//!
//! The registry is built once at boot and is read-only afterwards, so it is
//! shared as a plain `Arc<ServiceRegistry>` with no locking.

use crate::config::Config;
use crate::supervisor::RestartPolicy;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("service name '{0}' is already registered")]
    DuplicateName(String),
    #[error("port {port} is already registered to '{existing}'")]
    DuplicatePort { port: u16, existing: String },
    #[error("service '{0}' has an invalid port")]
    InvalidPort(String),
    #[error("invalid configuration for service '{name}': {reason}")]
    InvalidCommand { name: String, reason: String },
    #[error("no service registered for '{0}'")]
    NotFound(String),
}

/// How to launch a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: HashMap<String, String>,
}

/// Effective supervision, probing and routing policy for one service
#[derive(Debug, Clone)]
pub struct ServicePolicy {
    pub startup_timeout: Duration,
    pub startup_probe_interval: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub health_path: Option<String>,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
    pub shutdown_grace_period: Duration,
    pub request_timeout: Duration,
    pub restart: RestartPolicy,
}

impl Default for ServicePolicy {
    fn default() -> Self {
        crate::config::ServiceConfig::new("", 0).policy(&Default::default())
    }
}

#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub port: u16,
    pub command: CommandSpec,
    pub policy: ServicePolicy,
}

impl ServiceDescriptor {
    pub fn new(name: &str, port: u16, command: CommandSpec) -> Self {
        Self {
            name: name.to_string(),
            port,
            command,
            policy: ServicePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ServicePolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: Vec<Arc<ServiceDescriptor>>,
    by_name: HashMap<String, usize>,
    by_port: HashMap<u16, usize>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from configuration. Services are registered in
    /// name order so `all()` is deterministic.
    pub fn from_config(config: &Config) -> Result<Self, RegistryError> {
        let mut registry = Self::new();

        let mut names: Vec<&String> = config.services.keys().collect();
        names.sort();

        for name in names {
            let service = &config.services[name];
            let command = service
                .command_spec()
                .map_err(|reason| RegistryError::InvalidCommand {
                    name: name.clone(),
                    reason,
                })?;
            let descriptor = ServiceDescriptor::new(name, service.port, command)
                .with_policy(service.policy(&config.defaults));
            registry.register(descriptor)?;
        }

        Ok(registry)
    }

    pub fn register(&mut self, descriptor: ServiceDescriptor) -> Result<(), RegistryError> {
        if descriptor.port == 0 {
            return Err(RegistryError::InvalidPort(descriptor.name));
        }
        if self.by_name.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateName(descriptor.name));
        }
        if let Some(&idx) = self.by_port.get(&descriptor.port) {
            return Err(RegistryError::DuplicatePort {
                port: descriptor.port,
                existing: self.services[idx].name.clone(),
            });
        }

        let idx = self.services.len();
        self.by_name.insert(descriptor.name.clone(), idx);
        self.by_port.insert(descriptor.port, idx);
        self.services.push(Arc::new(descriptor));
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<&Arc<ServiceDescriptor>, RegistryError> {
        self.by_name
            .get(name)
            .map(|&idx| &self.services[idx])
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn lookup_port(&self, port: u16) -> Result<&Arc<ServiceDescriptor>, RegistryError> {
        self.by_port
            .get(&port)
            .map(|&idx| &self.services[idx])
            .ok_or_else(|| RegistryError::NotFound(port.to_string()))
    }

    /// All descriptors in registration order
    pub fn all(&self) -> impl Iterator<Item = &Arc<ServiceDescriptor>> + '_ {
        self.services.iter()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;

    fn descriptor(name: &str, port: u16) -> ServiceDescriptor {
        let command = ServiceConfig::new("node server.js", port).command_spec().unwrap();
        ServiceDescriptor::new(name, port, command)
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ServiceRegistry::new();
        registry.register(descriptor("scanner", 5006)).unwrap();
        registry.register(descriptor("crm", 5002)).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup("scanner").unwrap().port, 5006);
        assert_eq!(registry.lookup_port(5002).unwrap().name, "crm");
        assert_eq!(
            registry.lookup("missing").unwrap_err(),
            RegistryError::NotFound("missing".to_string())
        );
        assert!(registry.lookup_port(9999).is_err());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = ServiceRegistry::new();
        registry.register(descriptor("scanner", 5006)).unwrap();
        let err = registry.register(descriptor("scanner", 5007)).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateName("scanner".to_string()));
        // The rejected entry left nothing behind
        assert!(registry.lookup_port(5007).is_err());
    }

    #[test]
    fn test_duplicate_port_rejected() {
        let mut registry = ServiceRegistry::new();
        registry.register(descriptor("scanner", 5006)).unwrap();
        let err = registry.register(descriptor("tracker", 5006)).unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicatePort {
                port: 5006,
                existing: "scanner".to_string()
            }
        );
        assert!(registry.lookup("tracker").is_err());
    }

    #[test]
    fn test_zero_port_rejected() {
        let mut registry = ServiceRegistry::new();
        assert_eq!(
            registry.register(descriptor("bad", 0)).unwrap_err(),
            RegistryError::InvalidPort("bad".to_string())
        );
    }

    #[test]
    fn test_all_is_ordered_and_restartable() {
        let mut registry = ServiceRegistry::new();
        registry.register(descriptor("a", 5001)).unwrap();
        registry.register(descriptor("b", 5002)).unwrap();

        let first: Vec<_> = registry.all().map(|d| d.name.clone()).collect();
        let second: Vec<_> = registry.all().map(|d| d.name.clone()).collect();
        assert_eq!(first, vec!["a", "b"]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_from_config_sorted_by_name() {
        let mut config: Config = toml::from_str("").unwrap();
        config
            .services
            .insert("tracker".to_string(), ServiceConfig::new("node", 5004));
        config
            .services
            .insert("checkout".to_string(), ServiceConfig::new("node", 5003));

        let registry = ServiceRegistry::from_config(&config).unwrap();
        let names: Vec<_> = registry.all().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["checkout", "tracker"]);
    }

    #[test]
    fn test_from_config_duplicate_port_is_fatal() {
        let mut config: Config = toml::from_str("").unwrap();
        config
            .services
            .insert("a".to_string(), ServiceConfig::new("node", 5001));
        config
            .services
            .insert("b".to_string(), ServiceConfig::new("node", 5001));

        let err = ServiceRegistry::from_config(&config).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicatePort { port: 5001, .. }));
    }
}
