//! Portgate - supervises a fleet of local web services behind one
//! authenticated gateway
//!
//! This library provides:
//! - A static service registry mapping names to ports and launch commands
//! - A process supervisor with crash restarts and exponential backoff
//! - A health prober that drives each service's status from real probes
//! - A reverse proxy that routes `/proxy/:port/*` and `/app/:name/*`,
//!   including WebSocket upgrades, only to healthy services
//! - A session gate in front of every routed request
//! - An operator API for status and lifecycle control

pub mod admin;
pub mod auth;
pub mod config;
pub mod error;
pub mod healthcheck;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod supervisor;
