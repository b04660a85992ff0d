//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the reverse proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Upstream target and pool settings.
    pub upstream: UpstreamConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "127.0.0.1:8000").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8000".to_string(),
        }
    }
}

/// Upstream target configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Backend address every pooled connection targets (e.g., "127.0.0.1:9000").
    pub address: String,

    /// Number of upstream connections established eagerly at startup.
    /// Fixed for the lifetime of the process.
    pub pool_size: usize,

    /// What to do with a new client when every pool slot is taken.
    pub admission: AdmissionPolicy,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9000".to_string(),
            pool_size: 4,
            admission: AdmissionPolicy::Reject,
        }
    }
}

/// Admission control when the pool is exhausted.
///
/// This is a contract, not an accident: a client that arrives with no
/// AVAILABLE upstream is either closed immediately or parked in FIFO order
/// until a slot is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Close the new client connection immediately.
    #[default]
    Reject,
    /// Hold the client unserved until an upstream slot frees up.
    Queue,
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default tracing filter when RUST_LOG is unset.
    pub log_filter: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: "relay_proxy=info".to_string(),
        }
    }
}
