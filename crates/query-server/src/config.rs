//! Server configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Configuration for the statement resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to
    pub bind_address: String,
    /// Ceiling for a client's `maxWait`
    pub max_wait_ms: u64,
    /// Payload size used when the client asks for none
    pub default_target_result_size: u64,
    /// Upper bound for a client's `targetResultSize`
    pub max_target_result_size: u64,
    /// How often sessions of forgotten queries are dropped
    pub purge_interval_ms: u64,
    /// How long a terminal query stays known to the query manager
    pub query_retention_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            max_wait_ms: 1000,
            default_target_result_size: MIB,
            max_target_result_size: 128 * MIB,
            purge_interval_ms: 200,
            query_retention_ms: 60_000,
        }
    }
}

impl ServerConfig {
    pub fn with_bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    pub fn with_max_wait_ms(mut self, max_wait_ms: u64) -> Self {
        self.max_wait_ms = max_wait_ms;
        self
    }

    pub fn with_purge_interval_ms(mut self, interval_ms: u64) -> Self {
        self.purge_interval_ms = interval_ms;
        self
    }

    pub fn with_query_retention_ms(mut self, retention_ms: u64) -> Self {
        self.query_retention_ms = retention_ms;
        self
    }

    /// Client wait bounded by the ceiling; no request means the ceiling
    pub fn clamp_wait(&self, requested: Option<Duration>) -> Duration {
        let ceiling = Duration::from_millis(self.max_wait_ms);
        requested.map_or(ceiling, |wait| wait.min(ceiling))
    }

    /// Client payload size bounded by the maximum
    pub fn clamp_target_size(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.default_target_result_size)
            .min(self.max_target_result_size)
    }
}
