use std::time::Duration;

use crate::topology::{ReadBehavior, WriteBehavior};

/// Client configuration
///
/// Controls routing behavior, timeouts, and the background maintenance
/// intervals of every request executor created from it.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-request timeout (covers connect + response)
    pub request_timeout: Duration,

    /// Interval of the periodic topology refresh task
    pub topology_refresh_interval: Duration,

    /// First re-check delay after a node is observed down
    pub health_probe_initial: Duration,

    /// Ceiling for the growing health probe delay
    pub health_probe_cap: Duration,

    /// Response-time SLA used by the SLA-aware read behaviors
    pub sla_threshold: Duration,

    /// How reads are routed across the topology
    pub read_behavior: ReadBehavior,

    /// How writes are routed (strict subset of read routing)
    pub write_behavior: WriteBehavior,

    /// Separator between the id prefix and the numeric part,
    /// e.g. '/' in "products/42-A"
    pub identity_parts_separator: char,

    /// Opaque credential forwarded on every request, if set
    pub credential: Option<String>,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            topology_refresh_interval: Duration::from_secs(300),
            health_probe_initial: Duration::from_millis(100),
            health_probe_cap: Duration::from_secs(5),
            sla_threshold: Duration::from_millis(100),
            read_behavior: ReadBehavior::LeaderOnly,
            write_behavior: WriteBehavior::LeaderOnly,
            identity_parts_separator: '/',
            credential: None,
        }
    }

    /// Set the per-request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the periodic topology refresh interval
    pub fn topology_refresh_interval(mut self, interval: Duration) -> Self {
        self.topology_refresh_interval = interval;
        self
    }

    /// Set the initial health probe delay
    pub fn health_probe_initial(mut self, delay: Duration) -> Self {
        self.health_probe_initial = delay;
        self
    }

    /// Set the health probe delay ceiling
    pub fn health_probe_cap(mut self, cap: Duration) -> Self {
        self.health_probe_cap = cap;
        self
    }

    /// Set the response-time SLA threshold
    pub fn sla_threshold(mut self, threshold: Duration) -> Self {
        self.sla_threshold = threshold;
        self
    }

    /// Set the read routing behavior
    pub fn read_behavior(mut self, behavior: ReadBehavior) -> Self {
        self.read_behavior = behavior;
        self
    }

    /// Set the write routing behavior
    pub fn write_behavior(mut self, behavior: WriteBehavior) -> Self {
        self.write_behavior = behavior;
        self
    }

    /// Set the identity parts separator
    pub fn identity_parts_separator(mut self, separator: char) -> Self {
        self.identity_parts_separator = separator;
        self
    }

    /// Set the opaque credential token
    pub fn credential(mut self, credential: &str) -> Self {
        self.credential = Some(credential.to_string());
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.request_timeout.is_zero() {
            return Err("request_timeout must be > 0".to_string());
        }

        if self.topology_refresh_interval.is_zero() {
            return Err("topology_refresh_interval must be > 0".to_string());
        }

        if self.health_probe_initial.is_zero() {
            return Err("health_probe_initial must be > 0".to_string());
        }

        if self.health_probe_initial > self.health_probe_cap {
            return Err("health_probe_initial cannot exceed health_probe_cap".to_string());
        }

        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}
