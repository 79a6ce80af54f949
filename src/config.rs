//! Operator configuration
//!
//! Everything the operator reads from its own environment lives here. Values
//! that fail to parse fall back to their defaults with a warning so that a typo
//! in a Deployment manifest never keeps the operator from starting.

use std::time::Duration;

use tracing::warn;

/// Default periodic resync interval
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 30;

/// Resync interval while a transition is in flight
pub const DEFAULT_IN_FLIGHT_RESYNC_SECS: u64 = 5;

/// Port the per-instance agent serves its status API on
pub const DEFAULT_INSTANCE_AGENT_PORT: u16 = 8000;

/// Timeout for a single call to an instance agent or database
pub const DEFAULT_INSTANCE_STATUS_TIMEOUT_SECS: u64 = 5;

/// Runtime configuration of the operator
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Periodic resync independent of watch events
    pub resync_interval: Duration,
    /// Resync used while a failover, switchover or bootstrap is running
    pub in_flight_resync_interval: Duration,
    /// Replicas whose replay position trails the best received position by
    /// more than this many bytes are not promotable. `None` disables the check.
    pub failover_max_lag_bytes: Option<u64>,
    pub instance_agent_port: u16,
    pub instance_status_timeout: Duration,
    /// Restrict the controller to one namespace
    pub watch_namespace: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_INTERVAL_SECS),
            in_flight_resync_interval: Duration::from_secs(DEFAULT_IN_FLIGHT_RESYNC_SECS),
            failover_max_lag_bytes: None,
            instance_agent_port: DEFAULT_INSTANCE_AGENT_PORT,
            instance_status_timeout: Duration::from_secs(DEFAULT_INSTANCE_STATUS_TIMEOUT_SECS),
            watch_namespace: None,
        }
    }
}

impl OperatorConfig {
    /// Build the configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let resync_interval = parse_or("RESYNC_INTERVAL_SECS", &lookup)
            .map(Duration::from_secs)
            .unwrap_or(defaults.resync_interval);
        let in_flight_resync_interval = parse_or("IN_FLIGHT_RESYNC_SECS", &lookup)
            .map(Duration::from_secs)
            .unwrap_or(defaults.in_flight_resync_interval);
        let instance_status_timeout = parse_or("INSTANCE_STATUS_TIMEOUT_SECS", &lookup)
            .map(Duration::from_secs)
            .unwrap_or(defaults.instance_status_timeout);

        Self {
            resync_interval,
            in_flight_resync_interval,
            failover_max_lag_bytes: parse_or("FAILOVER_MAX_LAG_BYTES", &lookup),
            instance_agent_port: parse_or("INSTANCE_AGENT_PORT", &lookup)
                .unwrap_or(defaults.instance_agent_port),
            instance_status_timeout,
            watch_namespace: lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty()),
        }
    }
}

fn parse_or<T, F>(key: &str, lookup: &F) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparsable configuration value");
            None
        }
    }
}
