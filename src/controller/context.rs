use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kube::Client;
use kube::runtime::events::{Recorder, Reporter};

use crate::config::OperatorConfig;
use crate::controller::error::{Error, ErrorContext};
use crate::controller::instance_status::InstanceStatusClient;
use crate::health::HealthState;
use crate::resources::common::FIELD_MANAGER;

/// Shared context for the controller
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    pub config: OperatorConfig,
    /// Client for the per-instance agent
    pub instances: InstanceStatusClient,
    /// Publishes Kubernetes events against clusters
    pub recorder: Recorder,
    /// Metrics and readiness, absent in tests that run the controller bare
    pub health_state: Option<Arc<HealthState>>,
    /// Consecutive failures per cluster, keyed by `namespace/name`
    error_tracker: Mutex<HashMap<String, ErrorContext>>,
}

impl Context {
    pub fn new(
        client: Client,
        config: OperatorConfig,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client.clone(), reporter),
            instances: InstanceStatusClient::new(
                config.instance_agent_port,
                config.instance_status_timeout,
            ),
            client,
            config,
            health_state,
            error_tracker: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failed pass and return how many passes failed in a row
    pub fn record_error(&self, key: &str, error: &Error) -> u32 {
        match self.error_tracker.lock() {
            Ok(mut tracker) => {
                let entry = tracker.entry(key.to_string()).or_default();
                entry.record_error(error);
                entry.consecutive_errors
            }
            Err(_) => 1,
        }
    }

    /// Forget past failures after a successful pass
    pub fn reset_errors(&self, key: &str) {
        if let Ok(mut tracker) = self.error_tracker.lock() {
            tracker.remove(key);
        }
    }
}
