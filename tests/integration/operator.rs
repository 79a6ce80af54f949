//! Operator spawning utilities for integration tests
//!
//! Each test gets its own operator instance scoped to the test namespace, so
//! tests never reconcile each other's clusters.

use kube::Client;
use postgres_topology_operator::{OperatorConfig, run_controller_scoped};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A scoped operator that runs for the duration of a test
pub struct ScopedOperator {
    handle: JoinHandle<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ScopedOperator {
    /// Start a controller watching only `namespace`
    ///
    /// The operator is stopped when dropped.
    pub async fn start(client: Client, namespace: &str) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let namespace = namespace.to_string();

        // Short resyncs keep the tests responsive
        let config = OperatorConfig {
            resync_interval: Duration::from_secs(5),
            in_flight_resync_interval: Duration::from_secs(2),
            watch_namespace: Some(namespace.clone()),
            ..OperatorConfig::default()
        };

        tracing::info!(namespace = %namespace, "Starting scoped operator controller...");

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = run_controller_scoped(client, config, None, Some(&namespace)) => {
                    tracing::debug!("Operator exited normally");
                }
                _ = shutdown_rx => {
                    tracing::debug!("Operator received shutdown signal");
                }
            }
        });

        // Give the controller a moment to start watching
        tokio::time::sleep(Duration::from_millis(100)).await;

        Self {
            handle,
            shutdown_tx: Some(shutdown_tx),
        }
    }
}

impl Drop for ScopedOperator {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}
