//! Wait condition helpers for PostgresCluster resources

use kube::Api;
use kube::runtime::wait::{Condition, await_condition};
use postgres_topology_operator::crd::{ClusterPhase, PostgresCluster};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WaitError {
    #[error("Timeout waiting for condition")]
    Timeout,

    #[error("Watch error: {0}")]
    Watch(#[from] kube::runtime::wait::Error),

    #[error("Resource not found after wait")]
    ResourceNotFound,
}

/// Condition that checks if PostgresCluster is in a specific phase
pub fn is_phase(expected: ClusterPhase) -> impl Condition<PostgresCluster> {
    move |obj: Option<&PostgresCluster>| {
        obj.and_then(|cluster| cluster.status.as_ref())
            .and_then(|status| status.phase)
            .is_some_and(|phase| phase == expected)
    }
}

/// Condition that checks if readyInstances >= expected
pub fn has_ready_instances(expected: i32) -> impl Condition<PostgresCluster> {
    move |obj: Option<&PostgresCluster>| {
        obj.and_then(|cluster| cluster.status.as_ref())
            .is_some_and(|status| status.ready_instances >= expected)
    }
}

/// Condition that checks if currentPrimary is set
pub fn has_current_primary() -> impl Condition<PostgresCluster> {
    |obj: Option<&PostgresCluster>| {
        obj.and_then(|cluster| cluster.status.as_ref())
            .is_some_and(|status| !status.current_primary.is_empty())
    }
}

/// Condition that checks if latestGeneratedNode reached `expected`
pub fn has_generated_node(expected: i32) -> impl Condition<PostgresCluster> {
    move |obj: Option<&PostgresCluster>| {
        obj.and_then(|cluster| cluster.status.as_ref())
            .is_some_and(|status| status.latest_generated_node >= expected)
    }
}

/// Condition that checks if a condition type carries the given reason
pub fn has_condition_reason(type_: &str, reason: &str) -> impl Condition<PostgresCluster> {
    let cond_type = type_.to_string();
    let reason = reason.to_string();
    move |obj: Option<&PostgresCluster>| {
        obj.and_then(|cluster| cluster.status.as_ref())
            .is_some_and(|s| {
                s.conditions
                    .iter()
                    .any(|c| c.type_ == cond_type && c.reason == reason)
            })
    }
}

/// Condition that checks if observed_generation matches metadata.generation
pub fn generation_observed() -> impl Condition<PostgresCluster> {
    |obj: Option<&PostgresCluster>| {
        obj.is_some_and(|cluster| {
            let generation = cluster.metadata.generation;
            let observed = cluster.status.as_ref().and_then(|s| s.observed_generation);
            generation == observed
        })
    }
}

/// Wait for a PostgresCluster to satisfy `condition`
pub async fn wait_for_cluster<C>(
    api: &Api<PostgresCluster>,
    name: &str,
    condition: C,
    timeout: Duration,
) -> Result<PostgresCluster, WaitError>
where
    C: Condition<PostgresCluster>,
{
    match tokio::time::timeout(timeout, await_condition(api.clone(), name, condition)).await {
        Ok(Ok(Some(cluster))) => Ok(cluster),
        Ok(Ok(None)) => Err(WaitError::ResourceNotFound),
        Ok(Err(e)) => Err(WaitError::Watch(e)),
        Err(_) => Err(WaitError::Timeout),
    }
}
